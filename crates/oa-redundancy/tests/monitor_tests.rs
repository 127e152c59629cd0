//! ---
//! oa_section: "07-resilience-fault-tolerance"
//! oa_subsection: "module"
//! oa_type: "source"
//! oa_scope: "code"
//! oa_description: "Dual-controller discovery, role tracking and failover."
//! oa_version: "v0.0.0-prealpha"
//! oa_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use oa_common::{new_registry, render};
use oa_redundancy::{
    FailoverReason, RedundancyCoordinator, RedundancyMetrics, RedundancySettings,
};
use oa_session::{
    Credentials, OaInfo, OaNetworkInfo, OaRole, OaStatus, Session, SessionProvider,
    SimulatedBay, SimulatedEnclosure, SoapSession, UserInfo,
};
use parking_lot::Mutex;

const BAY1: &str = "10.0.0.1";
const BAY2: &str = "10.0.0.2";

fn settings() -> RedundancySettings {
    RedundancySettings {
        poll_interval: Duration::from_millis(20),
        absent_poll_interval: Duration::from_millis(20),
        reconnect_backoff: Duration::from_millis(10),
        stabilize_timeout: Duration::from_millis(20),
        switchover_wait: Duration::from_millis(10),
        switchover_retries: 2,
        ..RedundancySettings::new(Credentials::new("admin", "secret"))
    }
}

fn enclosure_with(bay1: SimulatedBay, bay2: SimulatedBay) -> SimulatedEnclosure {
    SimulatedEnclosure::new(bay1, bay2).with_user("secret", UserInfo::administrator("admin", 16, 8))
}

fn enclosure() -> SimulatedEnclosure {
    enclosure_with(
        SimulatedBay::new(BAY1, OaRole::Active),
        SimulatedBay::new(BAY2, OaRole::Standby),
    )
}

fn started(enclosure: &SimulatedEnclosure, settings: RedundancySettings) -> RedundancyCoordinator {
    let coordinator = RedundancyCoordinator::new(Arc::new(enclosure.clone()), settings);
    coordinator.discover(BAY1, BAY2).expect("discovery succeeds");
    coordinator
}

fn started_with_metrics(
    enclosure: &SimulatedEnclosure,
) -> (RedundancyCoordinator, RedundancyMetrics) {
    let metrics = RedundancyMetrics::new(new_registry()).unwrap();
    let coordinator = RedundancyCoordinator::with_metrics(
        Arc::new(enclosure.clone()),
        settings(),
        metrics.clone(),
    );
    coordinator.discover(BAY1, BAY2).expect("discovery succeeds");
    (coordinator, metrics)
}

fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

fn subscribed(coordinator: &RedundancyCoordinator, bay: u8) -> bool {
    coordinator
        .controller(bay)
        .is_some_and(|snapshot| snapshot.connected && snapshot.event_pid.is_some())
}

fn authoritative_address(coordinator: &RedundancyCoordinator) -> Option<String> {
    coordinator
        .authoritative()
        .map(|session| session.address().to_owned())
}

#[test]
fn standby_is_promoted_when_the_active_controller_is_lost() {
    let enclosure = enclosure();
    let (coordinator, metrics) = started_with_metrics(&enclosure);

    enclosure.set_reachable(1, false);
    enclosure.set_role(2, OaRole::Active);
    enclosure.set_role(1, OaRole::Standby);

    eventually("promotion of bay 2", || {
        authoritative_address(&coordinator).as_deref() == Some(BAY2)
    });
    assert_eq!(coordinator.promotion_count(), 1);
    assert_eq!(coordinator.active_bay(), Some(2));
    assert_eq!(coordinator.session_for_call().unwrap().address(), BAY2);

    let last = coordinator.failover_history().pop().unwrap();
    assert_eq!(last.bay, 2);
    assert_eq!(last.previous_bay, Some(1));
    assert_eq!(last.reason, FailoverReason::Promotion);

    let text = render(&metrics.registry()).unwrap();
    assert!(text.contains("oa_redundancy_failovers_total{bay=\"2\"} 1"), "{text}");

    eventually("bay 1 sessions dropped", || {
        coordinator.controller(1).is_some_and(|snapshot| !snapshot.connected)
    });
    assert!(coordinator.shutdown().is_clean());
}

#[test]
fn switchover_and_back_moves_the_authoritative_session_twice() {
    let enclosure = enclosure();
    let coordinator = started(&enclosure, settings());

    enclosure.switch_over();
    eventually("switch to bay 2", || {
        authoritative_address(&coordinator).as_deref() == Some(BAY2)
    });
    eventually("bay 1 seen as standby", || {
        coordinator
            .controller(1)
            .is_some_and(|snapshot| snapshot.role == OaRole::Standby)
    });

    enclosure.switch_over();
    eventually("switch back to bay 1", || {
        authoritative_address(&coordinator).as_deref() == Some(BAY1)
    });
    assert_eq!(coordinator.promotion_count(), 2);

    let history = coordinator.failover_history();
    assert_eq!(history.len(), 3);
    assert_eq!((history[0].bay, history[0].previous_bay), (1, None));
    assert_eq!((history[1].bay, history[1].previous_bay), (2, Some(1)));
    let last = history.last().unwrap();
    assert_eq!((last.bay, last.previous_bay), (1, Some(2)));

    // Exactly one controller is ever recorded as Active.
    let active = coordinator
        .controllers()
        .iter()
        .filter(|snapshot| snapshot.role == OaRole::Active)
        .count();
    assert_eq!(active, 1);
}

#[test]
fn monitor_reconnects_after_an_outage() {
    let enclosure = enclosure();
    let (coordinator, metrics) = started_with_metrics(&enclosure);
    eventually("bay 2 subscription", || subscribed(&coordinator, 2));

    enclosure.set_reachable(2, false);
    eventually("bay 2 sessions dropped", || {
        coordinator.controller(2).is_some_and(|snapshot| !snapshot.connected)
    });
    eventually("a failed reconnect", || {
        render(&metrics.registry())
            .unwrap()
            .contains("bay=\"2\",outcome=\"failure\"")
    });

    enclosure.set_reachable(2, true);
    eventually("bay 2 reconnected", || subscribed(&coordinator, 2));
    let text = render(&metrics.registry()).unwrap();
    assert!(text.contains("bay=\"2\",outcome=\"success\""), "{text}");
    assert_eq!(coordinator.controller(2).unwrap().role, OaRole::Standby);
    assert_eq!(authoritative_address(&coordinator).as_deref(), Some(BAY1));
    assert_eq!(coordinator.promotion_count(), 0);
}

#[test]
fn standby_keeps_its_sessions_through_a_short_switchover() {
    let enclosure = enclosure();
    let settings = RedundancySettings {
        switchover_wait: Duration::from_millis(200),
        switchover_retries: 5,
        ..settings()
    };
    let coordinator = started(&enclosure, settings);
    eventually("bay 2 subscription", || subscribed(&coordinator, 2));
    let opened = enclosure.open_count(BAY2);

    enclosure.set_reachable(2, false);
    thread::sleep(Duration::from_millis(100));
    enclosure.set_reachable(2, true);
    thread::sleep(Duration::from_millis(400));

    assert_eq!(enclosure.open_count(BAY2), opened);
    assert!(subscribed(&coordinator, 2));
}

#[test]
fn old_firmware_gets_no_switchover_grace() {
    let enclosure = enclosure_with(
        SimulatedBay::new(BAY1, OaRole::Active).with_firmware("2.10"),
        SimulatedBay::new(BAY2, OaRole::Standby).with_firmware("2.10"),
    );
    let settings = RedundancySettings {
        switchover_wait: Duration::from_secs(30),
        switchover_retries: 5,
        ..settings()
    };
    let coordinator = started(&enclosure, settings);
    eventually("bay 2 subscription", || subscribed(&coordinator, 2));
    assert_eq!(coordinator.active_firmware_version(), 2.10);
    let opened = enclosure.open_count(BAY2);

    enclosure.set_reachable(2, false);
    eventually("reconnect attempt", || enclosure.open_count(BAY2) > opened);
    enclosure.set_reachable(2, true);
    eventually("bay 2 reconnected", || subscribed(&coordinator, 2));
}

#[test]
fn extraction_and_insertion_drive_the_monitor() {
    let enclosure = enclosure();
    let coordinator = started(&enclosure, settings());
    eventually("bay 2 subscription", || subscribed(&coordinator, 2));

    enclosure.set_role(2, OaRole::Absent);
    coordinator.controller_extracted(2).unwrap();
    eventually("bay 2 extracted", || {
        coordinator
            .controller(2)
            .is_some_and(|snapshot| snapshot.role == OaRole::Absent && !snapshot.connected)
    });
    assert_eq!(authoritative_address(&coordinator).as_deref(), Some(BAY1));

    enclosure.set_role(2, OaRole::Standby);
    coordinator.controller_inserted(2).unwrap();
    eventually("bay 2 back", || {
        subscribed(&coordinator, 2)
            && coordinator
                .controller(2)
                .is_some_and(|snapshot| snapshot.role == OaRole::Standby && snapshot.address == BAY2)
    });
}

#[test]
fn event_notification_cuts_the_poll_interval_short() {
    let enclosure = enclosure();
    let settings = RedundancySettings {
        poll_interval: Duration::from_secs(60),
        ..settings()
    };
    let coordinator = started(&enclosure, settings);
    eventually("bay 2 subscription", || subscribed(&coordinator, 2));

    enclosure.switch_over();
    coordinator.notify_events(2).unwrap();
    eventually("promotion after notification", || {
        authoritative_address(&coordinator).as_deref() == Some(BAY2)
    });

    let started = Instant::now();
    assert!(coordinator.shutdown().is_clean());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn stuck_transition_is_counted_and_sessions_survive() {
    let enclosure = enclosure();
    let (coordinator, metrics) = started_with_metrics(&enclosure);
    eventually("bay 2 subscription", || subscribed(&coordinator, 2));

    enclosure.script_roles(2, [OaRole::Transition; 4]);
    eventually("two stuck transitions", || {
        render(&metrics.registry())
            .unwrap()
            .contains("oa_redundancy_stuck_transitions_total{bay=\"2\"} 2")
    });
    assert!(coordinator.controller(2).unwrap().connected);
    assert_eq!(authoritative_address(&coordinator).as_deref(), Some(BAY1));
}

#[test]
fn shutdown_joins_monitors_and_closes_every_session() {
    let enclosure = enclosure();
    let coordinator = started(&enclosure, settings());
    eventually("both subscriptions", || {
        subscribed(&coordinator, 1) && subscribed(&coordinator, 2)
    });

    let started = Instant::now();
    let report = coordinator.shutdown();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.joined, vec![1, 2]);
    assert!(report.panicked.is_empty());
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.sessions_closed, 6);
    assert_eq!(enclosure.open_sessions(), 0);
    assert!(coordinator.authoritative().is_none());

    // Idempotent.
    assert_eq!(coordinator.shutdown(), report);
}

#[test]
fn dropping_the_coordinator_shuts_it_down() {
    let enclosure = enclosure();
    let coordinator = started(&enclosure, settings());
    eventually("bay 2 subscription", || subscribed(&coordinator, 2));
    drop(coordinator);
    assert_eq!(enclosure.open_sessions(), 0);
}

#[test]
fn concurrent_discovery_is_serialised() {
    let enclosure = enclosure();
    let coordinator = RedundancyCoordinator::new(Arc::new(enclosure.clone()), settings());
    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| coordinator.discover(BAY1, BAY2).unwrap());
        }
    });
    assert_eq!(coordinator.failover_history().len(), 1);
    eventually("bay 1 subscription", || subscribed(&coordinator, 1));
    // Data and event sessions from discovery plus the monitor's aux session.
    assert_eq!(enclosure.open_count(BAY1), 3);
}

#[test]
fn readers_and_failovers_do_not_deadlock() {
    let enclosure = enclosure();
    let coordinator = started(&enclosure, settings());
    let stop = AtomicBool::new(false);

    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                while !stop.load(Ordering::Relaxed) {
                    let _ = coordinator.session_for_call();
                    let _ = coordinator.controllers();
                    let _ = coordinator.active_firmware_version();
                    let _ = coordinator.failover_history();
                    let _ = coordinator.notify_events(1);
                }
            });
        }
        for _ in 0..6 {
            enclosure.switch_over();
            thread::sleep(Duration::from_millis(60));
        }
        stop.store(true, Ordering::Relaxed);
    });

    let started = Instant::now();
    let report = coordinator.shutdown();
    assert!(report.is_clean(), "{report:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(enclosure.open_sessions(), 0);
}

/// Holds one answer to a bay 1 status query through bay 1's own session
/// until the test releases it.
#[derive(Default)]
struct StatusGate {
    pending: Mutex<Option<(Sender<()>, Receiver<()>)>>,
    calls: AtomicUsize,
}

impl StatusGate {
    /// Returns a receiver signalled once an answer is held and a sender
    /// that releases it.
    fn arm(&self) -> (Receiver<()>, Sender<()>) {
        let (held_tx, held_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *self.pending.lock() = Some((held_tx, release_rx));
        (held_rx, release_tx)
    }

    fn pass(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let pending = self.pending.lock().take();
        if let Some((held, release)) = pending {
            let _ = held.send(());
            let _ = release.recv();
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

struct GatedSession {
    inner: Session,
    gate: Arc<StatusGate>,
}

impl SoapSession for GatedSession {
    fn id(&self) -> u64 {
        self.inner.id()
    }

    fn address(&self) -> &str {
        self.inner.address()
    }

    fn timeout(&self) -> Duration {
        self.inner.timeout()
    }

    fn get_user_info(&self, user_name: &str) -> oa_session::Result<UserInfo> {
        self.inner.get_user_info(user_name)
    }

    fn get_oa_status(&self, bay: u8) -> oa_session::Result<OaStatus> {
        let status = self.inner.get_oa_status(bay);
        if bay == 1 && self.inner.address() == BAY1 {
            self.gate.pass();
        }
        status
    }

    fn get_oa_info(&self, bay: u8) -> oa_session::Result<OaInfo> {
        self.inner.get_oa_info(bay)
    }

    fn get_oa_network_info(&self, bay: u8) -> oa_session::Result<OaNetworkInfo> {
        self.inner.get_oa_network_info(bay)
    }

    fn subscribe_for_events(&self) -> oa_session::Result<u32> {
        self.inner.subscribe_for_events()
    }

    fn close(&self) {
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

struct GatedEnclosure {
    enclosure: SimulatedEnclosure,
    gate: Arc<StatusGate>,
}

impl SessionProvider for GatedEnclosure {
    fn open(
        &self,
        address: &str,
        credentials: &Credentials,
        timeout: Duration,
    ) -> oa_session::Result<Session> {
        let inner = self.enclosure.open(address, credentials, timeout)?;
        Ok(Session::new(GatedSession {
            inner,
            gate: Arc::clone(&self.gate),
        }))
    }
}

#[test]
fn late_active_answer_from_the_old_controller_is_ignored() {
    let enclosure = enclosure();
    let gate = Arc::new(StatusGate::default());
    let provider = GatedEnclosure {
        enclosure: enclosure.clone(),
        gate: Arc::clone(&gate),
    };
    // Monitors only poll when notified.
    let settings = RedundancySettings {
        poll_interval: Duration::from_secs(30),
        ..settings()
    };
    let coordinator = RedundancyCoordinator::new(Arc::new(provider), settings);
    coordinator.discover(BAY1, BAY2).expect("discovery succeeds");
    eventually("both monitors to subscribe", || {
        subscribed(&coordinator, 1) && subscribed(&coordinator, 2)
    });

    // Bay 1 answers Active, but the answer is held in flight.
    let (held, release) = gate.arm();
    coordinator.notify_events(1).unwrap();
    held.recv_timeout(Duration::from_secs(5))
        .expect("bay 1 status answer held");

    enclosure.switch_over();
    coordinator.notify_events(2).unwrap();
    eventually("promotion of bay 2", || {
        authoritative_address(&coordinator).as_deref() == Some(BAY2)
    });

    release.send(()).unwrap();
    let answered = gate.calls();
    coordinator.notify_events(1).unwrap();
    // The monitor is sequential: a later query means the held one committed.
    eventually("bay 1 to poll again", || gate.calls() > answered);

    assert_eq!(authoritative_address(&coordinator).as_deref(), Some(BAY2));
    assert_eq!(coordinator.session_for_call().unwrap().address(), BAY2);
    assert_eq!(coordinator.active_bay(), Some(2));
    let active = coordinator
        .controllers()
        .into_iter()
        .filter(|snapshot| snapshot.role == OaRole::Active)
        .count();
    assert_eq!(active, 1);
    assert_eq!(coordinator.promotion_count(), 1);
    let history = coordinator.failover_history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].bay, 2);
    assert_eq!(history[1].previous_bay, Some(1));

    assert!(coordinator.shutdown().is_clean());
}
