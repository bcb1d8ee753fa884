//! Integration tests for the station control core
//!
//! Tests complete workflows combining multiple components:
//! - Boot, setup, and activation over the in-memory server link
//! - Queue priority and overflow behavior
//! - Scheduler-driven wakes through the dispatch loop
//! - Sensing loop feeding the data table
//!
//! Run with: `cargo test -p weighpoint_core --test device_integration_tests`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use weighpoint_core::sensors::{
    load_cal_ratio, sensing_loop, BatteryGauge, MockBatteryGauge, MockLoadCell,
};
use weighpoint_core::store::load_tx_schedule;
use weighpoint_core::{
    Clock, Config, DeviceContext, DeviceStore, Event, EventKind, EventQueue, LifecycleController,
    LifecycleState, LoadCell, ManualClock, MemoryLink, MemoryStore, Message, OperatorInput,
    QueueError, RecordingDisplay, ScheduleConfig, Scheduler, TxSchedule, PRIORITY_ROUTINE,
};

/// Operator that loads the simulated reference plate when prompted.
struct PlateLoader {
    cell: Arc<MockLoadCell>,
}

impl OperatorInput for PlateLoader {
    fn confirm(&self, prompt: &str) -> bool {
        if prompt.contains("plate") {
            self.cell.set_raw(12_000);
        } else {
            self.cell.set_raw(2_000);
        }
        true
    }
}

struct Station {
    controller: LifecycleController<MemoryLink, MemoryStore>,
    link: Arc<MemoryLink>,
    store: Arc<Mutex<MemoryStore>>,
    gauge: Arc<MockBatteryGauge>,
}

fn station(config: Config) -> Station {
    let link = Arc::new(MemoryLink::new());
    let store = Arc::new(Mutex::new(MemoryStore::new()));
    let cell = Arc::new(MockLoadCell::new(2_000));
    let gauge = Arc::new(MockBatteryGauge::new(3.9));
    let operator = Arc::new(PlateLoader {
        cell: Arc::clone(&cell),
    });
    let controller = LifecycleController::new(
        config,
        Arc::clone(&link),
        Arc::clone(&store),
        Arc::clone(&cell) as Arc<dyn LoadCell>,
        Arc::clone(&gauge) as Arc<dyn BatteryGauge>,
        Arc::new(RecordingDisplay::new()),
        operator,
        Arc::new(ManualClock::at_minute(10 * 60)),
    )
    .unwrap();
    Station {
        controller,
        link,
        store,
        gauge,
    }
}

fn factory_fresh() -> Station {
    let mut config = Config::test_mode();
    config.device_id = None;
    station(config)
}

// ============================================================================
// Boot and Lifecycle Workflows
// ============================================================================

/// A factory-fresh station boots, provisions itself, and goes on duty in
/// one pass over the queue.
#[test]
fn test_boot_to_active_workflow() {
    smol::block_on(async {
        let mut st = factory_fresh();
        assert_eq!(st.controller.state(), LifecycleState::Unprovisioned);

        let queue = st.controller.queue();
        queue.enqueue(Event::immediate(EventKind::Setup)).unwrap();
        queue.enqueue(Event::urgent(EventKind::Activate)).unwrap();
        st.controller.run_until_idle().await;

        assert_eq!(st.controller.state(), LifecycleState::Active);
        assert_eq!(st.controller.device_id(), "wp-0001");
        assert_eq!(st.controller.stats().handler_failures, 0);

        // The first activation fetched a schedule and a calibration.
        let guard = st.store.lock().unwrap();
        assert!(load_cal_ratio(&*guard).unwrap().is_some());
        let tx = load_tx_schedule(&*guard).unwrap().unwrap();
        assert_eq!(tx, TxSchedule::new(
            weighpoint_core::MinuteOfDay::new(420).unwrap(),
            weighpoint_core::MinuteOfDay::new(1140).unwrap(),
        ));
    });
}

/// A station that was provisioned on an earlier boot resumes inactive with
/// its stored identity, without touching the server.
#[test]
fn test_reboot_resumes_provisioned_state() {
    smol::block_on(async {
        let mut st = factory_fresh();
        st.controller
            .dispatch(Event::immediate(EventKind::Setup))
            .await;
        assert_eq!(st.controller.device_id(), "wp-0001");

        // Same store, fresh controller, no configured identity.
        let mut config = Config::test_mode();
        config.device_id = None;
        let cell = Arc::new(MockLoadCell::new(2_000));
        let controller = LifecycleController::new(
            config,
            Arc::new(MemoryLink::new()),
            Arc::clone(&st.store),
            Arc::clone(&cell) as Arc<dyn LoadCell>,
            Arc::new(MockBatteryGauge::new(3.9)),
            Arc::new(RecordingDisplay::new()),
            Arc::new(PlateLoader { cell }),
            Arc::new(ManualClock::at_minute(0)),
        )
        .unwrap();

        assert_eq!(controller.state(), LifecycleState::Inactive);
        assert_eq!(controller.device_id(), "wp-0001");
        assert!(controller.context().is_setup_complete());
    });
}

/// Setup requested while the station is measuring resequences itself and
/// lands the station back on duty.
#[test]
fn test_setup_while_active_full_sequence() {
    smol::block_on(async {
        let mut st = station(Config::test_mode());
        let queue = st.controller.queue();
        queue.enqueue(Event::urgent(EventKind::Activate)).unwrap();
        st.controller.run_until_idle().await;
        assert!(st.controller.context().is_active());

        queue.enqueue(Event::routine(EventKind::Setup)).unwrap();
        st.controller.run_until_idle().await;

        assert_eq!(st.controller.state(), LifecycleState::Active);
        assert!(st.controller.context().is_setup_complete());
        assert_eq!(st.controller.stats().handler_failures, 0);

        // The chain deactivated once and reactivated once.
        let notices: Vec<String> = st
            .link
            .sent()
            .iter()
            .filter_map(|m| match m {
                Message::LifecycleNotice { notice, .. } => Some(notice.to_string()),
                _ => None,
            })
            .collect();
        assert!(notices.contains(&"deactivated".to_string()));
        assert!(notices.iter().filter(|n| *n == "activated").count() >= 2);
    });
}

// ============================================================================
// Queue Properties
// ============================================================================

/// Worked example for a queue of capacity 3: overflow refuses, order is
/// priority-first, FIFO within a tier.
#[test]
fn test_queue_capacity_three_worked_example() {
    let queue = EventQueue::new(3);
    queue.enqueue(Event::routine(EventKind::SendData)).unwrap();
    queue.enqueue(Event::urgent(EventKind::SendLog)).unwrap();
    queue
        .enqueue(Event::immediate(EventKind::Deactivate))
        .unwrap();

    match queue.enqueue(Event::routine(EventKind::CheckStatus)) {
        Err(QueueError::Full { capacity }) => assert_eq!(capacity, 3),
        other => panic!("expected full queue, got {:?}", other),
    }

    assert_eq!(queue.dequeue().unwrap().kind, EventKind::Deactivate);
    assert_eq!(queue.dequeue().unwrap().kind, EventKind::SendLog);
    assert_eq!(queue.dequeue().unwrap().kind, EventKind::SendData);
    assert!(queue.is_empty());
}

#[test]
fn test_queue_fifo_within_tier() {
    let queue = EventQueue::new(8);
    for kind in [
        EventKind::CheckStatus,
        EventKind::SendData,
        EventKind::SendLog,
        EventKind::CalibrateClock,
    ] {
        queue.enqueue(Event::routine(kind)).unwrap();
    }
    let drained: Vec<EventKind> = std::iter::from_fn(|| queue.dequeue().ok())
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        drained,
        vec![
            EventKind::CheckStatus,
            EventKind::SendData,
            EventKind::SendLog,
            EventKind::CalibrateClock,
        ]
    );
}

// ============================================================================
// Scheduler-Driven Wakes
// ============================================================================

/// The scheduler wakes the queue with routine events and always has a next
/// deadline afterwards.
#[test]
fn test_scheduler_fires_into_queue() {
    let clock = Arc::new(ManualClock::at_minute(6 * 60));
    let config = ScheduleConfig {
        status_check_period: Duration::from_millis(50),
        clock_sync_period: Duration::from_secs(3600),
        sense_interval: Duration::from_secs(60),
        fallback_tx: TxSchedule::default(),
    };
    let mut scheduler = Scheduler::new(&config, TxSchedule::default(), Arc::clone(&clock) as Arc<dyn Clock>);
    let queue = EventQueue::new(8);

    clock.advance(Duration::from_millis(60));
    let fired = scheduler.fire_due(&queue);
    assert_eq!(fired, 1);

    let event = queue.dequeue().unwrap();
    assert_eq!(event.kind, EventKind::CheckStatus);
    assert_eq!(event.priority, PRIORITY_ROUTINE);

    // The next status check is strictly later than now.
    assert!(scheduler.next_delay().unwrap() > Duration::ZERO);
}

/// The dispatch loop wakes on its own, runs the due status check, and goes
/// back to sleep.
#[test]
fn test_run_loop_dispatches_scheduled_work() {
    smol::block_on(async {
        let mut config = Config::test_mode();
        config.schedule.status_check_period = Duration::from_millis(100);
        // Real clocks: the loop has to see deadlines come due on its own.
        let cell = Arc::new(MockLoadCell::new(2_000));
        let mut controller = LifecycleController::new(
            config,
            Arc::new(MemoryLink::new()),
            Arc::new(Mutex::new(MemoryStore::new())),
            Arc::clone(&cell) as Arc<dyn LoadCell>,
            Arc::new(MockBatteryGauge::new(3.9)),
            Arc::new(RecordingDisplay::new()),
            Arc::new(PlateLoader { cell }),
            Arc::new(weighpoint_core::SystemClock),
        )
        .unwrap();
        let running = controller.running();

        let task = smol::spawn(async move {
            controller.run().await.unwrap();
            controller
        });
        smol::Timer::after(Duration::from_millis(350)).await;
        running.store(false, Ordering::SeqCst);
        let mut controller = task.await;

        let stats = controller.stats();
        assert!(stats.wakes > 0);
        assert!(stats.dispatched >= 1);
        assert_eq!(stats.handler_failures, 0);

        // Every nap was booked as a timer-armed sleep cycle.
        let power = controller.power_stats();
        assert!(power.sleep_wake_cycles > 0);
        assert_eq!(power.sleep_wake_cycles, power.wakes_by_timer);
    });
}

// ============================================================================
// Status Escalation
// ============================================================================

/// A critical finding gets the log transmitted without waiting for the
/// evening slot.
#[test]
fn test_low_battery_escalates_log_transmission() {
    smol::block_on(async {
        let mut st = station(Config::test_mode());
        st.gauge.set_volts(2.5);

        let queue = st.controller.queue();
        queue.enqueue(Event::routine(EventKind::CheckStatus)).unwrap();
        st.controller.run_until_idle().await;

        let shipped_log = st.link.sent().iter().any(|m| {
            matches!(
                m,
                Message::TransferRequest {
                    kind: weighpoint_core::PayloadKind::Log,
                    ..
                }
            )
        });
        assert!(shipped_log);
        assert_eq!(st.controller.stats().transfers_ok, 1);
    });
}

// ============================================================================
// Sensing Loop
// ============================================================================

#[test]
fn test_sensing_loop_stores_while_active() {
    smol::block_on(async {
        let store = Arc::new(Mutex::new(MemoryStore::new()));
        let cell = Arc::new(MockLoadCell::new(5_000));
        let clock = Arc::new(ManualClock::at_minute(9 * 60));
        let context = Arc::new(DeviceContext::new());
        context.set_active(true);
        let running = Arc::new(AtomicBool::new(true));

        let task = smol::spawn(sensing_loop(
            Arc::clone(&store),
            Arc::clone(&cell) as Arc<dyn LoadCell>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::clone(&context),
            Arc::clone(&running),
            Duration::from_millis(5),
        ));
        smol::Timer::after(Duration::from_millis(60)).await;
        running.store(false, Ordering::SeqCst);
        let stats = task.await;

        assert!(stats.stored > 0);
        assert_eq!(stats.failed, 0);
        let guard = store.lock().unwrap();
        assert_eq!(guard.record_count().unwrap(), stats.stored as usize);
    });
}

#[test]
fn test_sensing_loop_idle_while_inactive() {
    smol::block_on(async {
        let store = Arc::new(Mutex::new(MemoryStore::new()));
        let cell = Arc::new(MockLoadCell::new(5_000));
        let clock = Arc::new(ManualClock::at_minute(9 * 60));
        let context = Arc::new(DeviceContext::new());
        let running = Arc::new(AtomicBool::new(true));

        let task = smol::spawn(sensing_loop(
            Arc::clone(&store),
            Arc::clone(&cell) as Arc<dyn LoadCell>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::clone(&context),
            Arc::clone(&running),
            Duration::from_millis(5),
        ));
        smol::Timer::after(Duration::from_millis(40)).await;
        running.store(false, Ordering::SeqCst);
        let stats = task.await;

        assert_eq!(stats.stored, 0);
        let guard = store.lock().unwrap();
        assert_eq!(guard.record_count().unwrap(), 0);
    });
}

// ============================================================================
// Server Directives
// ============================================================================

/// Directives queued on the server are adopted during the post-transmission
/// listen window and then executed.
#[test]
fn test_directive_adopted_after_transmission() {
    smol::block_on(async {
        let mut st = station(Config::test_mode());
        let queue = st.controller.queue();
        queue.enqueue(Event::urgent(EventKind::Activate)).unwrap();
        st.controller.run_until_idle().await;

        st.link.push_directive(EventKind::CheckStatus);
        queue.enqueue(Event::urgent(EventKind::SendLog)).unwrap();
        st.controller.run_until_idle().await;

        assert_eq!(st.controller.stats().directives, 1);
        // The adopted check ran: the server was pinged at least once.
        let pings = st
            .link
            .sent()
            .iter()
            .filter(|m| matches!(m, Message::Ping { .. }))
            .count();
        assert!(pings >= 1);
    });
}
