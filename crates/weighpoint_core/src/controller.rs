//! Lifecycle Controller
//!
//! The single control task of the station. It owns the event queue, the
//! scheduler, and every handler, and it is the only place device state
//! changes. Producers (button, server directives, scheduler deadlines) only
//! enqueue events; handlers run one at a time, so no handler ever observes
//! another handler half-done.
//!
//! The loop itself: drain the queue in priority order, and when it runs dry
//! arm the scheduler's next wake deadline and suspend. A handler failure is
//! logged with its error code and the loop moves on; nothing short of
//! losing every scheduled deadline stops the device.

use crate::config::Config;
use crate::context::DeviceContext;
use crate::display::{DisplaySink, PatternId};
use crate::error::{LifecycleError, NetworkError, Result, StatusError};
use crate::network::{Message, NoticeKind, ServerLink};
use crate::power::{BatteryInfo, PowerManager, PowerStats, WakeReason};
use crate::queue::EventQueue;
use crate::schedule::{Clock, Scheduler};
use crate::sensors::{load_cal_ratio, save_cal_ratio, BatteryGauge, CalRatio, LoadCell};
use crate::status::{StatusCode, StatusMonitor};
use crate::store::{
    load_identity, load_tx_schedule, save_identity, save_tx_schedule, DataTable, DeviceStore,
    LogFile,
};
use crate::transfer::TransferManager;
use crate::types::{Event, EventKind, MinuteOfDay, PayloadKind, Timestamp, TxSchedule};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Longest single nap of the dispatch loop.
///
/// The field device arms its low-power timer for the full scheduler delay;
/// on a hosted runtime the loop wakes in slices so events enqueued by other
/// tasks are noticed promptly.
const DISPATCH_NAP: Duration = Duration::from_millis(25);

/// Placeholder identity until the server assigns one.
const UNASSIGNED_ID: &str = "wp-unassigned";

/// Where the device is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Never provisioned; only Setup is meaningful.
    Unprovisioned,
    /// Provisioned but off duty; storage and identity exist.
    Inactive,
    /// On duty: measuring and transmitting.
    Active,
}

impl LifecycleState {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleState::Unprovisioned => "unprovisioned",
            LifecycleState::Inactive => "inactive",
            LifecycleState::Active => "active",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Controller statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerStats {
    /// Events dispatched
    pub dispatched: u64,
    /// Handlers that returned an error
    pub handler_failures: u64,
    /// Transfers that closed confirmed
    pub transfers_ok: u64,
    /// Transfers that exhausted their attempts
    pub transfers_failed: u64,
    /// Server directives adopted into the queue
    pub directives: u64,
    /// Events dropped against a full queue
    pub dropped_events: u64,
    /// Timer wakes of the dispatch loop
    pub wakes: u64,
}

/// Operator confirmations during calibration.
///
/// Calibration needs a human to clear the scale and to place the reference
/// plate. Implementations wait on whatever input the deployment has,
/// typically the station button.
pub trait OperatorInput: Send + Sync {
    /// Ask the operator to do `prompt` and confirm. `false` cancels.
    fn confirm(&self, prompt: &str) -> bool;
}

/// Confirms every prompt immediately. For unattended runs.
pub struct AutoConfirm;

impl OperatorInput for AutoConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        log::debug!("auto-confirmed: {}", prompt);
        true
    }
}

/// Scripted confirmations for tests.
///
/// Answers from a queue, records every prompt, and denies once the script
/// runs out.
pub struct ScriptedOperator {
    answers: Mutex<VecDeque<bool>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedOperator {
    pub fn new() -> Self {
        Self {
            answers: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue the answer for the next prompt.
    pub fn push(&self, answer: bool) {
        self.answers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(answer);
    }

    /// Every prompt asked so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Default for ScriptedOperator {
    fn default() -> Self {
        Self::new()
    }
}

impl OperatorInput for ScriptedOperator {
    fn confirm(&self, prompt: &str) -> bool {
        self.prompts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(prompt.to_string());
        self.answers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .unwrap_or(false)
    }
}

/// Physical button gestures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonPress {
    /// One short press.
    Short,
    /// Two presses in quick succession.
    Double,
    /// Held past the long-press threshold.
    Long,
}

impl ButtonPress {
    /// The event a gesture produces.
    ///
    /// A long press means setup only while a host is attached; unplugged it
    /// does nothing, so a snagged branch cannot re-provision the station.
    pub fn event(&self, host_connected: bool) -> Option<EventKind> {
        match self {
            ButtonPress::Short => Some(EventKind::CheckStatus),
            ButtonPress::Double => Some(EventKind::Activate),
            ButtonPress::Long if host_connected => Some(EventKind::Setup),
            ButtonPress::Long => None,
        }
    }
}

/// Producer-side handling of a button press: acknowledge on the display and
/// enqueue the mapped event.
pub fn on_button_press(
    press: ButtonPress,
    host_connected: bool,
    queue: &EventQueue,
    display: &dyn DisplaySink,
) {
    display.show_pattern(PatternId::ButtonPressed);
    let Some(kind) = press.event(host_connected) else {
        log::debug!("long press ignored, no host attached");
        return;
    };
    if let Err(e) = queue.enqueue(Event::routine(kind)) {
        log::warn!("button press dropped: {}", e);
    }
}

/// The control task: event dispatch, lifecycle, and everything in between.
pub struct LifecycleController<L: ServerLink, S: DeviceStore> {
    device_id: String,
    config: Config,
    queue: Arc<EventQueue>,
    context: Arc<DeviceContext>,
    link: Arc<L>,
    store: Arc<Mutex<S>>,
    cell: Arc<dyn LoadCell>,
    gauge: Arc<dyn BatteryGauge>,
    display: Arc<dyn DisplaySink>,
    operator: Arc<dyn OperatorInput>,
    log: LogFile<S>,
    table: DataTable<S>,
    transfer: TransferManager<L>,
    scheduler: Scheduler,
    monitor: StatusMonitor<L>,
    power: PowerManager,
    running: Arc<AtomicBool>,
    state: LifecycleState,
    stats: ControllerStats,
}

impl<L: ServerLink, S: DeviceStore> LifecycleController<L, S> {
    /// Wire up the controller from its collaborators.
    ///
    /// Persisted state decides where the device resumes: a known identity
    /// (configured or stored) means it was provisioned before this boot,
    /// and stored transmission times seed the scheduler.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        link: Arc<L>,
        store: Arc<Mutex<S>>,
        cell: Arc<dyn LoadCell>,
        gauge: Arc<dyn BatteryGauge>,
        display: Arc<dyn DisplaySink>,
        operator: Arc<dyn OperatorInput>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let context = Arc::new(DeviceContext::new());
        let (device_id, tx) = {
            let guard = lock(&store);
            let id = match config.device_id.clone() {
                Some(id) => Some(id),
                None => load_identity(&*guard)?,
            };
            let tx = load_tx_schedule(&*guard)?.unwrap_or(config.schedule.fallback_tx);
            (id, tx)
        };

        let state = match &device_id {
            Some(_) => {
                context.set_has_identity(true);
                context.set_setup_complete(true);
                LifecycleState::Inactive
            }
            None => LifecycleState::Unprovisioned,
        };
        let device_id = device_id.unwrap_or_else(|| UNASSIGNED_ID.to_string());

        let log = LogFile::open(Arc::clone(&store), &device_id)?;
        let table = DataTable::new(Arc::clone(&store));
        let transfer = TransferManager::new(Arc::clone(&link), config.transfer.clone());
        let scheduler = Scheduler::new(&config.schedule, tx, clock);
        let monitor = StatusMonitor::new(
            Arc::clone(&gauge),
            Arc::clone(&cell),
            Arc::clone(&link),
            device_id.clone(),
            config.min_battery_volts,
            config.transfer.ack_timeout,
        );
        let queue = Arc::new(EventQueue::new(config.queue_capacity));

        log::info!("controller for {} booting as {}", device_id, state);
        Ok(Self {
            device_id,
            config,
            queue,
            context,
            link,
            store,
            cell,
            gauge,
            display,
            operator,
            log,
            table,
            transfer,
            scheduler,
            monitor,
            power: PowerManager::new(),
            running: Arc::new(AtomicBool::new(false)),
            state,
            stats: ControllerStats::default(),
        })
    }

    /// The queue producers enqueue into.
    pub fn queue(&self) -> Arc<EventQueue> {
        Arc::clone(&self.queue)
    }

    /// The shared device flags.
    pub fn context(&self) -> Arc<DeviceContext> {
        Arc::clone(&self.context)
    }

    /// The run flag shared with producer tasks.
    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Ask the dispatch loop to stop after the current event.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn stats(&self) -> ControllerStats {
        self.stats.clone()
    }

    pub fn transfer_stats(&self) -> crate::transfer::TransferStats {
        self.transfer.stats()
    }

    /// Sleep/wake bookkeeping since boot.
    pub fn power_stats(&mut self) -> PowerStats {
        self.power.stats()
    }

    /// Battery voltage from the most recent status sweep.
    pub fn battery_volts(&self) -> Option<f32> {
        self.power.battery_volts()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Run the dispatch loop until [`stop`](Self::stop) is called.
    ///
    /// Drains the queue in priority order; when it runs dry, arms the
    /// scheduler's next deadline and naps. The only fatal error is a
    /// scheduler with nothing to arm, since sleeping without a wake
    /// deadline would brick the device.
    pub async fn run(&mut self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        log::info!("dispatch loop started ({})", self.context.describe());
        self.note("controller started");

        while self.running.load(Ordering::SeqCst) {
            match self.queue.dequeue() {
                Ok(event) => self.dispatch(event).await,
                Err(_) => {
                    let nap = self.scheduler.next_delay()?.min(DISPATCH_NAP);
                    smol::Timer::after(nap).await;
                    self.stats.wakes += 1;
                    self.power.record_wake(nap, WakeReason::Timer);
                    self.scheduler.fire_due(&self.queue);
                }
            }
        }

        log::info!("dispatch loop stopped after {} events", self.stats.dispatched);
        Ok(())
    }

    /// Dispatch until the queue is empty, including events enqueued by
    /// handlers along the way. Returns how many events ran.
    pub async fn run_until_idle(&mut self) -> usize {
        let mut count = 0;
        while let Ok(event) = self.queue.dequeue() {
            self.dispatch(event).await;
            count += 1;
        }
        count
    }

    /// Run one event through its handler.
    ///
    /// Handler errors are logged with their code and absorbed; a
    /// communication failure additionally raises the device flag and the
    /// error pattern.
    pub async fn dispatch(&mut self, event: Event) {
        self.stats.dispatched += 1;
        log::debug!("dispatching {}", event);
        self.note(&format!("event {}", event.kind));

        let result = match event.kind {
            EventKind::Setup => self.on_setup().await,
            EventKind::Activate => self.on_activate().await,
            EventKind::Deactivate => self.on_deactivate().await,
            EventKind::CheckStatus => self.on_check_status().await,
            EventKind::Calibrate => self.on_calibrate().await,
            EventKind::ChangeTxTimes => self.on_change_tx_times().await,
            EventKind::SendLog => self.on_send_log().await,
            EventKind::SendData => self.on_send_data().await,
            EventKind::CalibrateClock => self.on_calibrate_clock().await,
        };

        if let Err(e) = result {
            self.stats.handler_failures += 1;
            log::error!("{} handler failed: {} [{}]", event.kind, e, e.code());
            self.note(&format!("error {} in {}", e.code(), event.kind));
            if e.is_comm() {
                self.context.set_comm_problem(true);
                self.display.show_pattern(PatternId::MajorError);
            }
        }
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    async fn on_setup(&mut self) -> Result<()> {
        if self.context.is_active() {
            // Never reprovision a device that is measuring. Deactivate
            // first, redo setup, then return to duty; FIFO within the
            // immediate tier keeps the order.
            log::info!("setup requested while active, resequencing");
            self.note("setup deferred behind deactivate");
            self.push(Event::immediate(EventKind::Deactivate));
            self.push(Event::immediate(EventKind::Setup));
            self.push(Event::immediate(EventKind::Activate));
            return Ok(());
        }

        self.display.show_pattern(PatternId::RunningSetup);
        self.display.show_message("running setup");

        self.ensure_identity().await?;

        // Best effort; a drifting clock does not block provisioning.
        if let Err(e) = self.sync_clock().await {
            log::warn!("clock sync during setup failed: {}", e);
        }

        let notice = Message::LifecycleNotice {
            device_id: self.device_id.clone(),
            timestamp: Timestamp::now(),
            notice: NoticeKind::Provisioned,
        };
        let reply = self
            .link
            .request(&notice, self.config.transfer.ack_timeout)
            .await;
        match reply {
            Ok(Message::Ack) => self.context.set_comm_problem(false),
            Ok(other) => {
                log::warn!("provisioned notice answered with {}", other.name());
                self.context.set_comm_problem(true);
            }
            Err(e) => {
                log::warn!("provisioned notice failed: {}", e);
                self.context.set_comm_problem(true);
            }
        }

        // Tell the server what plate this station is configured for; one-way
        // and best effort.
        let report = Message::PlateWeightReport {
            device_id: self.device_id.clone(),
            grams: self.config.plate_grams,
        };
        if let Err(e) = self.link.send(&report).await {
            log::warn!("plate weight report failed: {}", e);
        }

        self.context.set_setup_complete(true);
        self.state = LifecycleState::Inactive;
        self.note("setup complete");
        self.display.show_pattern(PatternId::Good);
        Ok(())
    }

    async fn on_activate(&mut self) -> Result<()> {
        if !self.context.is_setup_complete() {
            // Re-route instead of running degraded: provision first, then
            // come back to the activation.
            log::warn!("activate before setup, re-routing");
            self.note("activate re-routed through setup");
            self.push(Event::immediate(EventKind::Setup));
            self.push(Event::immediate(EventKind::Activate));
            return Ok(());
        }
        if self.context.is_active() {
            // Already on duty: treat the event as a wake signal and ask the
            // server whether it queued work.
            log::debug!("activate while active, polling for directives");
            self.drain_directives().await;
            return Ok(());
        }

        self.display.show_pattern(PatternId::RunningActivation);
        let notice = Message::LifecycleNotice {
            device_id: self.device_id.clone(),
            timestamp: Timestamp::now(),
            notice: NoticeKind::Activated,
        };
        let reply = self
            .link
            .request(&notice, self.config.transfer.ack_timeout)
            .await?;
        if !matches!(reply, Message::Ack) {
            return Err(NetworkError::UnexpectedReply {
                expected: "ack".to_string(),
                got: reply.name().to_string(),
            }
            .into());
        }
        self.context.set_comm_problem(false);

        let first_activation = {
            let guard = lock(&self.store);
            load_cal_ratio(&*guard)?.is_none()
        };
        if first_activation {
            // A station activated for the first time has neither server
            // transmission slots nor a calibration; fetch both next.
            self.push(Event::urgent(EventKind::ChangeTxTimes));
            self.push(Event::urgent(EventKind::Calibrate));
        }

        self.context.set_active(true);
        self.state = LifecycleState::Active;
        self.note("activated");
        self.display.show_pattern(PatternId::Good);
        self.display.show_message("activated");
        Ok(())
    }

    async fn on_deactivate(&mut self) -> Result<()> {
        if !self.context.is_setup_complete() {
            log::warn!("deactivate before setup, re-routing");
            self.note("deactivate re-routed through setup");
            self.push(Event::immediate(EventKind::Setup));
            return Ok(());
        }

        let notice = Message::LifecycleNotice {
            device_id: self.device_id.clone(),
            timestamp: Timestamp::now(),
            notice: NoticeKind::Deactivated,
        };
        let reply = self
            .link
            .request(&notice, self.config.transfer.ack_timeout)
            .await?;
        if !matches!(reply, Message::Ack) {
            return Err(NetworkError::UnexpectedReply {
                expected: "ack".to_string(),
                got: reply.name().to_string(),
            }
            .into());
        }

        self.context.set_active(false);
        self.state = LifecycleState::Inactive;
        self.note("deactivated");
        self.display.show_message("deactivated");

        // Force-flush both sources; each survives locally if its transfer
        // fails. The log goes last so it carries the record of the data
        // flush and comes back empty.
        let data_result = self.ship(PayloadKind::Data).await;
        let log_result = self.ship(PayloadKind::Log).await;
        data_result?;
        log_result?;
        Ok(())
    }

    async fn on_check_status(&mut self) -> Result<()> {
        self.display.show_pattern(PatternId::CheckingDeviceStatus);
        let report = self.monitor.run_checks().await;
        self.note(&report.summary());

        if let Some(volts) = report.battery_volts {
            self.power.update_battery(BatteryInfo::from_volts(volts));
        }

        if report.has(StatusCode::NetworkingProblem) {
            self.context.set_comm_problem(true);
        }
        for finding in &report.findings {
            if finding.is_critical() {
                self.display.show_message(finding.describe());
            }
        }
        if report.has_critical() {
            // Get the evidence off the device while it still can.
            self.display.show_pattern(PatternId::MajorError);
            self.push(Event::urgent(EventKind::SendLog));
        } else {
            self.display.show_pattern(PatternId::Good);
        }
        Ok(())
    }

    async fn on_calibrate(&mut self) -> Result<()> {
        self.display.show_pattern(PatternId::RunningCalibration);
        self.note("calibrating");

        let grams = match self.request_plate_weight().await {
            Ok(grams) => grams,
            Err(e) => {
                self.note(&format!("calibration aborted [{}]", e.code()));
                self.push(Event::urgent(EventKind::SendLog));
                return Err(e);
            }
        };
        if grams < self.config.plate_min_grams || grams > self.config.plate_max_grams {
            let err = LifecycleError::InvalidPlateWeight {
                grams,
                min: self.config.plate_min_grams,
                max: self.config.plate_max_grams,
            };
            self.note(&format!("calibration rejected: {}", err));
            self.push(Event::urgent(EventKind::SendLog));
            return Err(err.into());
        }

        if !self.operator.confirm("clear the scale, then confirm") {
            self.note("calibration cancelled by operator");
            return Ok(());
        }
        let unloaded = self.cell.read_raw()?;

        if !self.operator.confirm("place the reference plate, then confirm") {
            self.note("calibration cancelled by operator");
            return Ok(());
        }
        let loaded = self.cell.read_raw()?;

        let ratio = CalRatio::from_reference(grams, unloaded, loaded).ok_or_else(|| {
            StatusError::SensorImplausible {
                reason: format!("cell read {} with and without the {} g plate", loaded, grams),
            }
        })?;
        {
            let guard = lock(&self.store);
            save_cal_ratio(&*guard, ratio)?;
        }

        self.note(&format!("calibrated against {} g plate", grams));
        self.display.show_pattern(PatternId::Good);
        Ok(())
    }

    async fn on_change_tx_times(&mut self) -> Result<()> {
        let request = Message::ScheduleRequest {
            device_id: self.device_id.clone(),
        };
        let reply = self
            .link
            .request(&request, self.config.transfer.ack_timeout)
            .await?;
        let (morning, evening) = match reply {
            Message::ScheduleReply { morning, evening } => (morning, evening),
            other => {
                return Err(NetworkError::UnexpectedReply {
                    expected: "schedule-reply".to_string(),
                    got: other.name().to_string(),
                }
                .into());
            }
        };

        let parse = |minute: u16, slot: &str| {
            MinuteOfDay::new(minute).ok_or_else(|| {
                crate::error::Error::Serialization(format!(
                    "server {} time {} is not a minute of day",
                    slot, minute
                ))
            })
        };
        let schedule = TxSchedule::new(parse(morning, "morning")?, parse(evening, "evening")?);

        {
            let guard = lock(&self.store);
            save_tx_schedule(&*guard, schedule)?;
        }
        self.scheduler.reschedule_tx_times(schedule);
        self.note(&format!("transmission times set to {}", schedule));
        Ok(())
    }

    async fn on_send_log(&mut self) -> Result<()> {
        let result = self.ship(PayloadKind::Log).await;
        if result.is_ok() {
            self.drain_directives().await;
        }
        result
    }

    async fn on_send_data(&mut self) -> Result<()> {
        let result = self.ship(PayloadKind::Data).await;
        // The log always follows a data transmission, success or not; on
        // failure it carries the evidence of what went wrong.
        self.push(Event::urgent(EventKind::SendLog));
        if result.is_ok() {
            self.drain_directives().await;
        }
        result
    }

    async fn on_calibrate_clock(&mut self) -> Result<()> {
        // A drifting clock skews record stamps but endangers nothing, so
        // failure here is logged and absorbed.
        if let Err(e) = self.sync_clock().await {
            log::warn!("clock sync failed: {}", e);
            self.note(&format!("clock sync failed [{}]", e.code()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shared steps
    // ------------------------------------------------------------------

    /// Ship one payload source and reset it on success.
    async fn ship(&mut self, kind: PayloadKind) -> Result<()> {
        // Logged before transmitting, so a failed send leaves a trace to
        // chase later.
        self.note(&format!("sending {}", kind));
        self.display.show_pattern(PatternId::ProcessOut);

        let payload = match kind {
            PayloadKind::Log => self.log.render()?,
            PayloadKind::Data => self.table.render()?,
        };
        match self.transfer.send(kind, &payload).await {
            Ok(receipt) => {
                match kind {
                    PayloadKind::Log => self.log.reset()?,
                    PayloadKind::Data => self.table.reset()?,
                }
                self.stats.transfers_ok += 1;
                self.context.set_comm_problem(false);
                // Success bookkeeping stays off the device log: a flushed
                // log must come back empty.
                log::info!(
                    "{} sent, {} bytes in {} attempts",
                    kind,
                    receipt.payload_bytes,
                    receipt.attempts
                );
                self.display.show_pattern(PatternId::Good);
                Ok(())
            }
            Err(e) => {
                self.stats.transfers_failed += 1;
                // The source stays on the device for a later retry.
                self.note(&format!("{} send failed [{}]", kind, e.code()));
                Err(e)
            }
        }
    }

    /// Make sure the device holds an identity, asking the server for one if
    /// neither the configuration nor the store has it.
    async fn ensure_identity(&mut self) -> Result<()> {
        if self.context.has_identity() {
            let guard = lock(&self.store);
            if load_identity(&*guard)?.is_none() {
                save_identity(&*guard, &self.device_id)?;
            }
            return Ok(());
        }

        let reply = self
            .link
            .request(&Message::IdentityRequest, self.config.transfer.ack_timeout)
            .await;
        match reply {
            Ok(Message::IdentityReply { device_id }) => self.adopt_identity(device_id),
            Ok(other) => {
                log::warn!("identity request answered with {}", other.name());
                Err(LifecycleError::SetupIncomplete {
                    missing: "identity".to_string(),
                }
                .into())
            }
            Err(e) => {
                log::warn!("identity request failed: {}", e);
                Err(LifecycleError::SetupIncomplete {
                    missing: "identity".to_string(),
                }
                .into())
            }
        }
    }

    fn adopt_identity(&mut self, device_id: String) -> Result<()> {
        {
            let guard = lock(&self.store);
            save_identity(&*guard, &device_id)?;
        }
        log::info!("assigned identity {}", device_id);
        self.device_id = device_id.clone();
        self.context.set_has_identity(true);

        // The pre-provisioning log carries the placeholder header; start
        // over under the assigned identity.
        self.log = LogFile::open(Arc::clone(&self.store), &self.device_id)?;
        self.log.reset()?;
        self.monitor = StatusMonitor::new(
            Arc::clone(&self.gauge),
            Arc::clone(&self.cell),
            Arc::clone(&self.link),
            device_id,
            self.config.min_battery_volts,
            self.config.transfer.ack_timeout,
        );
        Ok(())
    }

    /// Compare the local clock against the time server and log the drift.
    async fn sync_clock(&mut self) -> Result<()> {
        let reply = self
            .link
            .time_request(&Message::TimeRequest, self.config.transfer.ack_timeout)
            .await?;
        match reply {
            Message::TimeReply { timestamp } => {
                let drift_ms = timestamp.as_millis() as i64 - Timestamp::now().as_millis() as i64;
                log::info!("clock drift {} ms against time server", drift_ms);
                self.note(&format!("clock synchronized, drift {} ms", drift_ms));
                Ok(())
            }
            other => Err(NetworkError::UnexpectedReply {
                expected: "time-reply".to_string(),
                got: other.name().to_string(),
            }
            .into()),
        }
    }

    async fn request_plate_weight(&mut self) -> Result<u32> {
        let request = Message::PlateWeightRequest {
            device_id: self.device_id.clone(),
        };
        let reply = self
            .link
            .request(&request, self.config.transfer.ack_timeout)
            .await?;
        match reply {
            Message::PlateWeightReply { grams } => Ok(grams),
            other => Err(NetworkError::UnexpectedReply {
                expected: "plate-weight-reply".to_string(),
                got: other.name().to_string(),
            }
            .into()),
        }
    }

    /// Post-transmit listen window: adopt whatever work the server queued
    /// while the device slept. Poll failures are quietly ignored; the next
    /// transmission polls again.
    async fn drain_directives(&mut self) {
        let request = Message::DirectiveRequest {
            device_id: self.device_id.clone(),
        };
        let reply = self
            .link
            .request(&request, self.config.transfer.ack_timeout)
            .await;
        match reply {
            Ok(Message::DirectiveReply { directives }) => {
                for kind in directives {
                    log::info!("server directive: {}", kind);
                    self.stats.directives += 1;
                    self.push(Event::routine(kind));
                }
            }
            Ok(other) => log::debug!("directive poll answered with {}", other.name()),
            Err(e) => log::debug!("directive poll failed: {}", e),
        }
    }

    /// Enqueue, dropping against a full queue. The producer side of the
    /// overflow policy: losing a follow-up is survivable, blocking the
    /// dispatch loop is not.
    fn push(&mut self, event: Event) {
        if let Err(e) = self.queue.enqueue(event) {
            self.stats.dropped_events += 1;
            log::warn!("dropped {}: {}", event, e);
        }
    }

    /// Append to the device log; a failing log must never take down the
    /// handler that tried to write it.
    fn note(&self, message: &str) {
        if let Err(e) = self.log.log(message) {
            log::warn!("device log append failed: {}", e);
        }
    }
}

fn lock<S: DeviceStore>(store: &Arc<Mutex<S>>) -> MutexGuard<'_, S> {
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
