use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::buffer::{self, SharedRing};
use crate::datalog::PeriodicLog;
use crate::metrics::{EfficiencyReport, MetricsTracker};
use crate::params::{AcquisitionParams, StreamConfig};
use crate::source::{Batch, SampleSource, SourceError};

mod drain;

pub use drain::{DrainProtocol, DrainReport};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AcquisitionStatus {
    Stopped,
    Running,
    Paused,
    Stopping,
    Draining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// The hardware reported it halted after the trigger and post-trigger count.
    AutoStop,
    /// The driver raised its trigger flag.
    TriggerFlag,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerEvent {
    pub sample_index_in_raw_space: u64,
    pub downsampled_index: Option<u64>,
    pub fired_at: Instant,
    pub source: TriggerSource,
}

#[derive(Debug, Clone)]
pub enum Notification {
    NewStatus(AcquisitionStatus),
    Info(String),
    Error(String),
    Efficiency(EfficiencyReport),
    BufferStatus { filled: usize, capacity: usize },
    Triggered(TriggerEvent),
    Drained(usize),
}

#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("hardware poll failed: {0}")]
    Poll(#[source] SourceError),
    #[error("acquisition thread panicked")]
    Panicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    StopRequested,
    Triggered,
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub polls: u64,
    pub batches: u64,
    pub samples: u64,
    pub drained: usize,
    pub trigger: Option<TriggerEvent>,
    pub end: RunEnd,
}

type TriggerCallback = Arc<dyn Fn(&TriggerEvent) + Send + Sync>;

/// Observers notified when a run ends on a trigger.
#[derive(Default)]
pub struct TriggerBus {
    subscribers: Mutex<Vec<TriggerCallback>>,
}

impl TriggerBus {
    pub fn new() -> TriggerBus {
        TriggerBus::default()
    }

    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&TriggerEvent) + Send + Sync + 'static,
    {
        lock_or_recover(&self.subscribers).push(Arc::new(callback));
    }

    /// Callbacks run outside the lock, so they may subscribe again.
    pub fn publish(&self, event: &TriggerEvent) {
        let subscribers: Vec<TriggerCallback> = lock_or_recover(&self.subscribers).clone();
        for callback in subscribers {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.subscribers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct GateState {
    requested: bool,
    parked: bool,
    worker_alive: bool,
    generation: u64,
}

/// Handshake between the reconfiguration path and the acquisition worker.
///
/// The requester raises the flag and waits until the worker is parked (or gone); the worker
/// stays parked, with no timeout, until the flag is released or a stop/abort is requested.
#[derive(Debug, Default)]
pub struct PauseGate {
    state: Mutex<GateState>,
    cv: Condvar,
}

impl PauseGate {
    fn state(&self) -> MutexGuard<'_, GateState> {
        lock_or_recover(&self.state)
    }

    /// Raises the pause flag and blocks until the worker acknowledged it.
    ///
    /// Returns `false` when no worker is running, in which case nothing needs to be paused.
    pub fn request(&self) -> bool {
        let mut state = self.state();
        state.requested = true;
        self.cv.notify_all();

        while state.worker_alive && !state.parked {
            state = match self.cv.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }

        state.parked
    }

    /// Clears the pause flag and wakes the worker.
    pub fn release(&self) {
        let mut state = self.state();
        if state.requested {
            state.requested = false;
            state.generation += 1;
        }
        self.cv.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        self.state().requested
    }

    pub fn is_parked(&self) -> bool {
        self.state().parked
    }

    fn wake(&self) {
        let _state = self.state();
        self.cv.notify_all();
    }

    fn set_worker_alive(&self, alive: bool) {
        let mut state = self.state();
        state.worker_alive = alive;
        if !alive {
            state.parked = false;
        }
        self.cv.notify_all();
    }

    /// Worker side: parks until released. Returns `true` if the hardware was reconfigured
    /// meanwhile.
    fn park(&self, stop: &AtomicBool, abort: &AtomicBool) -> bool {
        let mut state = self.state();
        let generation = state.generation;

        state.parked = true;
        self.cv.notify_all();

        while state.requested && !stop.load(Ordering::SeqCst) && !abort.load(Ordering::SeqCst) {
            state = match self.cv.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }

        state.parked = false;
        state.generation != generation
    }
}

/// Flags shared between the acquisition worker and its controllers.
#[derive(Debug)]
pub struct LoopControl {
    stop: AtomicBool,
    abort: AtomicBool,
    poll_interval_ns: AtomicU64,
    pub pause: PauseGate,
}

impl LoopControl {
    pub fn new(poll_interval: Duration) -> LoopControl {
        LoopControl {
            stop: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            poll_interval_ns: AtomicU64::new(poll_interval.as_nanos() as u64),
            pause: PauseGate::default(),
        }
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.pause.wake();
    }

    /// Ends the run without draining, used when the hardware is left in an unknown state.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
        self.pause.wake();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_nanos(self.poll_interval_ns.load(Ordering::Relaxed))
    }

    pub fn set_poll_interval(&self, interval: Duration) {
        self.poll_interval_ns
            .store(interval.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Clears the stop and abort flags before a new run.
    pub fn rearm(&self) {
        self.stop.store(false, Ordering::SeqCst);
        self.abort.store(false, Ordering::SeqCst);
    }
}

/// Everything the worker thread touches.
pub struct LoopContext<S> {
    pub source: Arc<Mutex<S>>,
    pub ring: SharedRing,
    pub metrics: Arc<Mutex<MetricsTracker>>,
    pub control: Arc<LoopControl>,
    pub triggers: Arc<TriggerBus>,
    pub active: Arc<Mutex<AcquisitionParams>>,
    pub status: Arc<Mutex<AcquisitionStatus>>,
    pub sample_log: Arc<Mutex<Option<PeriodicLog>>>,
    pub config: StreamConfig,
    pub notifications_tx: mpsc::Sender<Notification>,
}

impl<S> LoopContext<S> {
    fn notify(&self, notification: Notification) {
        if let Err(err) = self.notifications_tx.send(notification) {
            log::trace!("notification dropped, no receiver: {:?}", err.0);
        }
    }

    fn set_status(&self, status: AcquisitionStatus) {
        let mut current = lock_or_recover(&self.status);
        if *current != status {
            log::debug!("acquisition status {:?} -> {:?}", *current, status);
            *current = status;
            drop(current);
            self.notify(Notification::NewStatus(status));
        }
    }
}

pub struct AcquisitionHandle {
    join_handle: thread::JoinHandle<Result<RunSummary, AcquisitionError>>,
}

impl AcquisitionHandle {
    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    pub fn join(self) -> Result<RunSummary, AcquisitionError> {
        match self.join_handle.join() {
            Ok(result) => result,
            Err(err) => {
                log::error!("failed to join acquisition thread: {:?}", err);
                Err(AcquisitionError::Panicked)
            }
        }
    }
}

struct AliveGuard(Arc<LoopControl>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.pause.set_worker_alive(false);
    }
}

#[derive(Debug, Default)]
struct RunTracking {
    seen_data: bool,
    auto_stop_pending: bool,
    last_trigger_index: Option<u64>,
    next_offset: u64,
    last_batch_at: Option<Instant>,
    last_efficiency_notify: Option<Instant>,
}

/// Background worker polling the source into the ring buffer.
pub struct AcquisitionLoop;

impl AcquisitionLoop {
    pub fn spawn<S: SampleSource + 'static>(ctx: LoopContext<S>) -> AcquisitionHandle {
        // marked alive before the thread exists, so a pause requested right after
        // the spawn waits for the worker instead of racing it
        ctx.control.pause.set_worker_alive(true);
        ctx.set_status(AcquisitionStatus::Running);

        let join_handle = thread::spawn(move || {
            let _alive = AliveGuard(ctx.control.clone());

            let result = acquisition_thread(&ctx);

            if let Err(err) = &result {
                log::error!("acquisition thread returned with error: {}", err);
                ctx.notify(Notification::Error(err.to_string()));
            }
            ctx.set_status(AcquisitionStatus::Stopped);

            result
        });

        AcquisitionHandle { join_handle }
    }
}

fn acquisition_thread<S: SampleSource>(ctx: &LoopContext<S>) -> Result<RunSummary, AcquisitionError> {
    let control = &ctx.control;
    let mut run = RunTracking::default();
    let mut summary = RunSummary {
        polls: 0,
        batches: 0,
        samples: 0,
        drained: 0,
        trigger: None,
        end: RunEnd::StopRequested,
    };

    ctx.notify(Notification::Info("acquisition started".into()));

    let end = loop {
        if control.abort_requested() {
            break RunEnd::Aborted;
        }
        if control.stop_requested() {
            break RunEnd::StopRequested;
        }

        if control.pause.is_requested() {
            ctx.set_status(AcquisitionStatus::Paused);
            log::debug!("acquisition paused for reconfiguration");

            if control.pause.park(&control.stop, &control.abort) {
                // the hardware was restarted, offsets and trigger state start over
                run = RunTracking::default();
            }

            if !control.stop_requested() && !control.abort_requested() {
                ctx.set_status(AcquisitionStatus::Running);
                log::debug!("acquisition resumed");
            }
            continue;
        }

        let poll_result = lock_or_recover(&ctx.source).poll();
        summary.polls += 1;

        let batch = match poll_result {
            Ok(batch) => batch,
            Err(err) => {
                if let Err(stop_err) = lock_or_recover(&ctx.source).stop() {
                    log::warn!("failed to stop source after poll error: {}", stop_err);
                }
                return Err(AcquisitionError::Poll(err));
            }
        };

        let (ratio, armed) = {
            let active = lock_or_recover(&ctx.active);
            (active.ratio as u64, active.trigger_armed())
        };

        if batch.trigger_index.is_some() {
            run.last_trigger_index = batch.trigger_index;
        }

        if !batch.is_empty() {
            run.seen_data = true;
            summary.batches += 1;
            summary.samples += batch.len() as u64;
            ingest(ctx, &mut run, &batch);

            // the hardware halts once the post-trigger samples are out; the run ends on
            // the first poll that comes back empty after that
            if armed && batch.auto_stopped {
                run.auto_stop_pending = true;
            }

            continue;
        }

        // only a zero-sample poll after data has flowed can end the run; an auto-stop
        // reported before any data is a startup artifact
        if armed && run.seen_data && (batch.auto_stopped || run.auto_stop_pending || batch.triggered) {
            let source = if batch.auto_stopped || run.auto_stop_pending {
                TriggerSource::AutoStop
            } else {
                TriggerSource::TriggerFlag
            };
            let event = resolve_trigger(ctx, &run, &batch, ratio, source);

            log::info!(
                "trigger detected via {:?} @ raw sample {}",
                event.source,
                event.sample_index_in_raw_space
            );

            ctx.triggers.publish(&event);
            ctx.notify(Notification::Triggered(event.clone()));
            summary.trigger = Some(event);

            break RunEnd::Triggered;
        }

        thread::sleep(control.poll_interval());
    };

    summary.end = end;

    if end == RunEnd::Aborted {
        log::warn!("acquisition aborted, skipping buffer drain");
        return Ok(summary);
    }

    // a source that auto-stopped is already halted, stop() is a no-op there
    ctx.set_status(AcquisitionStatus::Stopping);
    if let Err(err) = lock_or_recover(&ctx.source).stop() {
        log::warn!("failed to stop source: {}", err);
    }

    ctx.set_status(AcquisitionStatus::Draining);

    let report = DrainProtocol::from_config(&ctx.config).run(&*ctx.source, &ctx.ring, |filled, capacity| {
        ctx.notify(Notification::BufferStatus { filled, capacity });
    });
    summary.drained = report.drained;
    ctx.notify(Notification::Drained(report.drained));

    log::info!(
        "acquisition finished ({:?}): {} samples in {} batches, {} drained",
        end,
        summary.samples,
        summary.batches,
        summary.drained
    );

    Ok(summary)
}

fn ingest<S>(ctx: &LoopContext<S>, run: &mut RunTracking, batch: &Batch) {
    let now = Instant::now();

    if let Some(previous) = run.last_batch_at {
        log::trace!(
            "batch of {} samples @ {} ({:?} since previous)",
            batch.len(),
            batch.start_offset,
            now - previous
        );
    }
    run.last_batch_at = Some(now);
    run.next_offset = batch.start_offset + batch.len() as u64;

    let report = {
        let mut metrics = lock_or_recover(&ctx.metrics);
        metrics.record_at(batch.len(), now);
        metrics.current_efficiency()
    };

    let (filled, capacity) = {
        let mut ring = buffer::lock(&ctx.ring);
        ring.write(&batch.samples);
        (ring.len(), ring.capacity())
    };

    ctx.notify(Notification::BufferStatus { filled, capacity });

    log_sample(ctx, &batch.samples, now);

    let due = match run.last_efficiency_notify {
        Some(at) => now.duration_since(at) >= ctx.config.efficiency_notify_interval,
        None => true,
    };
    if due {
        ctx.notify(Notification::Efficiency(report));
        run.last_efficiency_notify = Some(now);
    }
}

fn log_sample<S>(ctx: &LoopContext<S>, samples: &[i16], now: Instant) {
    let mut sample_log = lock_or_recover(&ctx.sample_log);

    let failed = match sample_log.as_mut() {
        Some(open) => open.offer(samples, now).err(),
        None => None,
    };

    if let Some(err) = failed {
        *sample_log = None;
        drop(sample_log);

        log::error!("periodic log failed, logging disabled: {}", err);
        ctx.notify(Notification::Error(format!("periodic log failed: {}", err)));
    }
}

/// Raw-space trigger position: the driver's answer if it has one, otherwise the downsampled
/// index scaled back by the ratio.
fn resolve_trigger<S: SampleSource>(
    ctx: &LoopContext<S>,
    run: &RunTracking,
    batch: &Batch,
    ratio: u64,
    source: TriggerSource,
) -> TriggerEvent {
    let downsampled_index = batch.trigger_index.or(run.last_trigger_index);

    let raw_index = match lock_or_recover(&ctx.source).trigger_info() {
        Ok(Some(info)) => info.raw_sample_index,
        Ok(None) => downsampled_index.unwrap_or(run.next_offset) * ratio,
        Err(err) => {
            log::debug!("trigger info unavailable ({}), using downsampled index", err);
            downsampled_index.unwrap_or(run.next_offset) * ratio
        }
    };

    TriggerEvent {
        sample_index_in_raw_space: raw_index,
        downsampled_index,
        fired_at: Instant::now(),
        source,
    }
}

pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::buffer::RingBuffer;
    use crate::source::{ScriptedCall, ScriptedSource, TriggerInfo};

    struct Harness {
        source: ScriptedSource,
        ring: SharedRing,
        control: Arc<LoopControl>,
        triggers: Arc<TriggerBus>,
        status: Arc<Mutex<AcquisitionStatus>>,
        sample_log: Arc<Mutex<Option<PeriodicLog>>>,
        notifications_rx: mpsc::Receiver<Notification>,
        handle: AcquisitionHandle,
    }

    fn fast_config() -> StreamConfig {
        let mut config = StreamConfig::default();
        config.drain_timeout = Duration::from_millis(500);
        config.drain_retry_interval = Duration::from_millis(1);
        config
    }

    fn spawn(source: &ScriptedSource, params: AcquisitionParams, capacity: usize) -> Harness {
        let ring = RingBuffer::shared(capacity);
        let control = Arc::new(LoopControl::new(Duration::from_millis(1)));
        let triggers = Arc::new(TriggerBus::new());
        let status = Arc::new(Mutex::new(AcquisitionStatus::Stopped));
        let sample_log = Arc::new(Mutex::new(None));
        let (notifications_tx, notifications_rx) = mpsc::channel();

        let handle = AcquisitionLoop::spawn(LoopContext {
            source: Arc::new(Mutex::new(source.clone())),
            ring: ring.clone(),
            metrics: Arc::new(Mutex::new(MetricsTracker::new(Duration::from_secs(1), 50))),
            control: control.clone(),
            triggers: triggers.clone(),
            active: Arc::new(Mutex::new(params)),
            status: status.clone(),
            sample_log: sample_log.clone(),
            config: fast_config(),
            notifications_tx,
        });

        Harness {
            source: source.clone(),
            ring,
            control,
            triggers,
            status,
            sample_log,
            notifications_rx,
            handle,
        }
    }

    fn armed() -> AcquisitionParams {
        let mut params = AcquisitionParams::default().with_ratio(4, crate::params::DownsamplingMode::Decimate);
        params.auto_stop = true;
        params
    }

    #[test]
    fn trigger_then_drain() {
        let source = ScriptedSource::new();
        source
            .push_samples(0, vec![1; 10])
            .push_samples(10, vec![2; 10])
            .push_samples(20, vec![3; 10])
            .push(Batch::auto_stopped(Some(25)))
            .push_samples(30, vec![4; 5])
            .push_samples(35, vec![5; 5]);

        let harness = spawn(&source, armed(), 100);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        harness.triggers.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let summary = harness.handle.join().unwrap();

        assert_eq!(summary.end, RunEnd::Triggered);
        assert_eq!(summary.samples, 30);
        assert_eq!(summary.drained, 10);

        let event = summary.trigger.unwrap();
        assert_eq!(event.source, TriggerSource::AutoStop);
        assert_eq!(event.downsampled_index, Some(25));
        assert_eq!(event.sample_index_in_raw_space, 100);

        assert_eq!(buffer::lock(&harness.ring).len(), 40);
        assert_eq!(*harness.status.lock().unwrap(), AcquisitionStatus::Stopped);
        assert!(harness.source.count(&ScriptedCall::Stop) >= 1);

        let triggered = harness
            .notifications_rx
            .try_iter()
            .filter(|n| matches!(n, Notification::Triggered(_)))
            .count();
        assert_eq!(triggered, 1);
    }

    #[test]
    fn auto_stop_before_any_data_is_ignored() {
        let source = ScriptedSource::new();
        source
            .push(Batch::auto_stopped(None))
            .push_samples(0, vec![7; 3]);

        let harness = spawn(&source, armed(), 10);

        thread::sleep(Duration::from_millis(30));
        assert!(!harness.handle.is_finished());

        harness.control.request_stop();
        let summary = harness.handle.join().unwrap();

        assert_eq!(summary.end, RunEnd::StopRequested);
        assert!(summary.trigger.is_none());
        assert_eq!(buffer::lock(&harness.ring).snapshot(), vec![7.0; 3]);
    }

    #[test]
    fn triggered_flag_with_data_keeps_streaming() {
        let source = ScriptedSource::new();
        source
            .push_samples(0, vec![1; 4])
            .push(Batch {
                samples: vec![9; 2],
                start_offset: 4,
                triggered: true,
                trigger_index: Some(5),
                ..Default::default()
            })
            .push(Batch::empty())
            .push_samples(6, vec![2; 10])
            .push_samples(16, vec![3; 10])
            .push(Batch::auto_stopped(Some(5)));

        let harness = spawn(&source, armed(), 64);
        let summary = harness.handle.join().unwrap();

        assert_eq!(summary.end, RunEnd::Triggered);
        assert_eq!(summary.samples, 26);

        let event = summary.trigger.unwrap();
        assert_eq!(event.source, TriggerSource::AutoStop);
        assert_eq!(event.downsampled_index, Some(5));
        assert_eq!(event.sample_index_in_raw_space, 20);

        // everything after the flagged batch made it into the ring
        let snapshot = buffer::lock(&harness.ring).snapshot();
        assert_eq!(snapshot.len(), 26);
        assert_eq!(snapshot[16..], [3.0; 10]);
    }

    #[test]
    fn triggered_flag_on_empty_poll_ends_the_run() {
        let source = ScriptedSource::new();
        source.set_trigger_info(Some(TriggerInfo {
            raw_sample_index: 1234,
        }));
        source.push_samples(0, vec![1; 4]).push(Batch {
            triggered: true,
            trigger_index: Some(3),
            ..Default::default()
        });

        let harness = spawn(&source, armed(), 10);
        let summary = harness.handle.join().unwrap();

        let event = summary.trigger.unwrap();
        assert_eq!(event.source, TriggerSource::TriggerFlag);
        assert_eq!(event.sample_index_in_raw_space, 1234);
        assert_eq!(summary.samples, 4);
    }

    #[test]
    fn auto_stop_with_final_samples_waits_for_an_empty_poll() {
        let source = ScriptedSource::new();
        source.push_samples(0, vec![1; 4]).push(Batch {
            samples: vec![2; 4],
            start_offset: 4,
            trigger_index: Some(6),
            auto_stopped: true,
            ..Default::default()
        });

        let harness = spawn(&source, armed(), 10);
        let summary = harness.handle.join().unwrap();

        assert_eq!(summary.end, RunEnd::Triggered);
        assert_eq!(summary.samples, 8);

        let event = summary.trigger.unwrap();
        assert_eq!(event.source, TriggerSource::AutoStop);
        assert_eq!(event.sample_index_in_raw_space, 24);
    }

    #[test]
    fn callbacks_may_subscribe_while_published() {
        let bus = Arc::new(TriggerBus::new());
        let inner = bus.clone();
        bus.subscribe(move |_| inner.subscribe(|_| {}));

        bus.publish(&TriggerEvent {
            sample_index_in_raw_space: 0,
            downsampled_index: None,
            fired_at: Instant::now(),
            source: TriggerSource::AutoStop,
        });

        assert_eq!(bus.len(), 2);
    }

    #[test]
    fn unarmed_loop_ignores_trigger_signals() {
        let source = ScriptedSource::new();
        source
            .push_samples(0, vec![1; 4])
            .push(Batch::auto_stopped(Some(2)));

        let harness = spawn(&source, AcquisitionParams::default(), 10);
        thread::sleep(Duration::from_millis(20));
        harness.control.request_stop();

        let summary = harness.handle.join().unwrap();
        assert_eq!(summary.end, RunEnd::StopRequested);
        assert!(summary.trigger.is_none());
    }

    #[test]
    fn poll_error_ends_the_run() {
        let source = ScriptedSource::new();
        source
            .push_samples(0, vec![1; 4])
            .push_error(SourceError::Io("usb disconnected".into()))
            .push_samples(4, vec![1; 4]);

        let harness = spawn(&source, AcquisitionParams::default(), 10);
        let result = harness.handle.join();

        assert!(matches!(result, Err(AcquisitionError::Poll(SourceError::Io(_)))));
        assert_eq!(buffer::lock(&harness.ring).len(), 4);
        assert_eq!(harness.source.pending(), 1);
        assert!(!harness.source.is_running());

        let errors = harness
            .notifications_rx
            .try_iter()
            .filter(|n| matches!(n, Notification::Error(_)))
            .count();
        assert_eq!(errors, 1);
    }

    #[test]
    fn batches_feed_the_periodic_log() {
        use crate::datalog::LogMetadata;
        use crate::source::ActualRates;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.npy");
        let params = AcquisitionParams::default();
        let rates = ActualRates {
            interval: params.sample_interval,
            unit: params.time_unit,
        };
        let metadata = LogMetadata::new(&params, &rates, Duration::ZERO);

        let source = ScriptedSource::new();
        let harness = spawn(&source, params, 10);
        *harness.sample_log.lock().unwrap() =
            Some(PeriodicLog::create(&path, Duration::ZERO, metadata).unwrap());

        source.push_samples(0, vec![4; 3]).push_samples(3, vec![-5; 2]);
        thread::sleep(Duration::from_millis(30));
        harness.control.request_stop();
        harness.handle.join().unwrap();

        assert_eq!(harness.sample_log.lock().unwrap().as_ref().unwrap().len(), 2);

        let bytes = std::fs::read(&path).unwrap();
        let logged: Vec<f32> = npyz::NpyFile::new(&bytes[..]).unwrap().into_vec().unwrap();
        assert_eq!(logged, vec![4.0, -5.0]);
    }

    #[test]
    fn pause_parks_the_worker_until_released() {
        let source = ScriptedSource::new();
        let harness = spawn(&source, AcquisitionParams::default(), 10);

        assert!(harness.control.pause.request());
        assert!(harness.control.pause.is_parked());
        assert_eq!(*harness.status.lock().unwrap(), AcquisitionStatus::Paused);

        let polls_while_parked = harness.source.count(&ScriptedCall::Poll);
        source.push_samples(0, vec![3; 2]);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(harness.source.count(&ScriptedCall::Poll), polls_while_parked);

        harness.control.pause.release();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(buffer::lock(&harness.ring).len(), 2);

        harness.control.request_stop();
        harness.handle.join().unwrap();
    }

    #[test]
    fn stop_while_paused_does_not_hang() {
        let source = ScriptedSource::new();
        let harness = spawn(&source, AcquisitionParams::default(), 10);

        assert!(harness.control.pause.request());
        harness.control.request_stop();

        let summary = harness.handle.join().unwrap();
        assert_eq!(summary.end, RunEnd::StopRequested);
        assert!(!harness.control.pause.request());
    }

    #[test]
    fn abort_skips_the_drain() {
        let source = ScriptedSource::new();
        let harness = spawn(&source, AcquisitionParams::default(), 10);
        thread::sleep(Duration::from_millis(5));

        source.push_samples(0, vec![1; 5]);
        harness.control.abort();

        let summary = harness.handle.join().unwrap();
        assert_eq!(summary.end, RunEnd::Aborted);
        assert_eq!(summary.drained, 0);
    }
}
