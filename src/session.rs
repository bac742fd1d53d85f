use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::acquisition::{
    lock_or_recover, AcquisitionError, AcquisitionHandle, AcquisitionLoop, AcquisitionStatus,
    LoopContext, LoopControl, Notification, RunSummary, TriggerBus, TriggerEvent,
};
use crate::buffer::{self, RingBuffer, SharedRing};
use crate::capture::{self, RawCapture};
use crate::datalog::{LogError, LogMetadata, PeriodicLog};
use crate::metrics::{EfficiencyReport, MetricsTracker};
use crate::params::{self, AcquisitionParams, ParamsError, StreamConfig};
use crate::reconfigure::{Applied, ReconfigurationCoordinator, ReconfigurationError};
use crate::source::{ActualRates, SampleSource, SourceError};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid acquisition parameters: {0}")]
    Params(#[from] ParamsError),
    #[error("failed to program the source: {0}")]
    Source(#[from] SourceError),
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
    #[error(transparent)]
    Reconfiguration(#[from] ReconfigurationError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("acquisition is already running")]
    AlreadyRunning,
    #[error("no trigger fired since the last start")]
    NoTrigger,
}

/// One streaming acquisition pipeline: the source, the ring buffer the consumer reads, and the
/// worker thread feeding it.
pub struct Session<S: SampleSource + 'static> {
    source: Arc<Mutex<S>>,
    ring: SharedRing,
    metrics: Arc<Mutex<MetricsTracker>>,
    control: Arc<LoopControl>,
    triggers: Arc<TriggerBus>,
    active: Arc<Mutex<AcquisitionParams>>,
    rates: Arc<Mutex<Option<ActualRates>>>,
    status: Arc<Mutex<AcquisitionStatus>>,
    last_trigger: Arc<Mutex<Option<TriggerEvent>>>,
    sample_log: Arc<Mutex<Option<PeriodicLog>>>,
    config: StreamConfig,
    notifications_tx: mpsc::Sender<Notification>,
    notifications_rx: mpsc::Receiver<Notification>,
    worker: Option<AcquisitionHandle>,
}

impl<S: SampleSource + 'static> Session<S> {
    pub fn open(
        source: S,
        params: AcquisitionParams,
        config: StreamConfig,
    ) -> Result<Session<S>, SessionError> {
        let params = params.validate(source.max_available_memory())?;

        let capacity = params::ring_capacity(
            config.display.time_window,
            params.requested_rate_hz(),
            params.ratio,
        );
        let (notifications_tx, notifications_rx) = mpsc::channel();

        log::info!(
            "session opened: ratio {} ({}), ring capacity {}",
            params.ratio,
            params.mode.as_str(),
            capacity
        );

        let triggers = Arc::new(TriggerBus::new());
        let last_trigger = Arc::new(Mutex::new(None));
        {
            let last_trigger = last_trigger.clone();
            triggers.subscribe(move |event: &TriggerEvent| {
                *lock_or_recover(&last_trigger) = Some(event.clone());
            });
        }

        Ok(Session {
            source: Arc::new(Mutex::new(source)),
            ring: RingBuffer::shared(capacity),
            metrics: Arc::new(Mutex::new(MetricsTracker::new(
                config.throughput_window,
                config.efficiency_history,
            ))),
            control: Arc::new(LoopControl::new(config.display.poll_interval)),
            triggers,
            active: Arc::new(Mutex::new(params)),
            rates: Arc::new(Mutex::new(None)),
            status: Arc::new(Mutex::new(AcquisitionStatus::Stopped)),
            last_trigger,
            sample_log: Arc::new(Mutex::new(None)),
            config,
            notifications_tx,
            notifications_rx,
            worker: None,
        })
    }

    /// Programs the hardware with the active parameters and spawns the acquisition worker.
    ///
    /// Whatever the ring held from a previous run is discarded.
    pub fn start(&mut self) -> Result<ActualRates, SessionError> {
        if self.is_running() {
            return Err(SessionError::AlreadyRunning);
        }
        self.reap();

        let params = self.params();

        let rates = {
            let mut source = lock_or_recover(&self.source);
            // leftovers of a previous run are not part of this one
            source.stop()?;
            source.clear_buffers()?;
            source.register_buffers(params.samples_per_buffer, params.data_type, params.mode)?;
            let rates = source.configure(&params)?;
            source.start()?;
            rates
        };

        let adc_rate = rates.sample_rate_hz();
        let capacity = params::ring_capacity(self.config.display.time_window, adc_rate, params.ratio);
        {
            let mut ring = buffer::lock(&self.ring);
            if !ring.reallocate(capacity) {
                ring.reset();
            }
        }
        lock_or_recover(&self.metrics).rebase(adc_rate / params.ratio as f64);
        *lock_or_recover(&self.rates) = Some(rates);
        *lock_or_recover(&self.last_trigger) = None;

        log::info!(
            "streaming at {:.3} MS/s ({} {}), {:.1} kS/s after downsampling",
            adc_rate / 1e6,
            rates.interval,
            rates.unit.as_str(),
            adc_rate / params.ratio as f64 / 1e3
        );

        self.control.rearm();
        self.worker = Some(AcquisitionLoop::spawn(LoopContext {
            source: self.source.clone(),
            ring: self.ring.clone(),
            metrics: self.metrics.clone(),
            control: self.control.clone(),
            triggers: self.triggers.clone(),
            active: self.active.clone(),
            status: self.status.clone(),
            sample_log: self.sample_log.clone(),
            config: self.config.clone(),
            notifications_tx: self.notifications_tx.clone(),
        }));

        Ok(rates)
    }

    /// Ends the current run, if any, and starts a fresh one. Used to re-arm after a trigger.
    pub fn restart(&mut self) -> Result<ActualRates, SessionError> {
        if let Some(summary) = self.stop()? {
            log::debug!("previous run ended with {:?}", summary.end);
        }
        self.start()
    }

    /// Asks the worker to stop; it drains the hardware before exiting.
    pub fn request_stop(&self) {
        self.control.request_stop();
    }

    /// Stops and joins the worker. Returns `None` when nothing was running.
    pub fn stop(&mut self) -> Result<Option<RunSummary>, SessionError> {
        self.control.request_stop();
        let summary = self.wait()?;

        if let Err(err) = lock_or_recover(&self.source).stop() {
            log::warn!("failed to stop source: {}", err);
        }

        Ok(summary)
    }

    /// Blocks until the current run ends on its own (trigger or error).
    pub fn wait(&mut self) -> Result<Option<RunSummary>, SessionError> {
        match self.worker.take() {
            Some(worker) => Ok(Some(worker.join()?)),
            None => Ok(None),
        }
    }

    fn reap(&mut self) {
        if let Some(worker) = self.worker.take() {
            if let Err(err) = worker.join() {
                log::warn!("previous acquisition run ended with error: {}", err);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().map_or(false, |worker| !worker.is_finished())
    }

    pub fn snapshot(&self) -> Vec<f32> {
        buffer::lock(&self.ring).snapshot()
    }

    pub fn snapshot_into(&self, out: &mut Vec<f32>) {
        buffer::lock(&self.ring).snapshot_into(out);
    }

    pub fn ring(&self) -> SharedRing {
        self.ring.clone()
    }

    pub fn subscribe_to_trigger_events<F>(&self, callback: F)
    where
        F: Fn(&TriggerEvent) + Send + Sync + 'static,
    {
        self.triggers.subscribe(callback);
    }

    /// The trigger that ended the most recent run, if it ended on one.
    pub fn last_trigger(&self) -> Option<TriggerEvent> {
        lock_or_recover(&self.last_trigger).clone()
    }

    /// Reads back the raw samples around the last trigger: the active pre-trigger count before
    /// it and the post-trigger count after, capped to the device memory.
    pub fn pull_raw_around_trigger(&mut self) -> Result<RawCapture, SessionError> {
        if self.is_running() {
            return Err(SessionError::AlreadyRunning);
        }
        self.reap();

        let trigger = self.last_trigger().ok_or(SessionError::NoTrigger)?;
        let rates = self.rates().ok_or(SourceError::NotConfigured)?;
        let params = self.params();

        let mut source = lock_or_recover(&self.source);
        let (start_raw, count) = capture::raw_window(
            trigger.sample_index_in_raw_space,
            params.pre_trigger_samples,
            params.post_trigger_samples,
            source.max_available_memory(),
        );
        let samples = source.read_raw(start_raw, count)?;
        drop(source);

        log::info!(
            "pulled {} of {} raw samples from {} (trigger @ {})",
            samples.len(),
            count,
            start_raw,
            trigger.sample_index_in_raw_space
        );

        Ok(RawCapture {
            start_raw,
            trigger_raw: trigger.sample_index_in_raw_space,
            adc_rate_hz: rates.sample_rate_hz(),
            samples,
        })
    }

    /// Starts logging the first sample of a batch every `interval` to a `.npy` at `path`, with a
    /// `<stem>_metadata.json` sidecar. Replaces any log already running.
    pub fn start_logging(
        &self,
        path: impl Into<PathBuf>,
        interval: Duration,
    ) -> Result<(), SessionError> {
        let params = self.params();
        let rates = self.rates().unwrap_or(ActualRates {
            interval: params.sample_interval,
            unit: params.time_unit,
        });

        let metadata = LogMetadata::new(&params, &rates, interval);
        let log = PeriodicLog::create(path, interval, metadata)?;
        *lock_or_recover(&self.sample_log) = Some(log);

        Ok(())
    }

    /// Stops the periodic log. Returns how many samples it holds.
    pub fn stop_logging(&self) -> Option<usize> {
        lock_or_recover(&self.sample_log)
            .take()
            .map(|log| log.len())
    }

    pub fn is_logging(&self) -> bool {
        lock_or_recover(&self.sample_log).is_some()
    }

    pub fn current_efficiency(&self) -> EfficiencyReport {
        lock_or_recover(&self.metrics).current_efficiency()
    }

    pub fn ingest_rate(&self) -> f64 {
        lock_or_recover(&self.metrics).ingest_rate()
    }

    /// Like [`Session::reconfigure`], reporting only whether the new parameters are in effect.
    pub fn request_reconfiguration(&mut self, params: AcquisitionParams) -> bool {
        match self.reconfigure(params) {
            Ok(_) => true,
            Err(err) => {
                log::error!("reconfiguration rejected: {}", err);
                false
            }
        }
    }

    /// Applies new parameters. While streaming this restarts the hardware under a paused worker;
    /// otherwise the parameters are only validated and kept for the next start.
    pub fn reconfigure(
        &mut self,
        params: AcquisitionParams,
    ) -> Result<Option<Applied>, SessionError> {
        if self.is_running() {
            let coordinator = ReconfigurationCoordinator {
                source: self.source.clone(),
                ring: self.ring.clone(),
                metrics: self.metrics.clone(),
                control: self.control.clone(),
                active: self.active.clone(),
                rates: self.rates.clone(),
            };

            match coordinator.apply(&params, self.config.display.time_window) {
                Ok(applied) => {
                    self.notify(Notification::Info(format!(
                        "settings applied, ring capacity {}",
                        applied.ring_capacity
                    )));
                    return Ok(Some(applied));
                }
                Err(ReconfigurationError::NotRunning) => {
                    log::debug!("worker exited before the pause, storing parameters");
                }
                Err(err) => {
                    if let ReconfigurationError::Fatal { .. } = err {
                        self.reap();
                    }
                    self.notify(Notification::Error(err.to_string()));
                    return Err(err.into());
                }
            }
        }

        let max_memory = lock_or_recover(&self.source).max_available_memory();
        let validated = params.validate(max_memory)?;
        *lock_or_recover(&self.active) = validated;

        Ok(None)
    }

    /// Resizes the ring for a new display span without touching the hardware. Returns the new
    /// capacity.
    pub fn set_time_window(&mut self, time_window: Duration) -> usize {
        self.config.display.time_window = time_window;

        let params = self.params();
        let adc_rate = self
            .rates()
            .map(|rates| rates.sample_rate_hz())
            .unwrap_or_else(|| params.requested_rate_hz());
        let capacity = params::ring_capacity(time_window, adc_rate, params.ratio);

        if buffer::lock(&self.ring).reallocate(capacity) {
            log::info!("time window {:?}: ring capacity {}", time_window, capacity);
        }

        capacity
    }

    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.config.display.poll_interval = interval;
        self.control.set_poll_interval(interval);
    }

    pub fn params(&self) -> AcquisitionParams {
        lock_or_recover(&self.active).clone()
    }

    pub fn rates(&self) -> Option<ActualRates> {
        *lock_or_recover(&self.rates)
    }

    pub fn status(&self) -> AcquisitionStatus {
        *lock_or_recover(&self.status)
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Notifications produced since the last call.
    pub fn notifications(&self) -> mpsc::TryIter<'_, Notification> {
        self.notifications_rx.try_iter()
    }

    pub fn close(mut self) -> Result<Option<RunSummary>, SessionError> {
        self.stop()
    }

    fn notify(&self, notification: Notification) {
        if let Err(err) = self.notifications_tx.send(notification) {
            log::trace!("notification dropped: {:?}", err.0);
        }
    }
}

impl<S: SampleSource + 'static> Drop for Session<S> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            log::debug!("session dropped while acquiring, stopping");
            if let Err(err) = self.stop() {
                log::error!("failed to stop acquisition: {}", err);
            }
        }
    }
}
