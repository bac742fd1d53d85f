use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::acquisition::{lock_or_recover, LoopControl, PauseGate};
use crate::buffer::{self, SharedRing};
use crate::metrics::MetricsTracker;
use crate::params::{self, AcquisitionParams, DataType, ParamsError};
use crate::source::{ActualRates, SampleSource, SourceError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReconfigurationError {
    #[error("invalid acquisition parameters: {0}")]
    Invalid(#[from] ParamsError),
    #[error("acquisition is not running")]
    NotRunning,
    #[error("reconfiguration failed, previous settings restored: {cause}")]
    RolledBack { cause: SourceError },
    #[error("reconfiguration failed ({cause}) and previous settings could not be restored ({rollback})")]
    Fatal {
        cause: SourceError,
        rollback: SourceError,
    },
}

/// Shape of the hardware double buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPlan {
    pub samples_per_buffer: usize,
    pub data_type: DataType,
}

impl BufferPlan {
    pub fn from_params(params: &AcquisitionParams) -> BufferPlan {
        BufferPlan {
            samples_per_buffer: params.samples_per_buffer,
            data_type: params.data_type,
        }
    }

    pub fn bytes_per_buffer(&self) -> usize {
        self.samples_per_buffer * self.data_type.size()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Applied {
    pub rates: ActualRates,
    pub ring_capacity: usize,
    pub reallocated_hw: bool,
    pub reallocated_ring: bool,
}

struct PauseGuard<'a>(&'a PauseGate);

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.0.release();
        log::debug!("pause released");
    }
}

/// Applies new acquisition parameters to a running pipeline.
///
/// The worker is parked for the whole sequence; every exit path releases it.
pub struct ReconfigurationCoordinator<S> {
    pub source: Arc<Mutex<S>>,
    pub ring: SharedRing,
    pub metrics: Arc<Mutex<MetricsTracker>>,
    pub control: Arc<LoopControl>,
    pub active: Arc<Mutex<AcquisitionParams>>,
    pub rates: Arc<Mutex<Option<ActualRates>>>,
}

impl<S: SampleSource> ReconfigurationCoordinator<S> {
    pub fn apply(
        &self,
        requested: &AcquisitionParams,
        time_window: Duration,
    ) -> Result<Applied, ReconfigurationError> {
        let max_memory = lock_or_recover(&self.source).max_available_memory();
        let new = requested.validate(max_memory)?;
        let old = lock_or_recover(&self.active).clone();

        log::info!(
            "reconfiguring: ratio {} -> {}, interval {} {} -> {} {}",
            old.ratio,
            new.ratio,
            old.sample_interval,
            old.time_unit.as_str(),
            new.sample_interval,
            new.time_unit.as_str()
        );

        let _guard = PauseGuard(&self.control.pause);
        if !self.control.pause.request() {
            return Err(ReconfigurationError::NotRunning);
        }
        log::debug!("acquisition parked");

        match self.program(&old, &new) {
            Ok((rates, reallocated_hw)) => {
                let (ring_capacity, reallocated_ring) = self.rebuild(&new, rates, time_window);
                *lock_or_recover(&self.active) = new;

                log::info!(
                    "reconfiguration applied: {:.3} MS/s actual, ring capacity {}",
                    rates.sample_rate_hz() / 1e6,
                    ring_capacity
                );

                Ok(Applied {
                    rates,
                    ring_capacity,
                    reallocated_hw,
                    reallocated_ring,
                })
            }
            Err(cause) => {
                log::warn!("reconfiguration failed: {}, restoring previous settings", cause);

                match self.program(&new, &old) {
                    Ok((rates, _)) => {
                        self.rebuild(&old, rates, time_window);
                        Err(ReconfigurationError::RolledBack { cause })
                    }
                    Err(rollback) => {
                        log::error!("failed to restore previous settings: {}", rollback);

                        if let Err(err) = lock_or_recover(&self.source).stop() {
                            log::warn!("failed to stop source: {}", err);
                        }
                        *lock_or_recover(&self.rates) = None;
                        self.control.abort();

                        Err(ReconfigurationError::Fatal { cause, rollback })
                    }
                }
            }
        }
    }

    /// Stop, clear, register and restart the hardware with `to`. Returns the read-back rates
    /// and whether the double buffers had to be reallocated.
    fn program(
        &self,
        from: &AcquisitionParams,
        to: &AcquisitionParams,
    ) -> Result<(ActualRates, bool), SourceError> {
        let mut source = lock_or_recover(&self.source);

        source.stop()?;
        source.clear_buffers()?;

        let old_plan = BufferPlan::from_params(from);
        let new_plan = BufferPlan::from_params(to);
        let reallocated_hw = old_plan != new_plan;
        if reallocated_hw {
            log::debug!(
                "hardware buffers resized: {} -> {} bytes each",
                old_plan.bytes_per_buffer(),
                new_plan.bytes_per_buffer()
            );
        }

        source.register_buffers(to.samples_per_buffer, to.data_type, to.mode)?;

        let rates = source.configure(to)?;
        source.start()?;

        let requested = to.requested_rate_hz();
        let actual = rates.sample_rate_hz();
        if (actual - requested).abs() > requested * 1e-6 {
            log::info!(
                "requested {:.3} MS/s, hardware runs at {:.3} MS/s",
                requested / 1e6,
                actual / 1e6
            );
        }

        Ok((rates, reallocated_hw))
    }

    fn rebuild(
        &self,
        params: &AcquisitionParams,
        rates: ActualRates,
        time_window: Duration,
    ) -> (usize, bool) {
        let adc_rate = rates.sample_rate_hz();
        let capacity = params::ring_capacity(time_window, adc_rate, params.ratio);

        let reallocated = {
            let mut ring = buffer::lock(&self.ring);
            let reallocated = ring.reallocate(capacity);
            if !reallocated {
                ring.reset();
            }
            reallocated
        };

        lock_or_recover(&self.metrics).rebase(adc_rate / params.ratio.max(1) as f64);
        *lock_or_recover(&self.rates) = Some(rates);

        (capacity, reallocated)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;

    use super::*;
    use crate::acquisition::{AcquisitionLoop, AcquisitionStatus, LoopContext, RunEnd, TriggerBus};
    use crate::buffer::RingBuffer;
    use crate::params::{DownsamplingMode, StreamConfig, TimeUnit};
    use crate::source::{ScriptedCall, ScriptedSource};

    fn params_a() -> AcquisitionParams {
        AcquisitionParams::default()
            .with_ratio(100, DownsamplingMode::Decimate)
            .with_interval(1.0, TimeUnit::Us)
    }

    fn params_b() -> AcquisitionParams {
        AcquisitionParams::default()
            .with_ratio(10, DownsamplingMode::Average)
            .with_interval(1.0, TimeUnit::Us)
            .with_buffer(200_000, DataType::Int16)
    }

    fn coordinator(
        source: &ScriptedSource,
        params: AcquisitionParams,
    ) -> ReconfigurationCoordinator<ScriptedSource> {
        ReconfigurationCoordinator {
            source: Arc::new(Mutex::new(source.clone())),
            ring: RingBuffer::shared(100),
            metrics: Arc::new(Mutex::new(MetricsTracker::new(Duration::from_secs(1), 50))),
            control: Arc::new(LoopControl::new(Duration::from_millis(1))),
            active: Arc::new(Mutex::new(params)),
            rates: Arc::new(Mutex::new(None)),
        }
    }

    fn spawn_worker(coordinator: &ReconfigurationCoordinator<ScriptedSource>) -> crate::acquisition::AcquisitionHandle {
        let (notifications_tx, _) = mpsc::channel();
        AcquisitionLoop::spawn(LoopContext {
            source: coordinator.source.clone(),
            ring: coordinator.ring.clone(),
            metrics: coordinator.metrics.clone(),
            control: coordinator.control.clone(),
            triggers: Arc::new(TriggerBus::new()),
            active: coordinator.active.clone(),
            status: Arc::new(Mutex::new(AcquisitionStatus::Stopped)),
            sample_log: Arc::new(Mutex::new(None)),
            config: StreamConfig::default(),
            notifications_tx,
        })
    }

    #[test]
    fn buffer_plan_tracks_size_and_type() {
        let a = BufferPlan::from_params(&params_a());
        let b = BufferPlan::from_params(&params_b());

        assert_ne!(a, b);
        assert_eq!(a.bytes_per_buffer(), 1_000_000);
        assert_eq!(b.bytes_per_buffer(), 400_000);
    }

    #[test]
    fn refuses_without_a_worker() {
        let source = ScriptedSource::new();
        let coordinator = coordinator(&source, params_a());

        let result = coordinator.apply(&params_b(), Duration::from_secs(1));
        assert_eq!(result, Err(ReconfigurationError::NotRunning));
        assert!(source.calls().is_empty());
        assert!(!coordinator.control.pause.is_requested());
    }

    #[test]
    fn invalid_params_touch_nothing() {
        let source = ScriptedSource::new();
        let coordinator = coordinator(&source, params_a());

        let mut bad = params_b();
        bad.ratio = 0;

        let result = coordinator.apply(&bad, Duration::from_secs(1));
        assert_eq!(result, Err(ReconfigurationError::Invalid(ParamsError::InvalidRatio)));
        assert!(source.calls().is_empty());
    }

    #[test]
    fn applies_in_order_and_sizes_ring_from_actual_rate() {
        let source = ScriptedSource::new();
        source.set_interval_scale(2.0);
        let coordinator = coordinator(&source, params_a());
        let worker = spawn_worker(&coordinator);

        buffer::lock(&coordinator.ring).write(&[1i16, 2, 3][..]);

        let applied = coordinator.apply(&params_b(), Duration::from_secs(1)).unwrap();

        // 1 us requested, 2 us read back -> 500 kS/s / 10
        assert_eq!(applied.ring_capacity, 50_000);
        assert!(applied.reallocated_hw);
        assert!(applied.reallocated_ring);
        assert!(buffer::lock(&coordinator.ring).is_empty());
        assert_eq!(lock_or_recover(&coordinator.active).ratio, 10);
        assert!((lock_or_recover(&coordinator.metrics).expected_rate() - 50_000.0).abs() < 1e-6);
        assert!(!coordinator.control.pause.is_requested());

        let calls: Vec<ScriptedCall> = source
            .calls()
            .into_iter()
            .filter(|c| *c != ScriptedCall::Poll)
            .collect();
        assert_eq!(
            calls,
            vec![
                ScriptedCall::Stop,
                ScriptedCall::ClearBuffers,
                ScriptedCall::RegisterBuffers(200_000, DataType::Int16, DownsamplingMode::Average),
                ScriptedCall::Configure(params_b()),
                ScriptedCall::Start,
            ]
        );

        coordinator.control.request_stop();
        assert_eq!(worker.join().unwrap().end, RunEnd::StopRequested);
    }

    #[test]
    fn failure_restores_previous_settings() {
        let source = ScriptedSource::new();
        source.reject(params_b());
        let coordinator = coordinator(&source, params_a());
        let worker = spawn_worker(&coordinator);

        let result = coordinator.apply(&params_b(), Duration::from_secs(1));

        assert!(matches!(result, Err(ReconfigurationError::RolledBack { .. })));
        assert_eq!(*lock_or_recover(&coordinator.active), params_a());
        assert_eq!(source.count(&ScriptedCall::Configure(params_a())), 1);
        assert!(source.is_running());
        assert!(!coordinator.control.abort_requested());

        thread::sleep(Duration::from_millis(10));
        assert!(!worker.is_finished());

        coordinator.control.request_stop();
        worker.join().unwrap();
    }

    #[test]
    fn failed_rollback_aborts_and_releases_the_worker() {
        let source = ScriptedSource::new();
        source.reject(params_a());
        source.reject(params_b());
        let coordinator = coordinator(&source, params_a());
        let worker = spawn_worker(&coordinator);

        let result = coordinator.apply(&params_b(), Duration::from_secs(1));

        assert!(matches!(result, Err(ReconfigurationError::Fatal { .. })));
        assert!(coordinator.control.abort_requested());
        assert!(!coordinator.control.pause.is_requested());
        assert!(lock_or_recover(&coordinator.rates).is_none());

        let summary = worker.join().unwrap();
        assert_eq!(summary.end, RunEnd::Aborted);
        assert!(!source.is_running());
    }
}
