use std::time::{Duration, Instant};

use crate::params::{AcquisitionParams, DataType, DownsamplingMode, TriggerDirection};
use crate::source::{ActualRates, Batch, Result, SampleSource, SourceError, TriggerInfo};

const DEFAULT_TIMEBASE_STEP: f64 = 0.8e-9;
const DEFAULT_MAX_MEMORY: u64 = 4 * 1024 * 1024 * 1024;
const AVERAGE_PROBES: u64 = 16;

#[derive(Debug, Clone, Copy)]
struct Registration {
    samples_per_buffer: usize,
    data_type: DataType,
    mode: DownsamplingMode,
}

#[derive(Debug, Default)]
struct RunState {
    started_at: Option<Instant>,
    /// Raw sample count frozen by a stop; the remainder is still readable until drained.
    frozen_raw: Option<u64>,
    emitted: u64,
    buffer_index: usize,
    buffer_fill: usize,
    previous: Option<i16>,
    trigger_index: Option<u64>,
    auto_stopped: bool,
}

/// Simulated streaming oscilloscope.
///
/// Produces a sine wave in ADC codes at the configured rate, downsampled in hardware, through
/// two alternating buffers. The requested interval is snapped to the device timebase, so the
/// rate read back from `configure` usually differs from the one asked for.
pub struct FakeSource {
    signal_hz: f64,
    amplitude: f64,
    timebase_step: f64,
    max_memory: u64,
    params: Option<AcquisitionParams>,
    rate_hz: f64,
    registration: Option<Registration>,
    buffers: [Vec<i16>; 2],
    running: bool,
    run: RunState,
}

impl FakeSource {
    pub fn new() -> FakeSource {
        FakeSource {
            signal_hz: 5.0,
            amplitude: 100.0,
            timebase_step: DEFAULT_TIMEBASE_STEP,
            max_memory: DEFAULT_MAX_MEMORY,
            params: None,
            rate_hz: 0.0,
            registration: None,
            buffers: [Vec::new(), Vec::new()],
            running: false,
            run: RunState::default(),
        }
    }

    pub fn with_signal(mut self, signal_hz: f64, amplitude: f64) -> FakeSource {
        self.signal_hz = signal_hz;
        self.amplitude = amplitude;
        self
    }

    pub fn with_timebase_step(mut self, step: Duration) -> FakeSource {
        self.timebase_step = step.as_secs_f64();
        self
    }

    pub fn with_max_memory(mut self, max_memory: u64) -> FakeSource {
        self.max_memory = max_memory;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn raw_value(&self, raw_index: u64) -> f64 {
        let t = raw_index as f64 / self.rate_hz;
        self.amplitude * (2.0 * std::f64::consts::PI * self.signal_hz * t).sin()
    }

    fn downsampled_value(&self, k: u64, ratio: u64, mode: DownsamplingMode) -> f64 {
        let start = k * ratio;

        match mode {
            DownsamplingMode::Raw | DownsamplingMode::Decimate => self.raw_value(start),
            DownsamplingMode::Average | DownsamplingMode::Aggregate => {
                let probes = AVERAGE_PROBES.min(ratio);
                let values = (0..probes).map(|i| self.raw_value(start + i * ratio / probes));

                if mode == DownsamplingMode::Average {
                    values.sum::<f64>() / probes as f64
                } else {
                    values.fold(f64::NEG_INFINITY, f64::max)
                }
            }
        }
    }

    fn crosses(direction: TriggerDirection, threshold: i16, previous: i16, value: i16) -> bool {
        let rising = previous < threshold && value >= threshold;
        let falling = previous > threshold && value <= threshold;

        match direction {
            TriggerDirection::Rising => rising,
            TriggerDirection::Falling => falling,
            TriggerDirection::RisingOrFalling => rising || falling,
        }
    }

    /// Raw samples the hardware has acquired so far in this run.
    fn acquired_raw(&self, params: &AcquisitionParams) -> u64 {
        let elapsed_raw = match (self.run.frozen_raw, self.run.started_at) {
            (Some(frozen), _) => frozen,
            (None, Some(started_at)) => (started_at.elapsed().as_secs_f64() * self.rate_hz) as u64,
            (None, None) => 0,
        };

        match self.auto_stop_limit(params) {
            Some(limit) => elapsed_raw.min(limit),
            None => elapsed_raw,
        }
    }

    /// Raw sample count at which an auto-stopping run halts, once the trigger is known.
    fn auto_stop_limit(&self, params: &AcquisitionParams) -> Option<u64> {
        match (self.run.trigger_index, params.auto_stop) {
            (Some(trigger), true) => Some(trigger * params.ratio as u64 + params.post_trigger_samples),
            _ => None,
        }
    }
}

impl Default for FakeSource {
    fn default() -> Self {
        FakeSource::new()
    }
}

impl SampleSource for FakeSource {
    fn configure(&mut self, params: &AcquisitionParams) -> Result<ActualRates> {
        if params.ratio == 0 {
            return Err(SourceError::Rejected("ratio must be at least 1".into()));
        }
        if params.mode == DownsamplingMode::Raw && params.ratio != 1 {
            return Err(SourceError::Rejected(
                "raw mode does not downsample, ratio must be 1".into(),
            ));
        }

        let requested = params.sample_interval * params.time_unit.seconds();
        if !(requested > 0.0) {
            return Err(SourceError::Rejected(format!(
                "invalid sample interval {} {}",
                params.sample_interval,
                params.time_unit.as_str()
            )));
        }

        let steps = (requested / self.timebase_step).round().max(1.0);
        let actual = steps * self.timebase_step;

        self.rate_hz = 1.0 / actual;
        self.params = Some(params.clone());

        let rates = ActualRates {
            interval: actual / params.time_unit.seconds(),
            unit: params.time_unit,
        };

        log::debug!(
            "fake source configured: requested {} {}, actual {:.4} {} ({:.3} MSPS)",
            params.sample_interval,
            params.time_unit.as_str(),
            rates.interval,
            rates.unit.as_str(),
            self.rate_hz / 1e6
        );

        Ok(rates)
    }

    fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        if self.params.is_none() {
            return Err(SourceError::NotConfigured);
        }
        if self.registration.is_none() {
            return Err(SourceError::Rejected("no buffers registered".into()));
        }

        self.run = RunState {
            started_at: Some(Instant::now()),
            ..Default::default()
        };
        self.running = true;

        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }

        if let Some(params) = &self.params {
            self.run.frozen_raw = Some(self.acquired_raw(params));
        }
        self.running = false;

        Ok(())
    }

    fn poll(&mut self) -> Result<Batch> {
        let params = match &self.params {
            Some(params) => params.clone(),
            None => return Err(SourceError::NotConfigured),
        };
        let registration = match self.registration {
            Some(registration) => registration,
            None if self.run.started_at.is_none() => return Ok(Batch::empty()),
            None => return Err(SourceError::Rejected("no buffers registered".into())),
        };
        if self.run.started_at.is_none() {
            return Ok(Batch::empty());
        }

        let ratio = params.ratio as u64;
        let acquired = self.acquired_raw(&params);
        let available = (acquired / ratio).saturating_sub(self.run.emitted);

        if available == 0 {
            // the hardware halts by itself once every post-trigger sample was handed out
            if let (Some(limit), false) = (self.auto_stop_limit(&params), self.run.auto_stopped) {
                if acquired >= limit {
                    self.run.auto_stopped = true;
                    self.run.frozen_raw = Some(acquired);
                    self.running = false;
                }
            }

            return Ok(Batch {
                buffer_index: self.run.buffer_index,
                trigger_index: self.run.trigger_index,
                auto_stopped: self.run.auto_stopped,
                ..Default::default()
            });
        }

        let space = registration.samples_per_buffer - self.run.buffer_fill;
        let n = (available as usize).min(space);

        let start_offset = self.run.emitted;
        let buffer_index = self.run.buffer_index;
        let fill = self.run.buffer_fill;
        let mut triggered_now = false;
        let mut written = n;

        for i in 0..n {
            let k = start_offset + i as u64;
            let value = registration
                .data_type
                .clamp(self.downsampled_value(k, ratio, registration.mode).round() as i32);

            if params.trigger.enabled && self.run.trigger_index.is_none() {
                if let Some(previous) = self.run.previous {
                    if Self::crosses(
                        params.trigger.direction,
                        params.trigger.threshold_adc,
                        previous,
                        value,
                    ) {
                        log::debug!("fake source trigger at downsampled sample {}", k);
                        self.run.trigger_index = Some(k);
                        triggered_now = true;
                    }
                }
            }

            self.buffers[buffer_index][fill + i] = value;
            self.run.previous = Some(value);

            if let Some(limit) = self.auto_stop_limit(&params) {
                if k + 1 >= limit / ratio {
                    written = i + 1;
                    break;
                }
            }
        }

        self.run.emitted += written as u64;
        self.run.buffer_fill += written;
        if self.run.buffer_fill == registration.samples_per_buffer {
            self.run.buffer_index = 1 - self.run.buffer_index;
            self.run.buffer_fill = 0;
        }

        Ok(Batch {
            samples: self.buffers[buffer_index][fill..fill + written].to_vec(),
            start_offset,
            buffer_index,
            triggered: triggered_now,
            trigger_index: self.run.trigger_index,
            auto_stopped: false,
        })
    }

    fn register_buffers(
        &mut self,
        samples_per_buffer: usize,
        data_type: DataType,
        mode: DownsamplingMode,
    ) -> Result<()> {
        if samples_per_buffer == 0 {
            return Err(SourceError::Rejected("empty buffer".into()));
        }

        let reuse = matches!(self.registration, Some(r) if r.samples_per_buffer == samples_per_buffer);
        if !reuse || self.buffers[0].len() != samples_per_buffer {
            self.buffers = [vec![0; samples_per_buffer], vec![0; samples_per_buffer]];
        }

        self.registration = Some(Registration {
            samples_per_buffer,
            data_type,
            mode,
        });
        self.run.buffer_index = 0;
        self.run.buffer_fill = 0;

        Ok(())
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.registration = None;
        Ok(())
    }

    fn trigger_info(&mut self) -> Result<Option<TriggerInfo>> {
        let ratio = self.params.as_ref().map(|p| p.ratio as u64).unwrap_or(1);

        Ok(self.run.trigger_index.map(|k| TriggerInfo {
            raw_sample_index: k * ratio,
        }))
    }

    fn read_raw(&mut self, start_raw: u64, count: usize) -> Result<Vec<i16>> {
        let params = match &self.params {
            Some(params) => params.clone(),
            None => return Err(SourceError::NotConfigured),
        };
        if self.running {
            return Err(SourceError::Rejected(
                "raw samples can only be read once streaming stopped".into(),
            ));
        }

        let data_type = self
            .registration
            .map(|registration| registration.data_type)
            .unwrap_or(params.data_type);
        let end = start_raw.saturating_add(count as u64).min(self.acquired_raw(&params));

        Ok((start_raw..end)
            .map(|i| data_type.clamp(self.raw_value(i).round() as i32))
            .collect())
    }

    fn max_available_memory(&self) -> Option<u64> {
        Some(self.max_memory)
    }
}
