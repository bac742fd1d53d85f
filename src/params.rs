use std::time::Duration;

use thiserror::Error;

/// Smallest ring buffer handed to the display, whatever the time window works out to.
pub const MIN_RING_CAPACITY: usize = 100;

/// Largest ring [`ring_capacity`] will size, 200 MB of `f32` samples.
pub const MAX_RING_CAPACITY: usize = 50_000_000;

/// Smallest hardware buffer suggested by [`optimal_buffer_size`].
pub const MIN_HW_BUFFER_SIZE: usize = 1000;

const MEMORY_SAFETY_MARGIN: f64 = 0.95;
const POST_TRIGGER_FALLBACK_FRACTION: f64 = 0.9;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParamsError {
    #[error("downsampling ratio must be at least 1")]
    InvalidRatio,
    #[error("sample interval must be positive, got {0}")]
    InvalidInterval(f64),
    #[error("sample rate must be positive, got {0} MSPS")]
    InvalidRate(f64),
    #[error("hardware buffer size must be positive")]
    EmptyBuffer,
    #[error("buffer needs {required} samples of device memory, only {available} available")]
    InsufficientMemory { required: u64, available: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownsamplingMode {
    Raw,
    Decimate,
    Average,
    Aggregate,
}

impl DownsamplingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownsamplingMode::Raw => "raw",
            DownsamplingMode::Decimate => "decimate",
            DownsamplingMode::Average => "average",
            DownsamplingMode::Aggregate => "aggregate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    Fs,
    Ps,
    Ns,
    Us,
    Ms,
    S,
}

impl TimeUnit {
    pub fn seconds(&self) -> f64 {
        match self {
            TimeUnit::Fs => 1e-15,
            TimeUnit::Ps => 1e-12,
            TimeUnit::Ns => 1e-9,
            TimeUnit::Us => 1e-6,
            TimeUnit::Ms => 1e-3,
            TimeUnit::S => 1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Fs => "fs",
            TimeUnit::Ps => "ps",
            TimeUnit::Ns => "ns",
            TimeUnit::Us => "us",
            TimeUnit::Ms => "ms",
            TimeUnit::S => "s",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Int8,
    Int16,
}

impl DataType {
    pub fn size(&self) -> usize {
        match self {
            DataType::Int8 => 1,
            DataType::Int16 => 2,
        }
    }

    /// Clamps a code to the range this type can carry.
    pub fn clamp(&self, code: i32) -> i16 {
        match self {
            DataType::Int8 => code.clamp(i8::MIN as i32, i8::MAX as i32) as i16,
            DataType::Int16 => code.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDirection {
    Rising,
    Falling,
    RisingOrFalling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerSettings {
    pub enabled: bool,
    pub threshold_adc: i16,
    pub direction: TriggerDirection,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        TriggerSettings {
            enabled: false,
            threshold_adc: 50,
            direction: TriggerDirection::RisingOrFalling,
        }
    }
}

/// Immutable snapshot of the streaming settings. A settings change always builds a new value.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionParams {
    pub ratio: u32,
    pub mode: DownsamplingMode,
    pub sample_interval: f64,
    pub time_unit: TimeUnit,
    pub pre_trigger_samples: u64,
    pub post_trigger_samples: u64,
    /// Arms trigger detection: the hardware halts once the trigger and post-trigger count are met.
    pub auto_stop: bool,
    pub samples_per_buffer: usize,
    pub data_type: DataType,
    pub trigger: TriggerSettings,
}

impl Default for AcquisitionParams {
    fn default() -> Self {
        AcquisitionParams {
            ratio: 64_000,
            mode: DownsamplingMode::Decimate,
            sample_interval: 1.0,
            time_unit: TimeUnit::Ns,
            pre_trigger_samples: 0,
            post_trigger_samples: 10_000,
            auto_stop: false,
            samples_per_buffer: 1_000_000,
            data_type: DataType::Int8,
            trigger: TriggerSettings::default(),
        }
    }
}

impl AcquisitionParams {
    pub fn with_ratio(mut self, ratio: u32, mode: DownsamplingMode) -> Self {
        self.ratio = ratio;
        self.mode = mode;
        self
    }

    pub fn with_interval(mut self, sample_interval: f64, time_unit: TimeUnit) -> Self {
        self.sample_interval = sample_interval;
        self.time_unit = time_unit;
        self
    }

    pub fn with_buffer(mut self, samples_per_buffer: usize, data_type: DataType) -> Self {
        self.samples_per_buffer = samples_per_buffer;
        self.data_type = data_type;
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerSettings, auto_stop: bool) -> Self {
        self.trigger = trigger;
        self.auto_stop = auto_stop;
        self
    }

    pub fn with_trigger_window(mut self, pre: u64, post: u64) -> Self {
        self.pre_trigger_samples = pre;
        self.post_trigger_samples = post;
        self
    }

    /// Rate the hardware was asked for. Rate math downstream of a start uses the read-back rate.
    pub fn requested_rate_hz(&self) -> f64 {
        sample_rate_hz(self.sample_interval, self.time_unit)
    }

    /// Whether the loop should treat an auto-stop or trigger flag as the end of the run.
    pub fn trigger_armed(&self) -> bool {
        self.auto_stop || self.trigger.enabled
    }

    /// Checks the parameters against the device limits and returns a corrected copy.
    ///
    /// A post-trigger count that does not fit the hardware buffer is pulled down to 90% of it
    /// instead of being rejected.
    pub fn validate(&self, max_memory: Option<u64>) -> Result<AcquisitionParams, ParamsError> {
        if self.ratio == 0 {
            return Err(ParamsError::InvalidRatio);
        }
        if !(self.sample_interval > 0.0) {
            return Err(ParamsError::InvalidInterval(self.sample_interval));
        }
        if self.samples_per_buffer == 0 {
            return Err(ParamsError::EmptyBuffer);
        }

        match max_memory {
            Some(available) => {
                let check = validate_buffer_size(self.samples_per_buffer, self.ratio, available);
                if !check.valid {
                    return Err(ParamsError::InsufficientMemory {
                        required: check.required,
                        available,
                    });
                }
                log::debug!(
                    "memory check passed: {} / {} samples ({:.1}%)",
                    check.required,
                    available,
                    check.percentage
                );
            }
            None => {
                log::warn!(
                    "cannot verify memory requirements (device memory unknown), will attempt to use {} samples",
                    self.samples_per_buffer as u64 * self.ratio as u64
                );
            }
        }

        let mut validated = self.clone();
        if validated.post_trigger_samples >= validated.samples_per_buffer as u64 {
            let adjusted =
                (validated.samples_per_buffer as f64 * POST_TRIGGER_FALLBACK_FRACTION) as u64;
            log::warn!(
                "post-trigger samples {} do not fit a {} sample buffer, adjusted to {}",
                validated.post_trigger_samples,
                validated.samples_per_buffer,
                adjusted
            );
            validated.post_trigger_samples = adjusted;
        }

        Ok(validated)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayConfig {
    /// Span of downsampled data kept for the consumer.
    pub time_window: Duration,
    /// Sleep between polls that returned nothing.
    pub poll_interval: Duration,
    /// How often the consumer is expected to take snapshots.
    pub refresh_interval: Duration,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        DisplayConfig {
            time_window: Duration::from_secs(1),
            poll_interval: Duration::from_millis(1),
            refresh_interval: Duration::from_secs_f64(1.0 / 30.0),
        }
    }
}

/// Tunables of one streaming session.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub display: DisplayConfig,
    pub drain_timeout: Duration,
    pub drain_retry_interval: Duration,
    pub throughput_window: Duration,
    pub efficiency_history: usize,
    pub efficiency_notify_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            display: DisplayConfig::default(),
            drain_timeout: Duration::from_secs(2),
            drain_retry_interval: Duration::from_millis(50),
            throughput_window: Duration::from_secs(1),
            efficiency_history: 50,
            efficiency_notify_interval: Duration::from_millis(100),
        }
    }
}

/// Converts an interval in `unit` into a rate in Hz. Non-positive intervals give 0.
pub fn sample_rate_hz(interval: f64, unit: TimeUnit) -> f64 {
    if interval > 0.0 {
        1.0 / (interval * unit.seconds())
    } else {
        0.0
    }
}

/// Picks an integer interval for a desired rate in MSPS, nanoseconds first.
pub fn interval_from_msps(msps: f64) -> Result<(f64, TimeUnit), ParamsError> {
    if !(msps > 0.0) {
        return Err(ParamsError::InvalidRate(msps));
    }

    let sps = msps * 1e6;

    let interval_ns = (1e9 / sps).round();
    if interval_ns >= 1.0 {
        return Ok((interval_ns, TimeUnit::Ns));
    }

    let interval_ps = (1e12 / sps).round().max(1.0);
    Ok((interval_ps, TimeUnit::Ps))
}

/// Ring capacity needed to show `time_window` of data downsampled by `ratio`.
pub fn ring_capacity(time_window: Duration, adc_rate_hz: f64, ratio: u32) -> usize {
    let ratio = ratio.max(1) as f64;
    let calculated = (time_window.as_secs_f64() * adc_rate_hz / ratio).floor();
    let calculated = if calculated.is_finite() && calculated > 0.0 {
        calculated as usize
    } else {
        0
    };

    if calculated > MAX_RING_CAPACITY {
        log::warn!(
            "time window {:?} needs {} samples, ring capped at {}",
            time_window,
            calculated,
            MAX_RING_CAPACITY
        );
        return MAX_RING_CAPACITY;
    }

    calculated.max(MIN_RING_CAPACITY)
}

/// Largest hardware buffer that fits in 95% of the device memory at the given ratio.
pub fn optimal_buffer_size(max_memory: u64, ratio: u32) -> usize {
    let ratio = ratio.max(1) as f64;
    let optimal = (max_memory as f64 * MEMORY_SAFETY_MARGIN / ratio) as usize;

    optimal.max(MIN_HW_BUFFER_SIZE)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferCheck {
    pub valid: bool,
    pub required: u64,
    pub percentage: f64,
}

pub fn validate_buffer_size(buffer_size: usize, ratio: u32, max_memory: u64) -> BufferCheck {
    let required = buffer_size as u64 * ratio as u64;
    let percentage = if max_memory > 0 {
        required as f64 / max_memory as f64 * 100.0
    } else {
        f64::INFINITY
    };

    BufferCheck {
        valid: required <= max_memory,
        required,
        percentage,
    }
}
