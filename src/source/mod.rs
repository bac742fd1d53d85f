use thiserror::Error;

use crate::params::{AcquisitionParams, DataType, DownsamplingMode, TimeUnit};

mod fakesource;
mod scripted;

pub use fakesource::FakeSource;
pub use scripted::{ScriptedCall, ScriptedSource};

pub type Result<T> = std::result::Result<T, SourceError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("source I/O error: {0}")]
    Io(String),
    #[error("source used before being configured")]
    NotConfigured,
    #[error("source is not streaming")]
    NotRunning,
    #[error("source rejected the request: {0}")]
    Rejected(String),
    #[error("operation not supported by this source: {0}")]
    Unsupported(&'static str),
}

/// One poll worth of downsampled samples, plus the flags the driver reported with it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub samples: Vec<i16>,
    /// Index of `samples[0]` in the downsampled stream of the current run.
    pub start_offset: u64,
    /// Which of the two hardware buffers the samples were copied from.
    pub buffer_index: usize,
    pub triggered: bool,
    /// Trigger position in the downsampled stream, when the driver reports one.
    pub trigger_index: Option<u64>,
    pub auto_stopped: bool,
}

impl Batch {
    pub fn empty() -> Batch {
        Batch::default()
    }

    pub fn with_samples(start_offset: u64, samples: Vec<i16>) -> Batch {
        Batch {
            samples,
            start_offset,
            ..Default::default()
        }
    }

    pub fn auto_stopped(trigger_index: Option<u64>) -> Batch {
        Batch {
            auto_stopped: true,
            trigger_index,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Sample interval as read back from the hardware after configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActualRates {
    pub interval: f64,
    pub unit: TimeUnit,
}

impl ActualRates {
    pub fn sample_rate_hz(&self) -> f64 {
        crate::params::sample_rate_hz(self.interval, self.unit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerInfo {
    pub raw_sample_index: u64,
}

/// Acquisition device seam. The vendor driver sits behind an implementation of this trait.
///
/// `start` and `stop` must be idempotent. `poll` never blocks: it returns whatever the
/// hardware has made available since the previous call, possibly nothing.
pub trait SampleSource: Send {
    fn configure(&mut self, params: &AcquisitionParams) -> Result<ActualRates>;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn poll(&mut self) -> Result<Batch>;

    fn register_buffers(
        &mut self,
        samples_per_buffer: usize,
        data_type: DataType,
        mode: DownsamplingMode,
    ) -> Result<()>;
    fn clear_buffers(&mut self) -> Result<()>;

    /// Best-effort raw-space trigger position of the last run.
    fn trigger_info(&mut self) -> Result<Option<TriggerInfo>> {
        Ok(None)
    }

    /// Reads back up to `count` raw (not downsampled) samples starting at `start_raw`, once the
    /// run has stopped. Fewer are returned when the device holds fewer.
    fn read_raw(&mut self, _start_raw: u64, _count: usize) -> Result<Vec<i16>> {
        Err(SourceError::Unsupported("raw sample read"))
    }

    /// Device memory available for streaming, in raw samples, if the driver can tell.
    fn max_available_memory(&self) -> Option<u64> {
        None
    }
}

impl<T: SampleSource + ?Sized> SampleSource for Box<T> {
    fn configure(&mut self, params: &AcquisitionParams) -> Result<ActualRates> {
        (**self).configure(params)
    }

    fn start(&mut self) -> Result<()> {
        (**self).start()
    }

    fn stop(&mut self) -> Result<()> {
        (**self).stop()
    }

    fn poll(&mut self) -> Result<Batch> {
        (**self).poll()
    }

    fn register_buffers(
        &mut self,
        samples_per_buffer: usize,
        data_type: DataType,
        mode: DownsamplingMode,
    ) -> Result<()> {
        (**self).register_buffers(samples_per_buffer, data_type, mode)
    }

    fn clear_buffers(&mut self) -> Result<()> {
        (**self).clear_buffers()
    }

    fn trigger_info(&mut self) -> Result<Option<TriggerInfo>> {
        (**self).trigger_info()
    }

    fn read_raw(&mut self, start_raw: u64, count: usize) -> Result<Vec<i16>> {
        (**self).read_raw(start_raw, count)
    }

    fn max_available_memory(&self) -> Option<u64> {
        (**self).max_available_memory()
    }
}
