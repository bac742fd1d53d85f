//! Continuous streaming acquisition core for a sampling oscilloscope.
//!
//! A [`Session`] owns a [`SampleSource`], a worker thread polling it, and the ring buffer a
//! display reads snapshots from. Parameters can be changed while streaming through
//! [`Session::reconfigure`], which pauses the worker and reprograms the hardware.

pub mod acquisition;
pub mod buffer;
pub mod capture;
pub mod datalog;
pub mod export;
pub mod metrics;
pub mod params;
pub mod reconfigure;
pub mod session;
pub mod source;

pub use acquisition::{
    AcquisitionError, AcquisitionStatus, Notification, RunEnd, RunSummary, TriggerEvent,
    TriggerSource,
};
pub use buffer::{RingBuffer, SharedRing};
pub use capture::RawCapture;
pub use datalog::{LogMetadata, PeriodicLog};
pub use metrics::{EfficiencyReport, HealthStatus};
pub use params::{AcquisitionParams, DisplayConfig, StreamConfig};
pub use reconfigure::{Applied, ReconfigurationError};
pub use session::{Session, SessionError};
pub use source::{ActualRates, Batch, SampleSource, SourceError};
