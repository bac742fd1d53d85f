use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::params::AcquisitionParams;
use crate::source::ActualRates;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("log file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("log metadata is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareSettings {
    pub channel: String,
    pub adc_sample_rate_hz: f64,
    pub sample_interval: f64,
    pub sample_interval_units: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownsamplingSettings {
    pub ratio: u32,
    pub mode: String,
    pub downsampled_rate_hz: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub log_interval_s: f64,
    /// Which sample of a batch gets logged.
    pub sample_selection: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFormat {
    pub file_type: String,
    pub data_type: String,
    pub units: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingStats {
    pub total_samples_logged: u64,
    pub last_update_time: String,
}

/// Sidecar describing a periodic log, stored next to the `.npy` as `<stem>_metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMetadata {
    pub log_start_time: String,
    pub hardware_settings: HardwareSettings,
    pub downsampling_settings: DownsamplingSettings,
    pub logging_settings: LoggingSettings,
    pub data_format: DataFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging_stats: Option<LoggingStats>,
}

impl LogMetadata {
    pub fn new(params: &AcquisitionParams, rates: &ActualRates, interval: Duration) -> LogMetadata {
        let adc_rate = rates.sample_rate_hz();

        LogMetadata {
            log_start_time: chrono::Utc::now().to_rfc3339(),
            hardware_settings: HardwareSettings {
                channel: "A".into(),
                adc_sample_rate_hz: adc_rate,
                sample_interval: rates.interval,
                sample_interval_units: rates.unit.as_str().into(),
            },
            downsampling_settings: DownsamplingSettings {
                ratio: params.ratio,
                mode: params.mode.as_str().into(),
                downsampled_rate_hz: adc_rate / params.ratio.max(1) as f64,
            },
            logging_settings: LoggingSettings {
                log_interval_s: interval.as_secs_f64(),
                sample_selection: "first_sample".into(),
            },
            data_format: DataFormat {
                file_type: "npy".into(),
                data_type: "float32".into(),
                units: "adc_counts".into(),
            },
            logging_stats: None,
        }
    }

    pub fn read(path: &Path) -> Result<LogMetadata, LogError> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    fn write(&self, path: &Path) -> Result<(), LogError> {
        let mut writer = std::io::BufWriter::new(std::fs::File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
}

/// `data/run.npy` -> `data/run_metadata.json`
pub fn metadata_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}_metadata.json", stem))
}

/// Keeps one sample per `interval` while streaming, in a 1-D float32 `.npy` rewritten on every
/// append so the file on disk is always complete.
pub struct PeriodicLog {
    path: PathBuf,
    metadata_path: PathBuf,
    interval: Duration,
    last_logged: Option<Instant>,
    values: Vec<f32>,
    metadata: LogMetadata,
}

impl PeriodicLog {
    /// Creates (or truncates) the log and writes its metadata sidecar.
    pub fn create(
        path: impl Into<PathBuf>,
        interval: Duration,
        metadata: LogMetadata,
    ) -> Result<PeriodicLog, LogError> {
        let path = path.into();
        let log = PeriodicLog {
            metadata_path: metadata_path(&path),
            path,
            interval,
            last_logged: None,
            values: Vec::new(),
            metadata,
        };

        log.write_values()?;
        log.metadata.write(&log.metadata_path)?;

        log::info!(
            "periodic log to {} every {:?}",
            log.path.display(),
            log.interval
        );

        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata_path(&self) -> &Path {
        &self.metadata_path
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Logs the first sample of `samples` if `interval` elapsed since the last one. Returns
    /// whether a sample was written.
    pub fn offer(&mut self, samples: &[i16], now: Instant) -> Result<bool, LogError> {
        let first = match samples.first() {
            Some(first) => *first,
            None => return Ok(false),
        };

        let due = match self.last_logged {
            Some(at) => now.duration_since(at) >= self.interval,
            None => true,
        };
        if !due {
            return Ok(false);
        }

        self.append(first as f32)?;
        self.last_logged = Some(now);

        Ok(true)
    }

    pub fn append(&mut self, value: f32) -> Result<(), LogError> {
        self.values.push(value);
        self.write_values()?;

        self.metadata.logging_stats = Some(LoggingStats {
            total_samples_logged: self.values.len() as u64,
            last_update_time: chrono::Utc::now().to_rfc3339(),
        });
        self.metadata.write(&self.metadata_path)
    }

    fn write_values(&self) -> Result<(), LogError> {
        use npyz::WriterBuilder;

        let mut file = std::fs::File::create(&self.path)?;

        let mut writer = {
            npyz::WriteOptions::new()
                .default_dtype()
                .shape(&[self.values.len() as u64])
                .writer(&mut file)
                .begin_nd()?
        };

        writer.extend(self.values.iter().copied())?;
        writer.finish()?;

        Ok(())
    }
}
