use std::fmt::Display;
use std::io::Write;
use std::path::Path;

use crate::source::ActualRates;

/// Maps ring indices to seconds: one downsampled sample spans `ratio` ADC samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timebase {
    pub ratio: u32,
    pub adc_rate_hz: f64,
}

impl Timebase {
    pub fn new(ratio: u32, adc_rate_hz: f64) -> Timebase {
        Timebase { ratio, adc_rate_hz }
    }

    pub fn from_rates(ratio: u32, rates: &ActualRates) -> Timebase {
        Timebase::new(ratio, rates.sample_rate_hz())
    }

    pub fn seconds_per_sample(&self) -> f64 {
        if self.adc_rate_hz > 0.0 {
            self.ratio as f64 / self.adc_rate_hz
        } else {
            0.0
        }
    }

    pub fn time_of(&self, index: usize) -> f64 {
        index as f64 * self.seconds_per_sample()
    }
}

fn write_csv_row<I, T>(writer: &mut impl Write, items: I) -> std::io::Result<()>
where
    I: Iterator<Item = T>,
    T: Display,
{
    let row = items
        .map(|item| format!("{}", item))
        .reduce(|row, item_string| row + "," + &item_string)
        .unwrap_or_default();

    writer.write_all(row.as_bytes())?;
    writer.write_all(b"\n")?;

    Ok(())
}

pub fn write_csv(filename: &Path, samples: &[f32], timebase: Timebase) -> std::io::Result<()> {
    let file = std::fs::File::create(filename)?;
    let mut writer = std::io::BufWriter::new(file);

    write_csv_row(&mut writer, ["time_s", "value"].iter())?;

    for (i, value) in samples.iter().enumerate() {
        write_csv_row(
            &mut writer,
            [timebase.time_of(i), *value as f64].iter(),
        )?;
    }

    let file = writer.into_inner().map_err(|err| err.into_error())?;
    file.sync_all()?;

    Ok(())
}

/// Writes an `n × 2` float64 array, columns time (s) and value.
pub fn write_npy(filename: &Path, samples: &[f32], timebase: Timebase) -> std::io::Result<()> {
    use npyz::WriterBuilder;

    let mut file = std::fs::File::create(filename)?;

    let mut writer = {
        npyz::WriteOptions::new()
            .default_dtype()
            .shape(&[samples.len() as u64, 2])
            .writer(&mut file)
            .begin_nd()?
    };

    for (i, value) in samples.iter().enumerate() {
        writer.extend([timebase.time_of(i), *value as f64])?;
    }

    writer.finish()?;
    file.sync_all()?;

    Ok(())
}
