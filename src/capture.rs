/// Raw (not downsampled) samples read back from the device around a trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCapture {
    pub start_raw: u64,
    pub trigger_raw: u64,
    pub adc_rate_hz: f64,
    pub samples: Vec<i16>,
}

impl RawCapture {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Position of the trigger within `samples`, if the capture covers it.
    pub fn trigger_offset(&self) -> Option<usize> {
        let offset = self.trigger_raw.checked_sub(self.start_raw)?;
        (offset < self.samples.len() as u64).then_some(offset as usize)
    }

    /// Seconds since the start of the run. Downsampled sample `k` of the same run sits at
    /// `k * ratio` on this axis, so both traces line up.
    pub fn time_of(&self, index: usize) -> f64 {
        if self.adc_rate_hz > 0.0 {
            (self.start_raw + index as u64) as f64 / self.adc_rate_hz
        } else {
            0.0
        }
    }

    /// Seconds relative to the trigger, negative before it.
    pub fn time_from_trigger(&self, index: usize) -> f64 {
        if self.adc_rate_hz > 0.0 {
            ((self.start_raw + index as u64) as f64 - self.trigger_raw as f64) / self.adc_rate_hz
        } else {
            0.0
        }
    }
}

/// Raw window `(start, count)` to read back for a trigger at `trigger_raw`: `pre` samples
/// before it and `post` after, capped to the device memory.
pub fn raw_window(trigger_raw: u64, pre: u64, post: u64, max_memory: Option<u64>) -> (u64, usize) {
    let start = trigger_raw.saturating_sub(pre);
    let mut count = trigger_raw.saturating_add(post) - start;

    if let Some(max_memory) = max_memory {
        if count > max_memory {
            log::warn!(
                "raw window of {} samples exceeds device memory, reading {}",
                count,
                max_memory
            );
            count = max_memory;
        }
    }

    (start, count.min(usize::MAX as u64) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_around_trigger() {
        assert_eq!(raw_window(10_000, 1_000, 5_000, None), (9_000, 6_000));
        // not enough history before the trigger
        assert_eq!(raw_window(300, 1_000, 5_000, None), (0, 5_300));
        assert_eq!(raw_window(10_000, 1_000, 5_000, Some(4_000)), (9_000, 4_000));
    }

    #[test]
    fn trigger_position_and_time_axis() {
        let capture = RawCapture {
            start_raw: 9_000,
            trigger_raw: 10_000,
            adc_rate_hz: 1e6,
            samples: vec![0; 6_000],
        };

        assert_eq!(capture.trigger_offset(), Some(1_000));
        assert!((capture.time_of(1_000) - 0.01).abs() < 1e-12);
        assert!((capture.time_from_trigger(0) + 0.001).abs() < 1e-12);
        assert!(capture.time_from_trigger(1_000).abs() < 1e-12);

        let missed = RawCapture {
            start_raw: 11_000,
            ..capture
        };
        assert_eq!(missed.trigger_offset(), None);
    }
}
