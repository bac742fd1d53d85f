use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use crate::buffer::{self, SharedRing};
use crate::params::StreamConfig;
use crate::source::{SampleSource, SourceError};

use super::lock_or_recover;

#[derive(Debug, Clone, PartialEq)]
pub struct DrainReport {
    pub drained: usize,
    pub polls: usize,
    pub timed_out: bool,
    pub error: Option<SourceError>,
}

/// Collects what the hardware still holds once streaming has stopped.
///
/// Polls until one poll returns nothing, a poll fails, or the timeout elapses. Drained samples
/// land in the ring exactly like live ones.
#[derive(Debug, Clone, Copy)]
pub struct DrainProtocol {
    pub timeout: Duration,
    pub retry_interval: Duration,
}

impl DrainProtocol {
    pub fn new(timeout: Duration, retry_interval: Duration) -> DrainProtocol {
        DrainProtocol {
            timeout,
            retry_interval,
        }
    }

    pub fn from_config(config: &StreamConfig) -> DrainProtocol {
        DrainProtocol::new(config.drain_timeout, config.drain_retry_interval)
    }

    pub fn run<S, F>(&self, source: &Mutex<S>, ring: &SharedRing, mut on_batch: F) -> DrainReport
    where
        S: SampleSource,
        F: FnMut(usize, usize),
    {
        let started = Instant::now();
        let mut report = DrainReport {
            drained: 0,
            polls: 0,
            timed_out: true,
            error: None,
        };

        while started.elapsed() < self.timeout {
            let result = lock_or_recover(source).poll();
            report.polls += 1;

            match result {
                Ok(batch) if batch.is_empty() => {
                    report.timed_out = false;
                    break;
                }
                Ok(batch) => {
                    let (filled, capacity) = {
                        let mut ring = buffer::lock(ring);
                        ring.write(&batch.samples);
                        (ring.len(), ring.capacity())
                    };
                    report.drained += batch.len();
                    log::debug!("drained {} samples from hardware buffer", batch.len());
                    on_batch(filled, capacity);
                }
                Err(err) => {
                    log::warn!("error while draining hardware buffer: {}", err);
                    report.error = Some(err);
                    report.timed_out = false;
                    break;
                }
            }

            thread::sleep(self.retry_interval);
        }

        if report.timed_out {
            log::warn!(
                "buffer drain timed out after {:?} ({} samples collected)",
                self.timeout,
                report.drained
            );
        } else if report.drained > 0 {
            log::info!("drained {} remaining samples", report.drained);
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RingBuffer;
    use crate::source::{Batch, ScriptedSource};

    fn protocol() -> DrainProtocol {
        DrainProtocol::new(Duration::from_millis(200), Duration::from_millis(1))
    }

    #[test]
    fn drains_until_an_empty_poll() {
        let script = ScriptedSource::new();
        script
            .push_samples(0, vec![1, 2, 3])
            .push_samples(3, vec![4, 5])
            .push(Batch::empty())
            .push_samples(5, vec![6]);

        let source = Mutex::new(script.clone());
        let ring = RingBuffer::shared(10);

        let mut updates = Vec::new();
        let report = protocol().run(&source, &ring, |filled, capacity| updates.push((filled, capacity)));

        assert_eq!(report.drained, 5);
        assert_eq!(report.polls, 3);
        assert!(!report.timed_out);
        assert_eq!(updates, vec![(3, 10), (5, 10)]);
        assert_eq!(buffer::lock(&ring).snapshot(), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(script.pending(), 1);
    }

    #[test]
    fn poll_error_ends_the_drain() {
        let script = ScriptedSource::new();
        script
            .push_samples(0, vec![1, 2])
            .push_error(SourceError::Io("gone".into()));

        let source = Mutex::new(script);
        let ring = RingBuffer::shared(10);
        let report = protocol().run(&source, &ring, |_, _| {});

        assert_eq!(report.drained, 2);
        assert_eq!(report.error, Some(SourceError::Io("gone".into())));
        assert!(!report.timed_out);
    }

    #[test]
    fn gives_up_after_the_timeout() {
        let script = ScriptedSource::new();
        for i in 0..1000 {
            script.push_samples(i, vec![0]);
        }

        let source = Mutex::new(script);
        let ring = RingBuffer::shared(10);
        let protocol = DrainProtocol::new(Duration::from_millis(30), Duration::from_millis(5));
        let report = protocol.run(&source, &ring, |_, _| {});

        assert!(report.timed_out);
        assert!(report.drained > 0 && report.drained < 1000);
    }
}
