use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;

use streamscope::export::{self, Timebase};
use streamscope::params::{DownsamplingMode, TimeUnit, TriggerDirection, TriggerSettings};
use streamscope::source::FakeSource;
use streamscope::{AcquisitionParams, Notification, Session, StreamConfig};

struct Args {
    run_for: Duration,
    output: Option<PathBuf>,
    log: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = std::env::args().skip(1);

    let run_for = match args.next() {
        Some(seconds) => Duration::from_secs_f64(
            seconds
                .parse::<f64>()
                .with_context(|| format!("invalid duration '{}'", seconds))?,
        ),
        None => Duration::from_secs(3),
    };

    Ok(Args {
        run_for,
        output: args.next().map(PathBuf::from),
        log: args.next().map(PathBuf::from),
    })
}

fn drain_notifications(session: &Session<FakeSource>) {
    for notification in session.notifications() {
        match notification {
            Notification::NewStatus(status) => log::info!("status: {:?}", status),
            Notification::Info(info) => log::info!("{}", info),
            Notification::Error(err) => log::error!("{}", err),
            Notification::Efficiency(report) => log::debug!(
                "efficiency {:.1}% (jitter {:.1}) {}",
                report.avg,
                report.jitter,
                report.status
            ),
            Notification::Triggered(event) => {
                log::info!("triggered at raw sample {}", event.sample_index_in_raw_space)
            }
            Notification::Drained(count) => log::info!("drained {} samples", count),
            Notification::BufferStatus { .. } => {}
        }
    }
}

fn stream_for(session: &Session<FakeSource>, duration: Duration) {
    let started = Instant::now();
    let refresh = session.config().display.refresh_interval;
    let mut frame = Vec::new();

    while started.elapsed() < duration {
        thread::sleep(refresh);
        session.snapshot_into(&mut frame);
        drain_notifications(session);
    }

    let efficiency = session.current_efficiency();
    log::info!(
        "{} samples on screen, ingesting {:.0} S/s, efficiency {:.1}% ({})",
        frame.len(),
        session.ingest_rate(),
        efficiency.avg,
        efficiency.status
    );
}

fn main() -> anyhow::Result<()> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .env()
        .init()
        .context("failed to initialize logger")?;

    let args = parse_args()?;

    let params = AcquisitionParams::default()
        .with_ratio(100, DownsamplingMode::Decimate)
        .with_interval(1.0, TimeUnit::Us);

    let mut session = Session::open(FakeSource::new(), params.clone(), StreamConfig::default())
        .context("failed to open session")?;

    session.start().context("failed to start streaming")?;
    if let Some(path) = &args.log {
        session
            .start_logging(path.clone(), Duration::from_millis(100))
            .with_context(|| format!("failed to create log {}", path.display()))?;
    }
    stream_for(&session, args.run_for / 2);

    let faster = params.clone().with_ratio(50, DownsamplingMode::Average);
    match session.reconfigure(faster)? {
        Some(applied) => log::info!("ring resized to {} samples", applied.ring_capacity),
        None => log::warn!("acquisition stopped before the new settings could be applied"),
    }
    stream_for(&session, args.run_for / 2);

    let summary = session.stop()?;
    drain_notifications(&session);
    log::info!("free-running capture ended: {:?}", summary.map(|s| s.samples));
    if let Some(logged) = session.stop_logging() {
        log::info!("{} samples logged", logged);
    }

    // single shot: arm on a rising edge and let the hardware stop by itself
    let armed = params.with_trigger(
        TriggerSettings {
            enabled: true,
            threshold_adc: 50,
            direction: TriggerDirection::Rising,
        },
        true,
    );
    session.reconfigure(armed)?;
    session.subscribe_to_trigger_events(|event| {
        log::info!("trigger via {:?}", event.source);
    });
    session.start()?;

    if let Some(summary) = session.wait()? {
        log::info!("single shot captured {} samples", summary.samples);
    }
    drain_notifications(&session);

    match session.pull_raw_around_trigger() {
        Ok(capture) => log::info!(
            "{} raw samples around the trigger, trigger at offset {:?}",
            capture.len(),
            capture.trigger_offset()
        ),
        Err(err) => log::warn!("no raw samples pulled: {}", err),
    }

    if let Some(path) = args.output {
        let snapshot = session.snapshot();
        let rates = session.rates().context("source never reported its rate")?;
        let timebase = Timebase::from_rates(session.params().ratio, &rates);

        let is_npy = path.extension().map_or(false, |ext| ext == "npy");
        let written = if is_npy {
            export::write_npy(&path, &snapshot, timebase)
        } else {
            export::write_csv(&path, &snapshot, timebase)
        };
        written.with_context(|| format!("failed to write {}", path.display()))?;

        log::info!("wrote {} samples to {}", snapshot.len(), path.display());
    }

    session.close()?;

    Ok(())
}
