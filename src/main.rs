use std::process::exit;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn, LevelFilter};

use dypth01::{logging, SelectLine, SerialConnector, Timing};

#[derive(Parser, Debug)]
#[command(
    name = "dypth01-demo",
    about = "Poll a DYPTH01 sensor through a serial bridge and log readings"
)]
struct Args {
    /// Serial device of the bridge (e.g., /dev/ttyUSB0)
    port: String,
    /// Bridge baud rate
    #[arg(long, default_value_t = 9600)]
    baud: u32,
    /// Modem-control line wired to the sensor select input (rts or dtr)
    #[arg(long, default_value_t = SelectLine::Rts)]
    select: SelectLine,
    /// Drive the select line deasserted to select the sensor
    #[arg(long)]
    invert_select: bool,
    /// Pause between readings
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
    /// Stop after this many readings (default: run forever)
    #[arg(long)]
    count: Option<u64>,
    /// Wait after select before the first poll
    #[arg(long)]
    first_poll_ms: Option<u64>,
    /// Wait between polls
    #[arg(long)]
    poll_ms: Option<u64>,
    /// Polls after the first wait before giving up
    #[arg(long)]
    retries: Option<u8>,
    /// Log level (off, error, warn, info, debug, trace); overrides DYPTH01_LOG/RUST_LOG
    #[arg(long)]
    log_level: Option<LevelFilter>,
}

impl Args {
    fn timing(&self) -> Timing {
        let defaults = Timing::default();
        Timing {
            first_poll: self
                .first_poll_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.first_poll),
            poll_interval: self
                .poll_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            poll_retries: self.retries.unwrap_or(defaults.poll_retries),
        }
    }
}

fn main() {
    let args = Args::parse();
    logging::init_logging_with(args.log_level);
    if let Err(e) = run(&args) {
        error!("{e:#}");
        exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    let timing = args.timing();

    let connector = SerialConnector {
        baud_rate: args.baud,
        select_line: args.select,
        invert_select: args.invert_select,
        ..Default::default()
    };
    let mut sensor = connector
        .open(&args.port, timing)
        .with_context(|| format!("failed to open sensor bridge at {}", args.port))?;
    info!(
        "polling every {}ms via {}, at most {:?} per read",
        args.interval_ms,
        sensor.bus().select_line(),
        timing.max_wait()
    );

    let mut taken = 0u64;
    loop {
        match sensor.read() {
            Ok(reading) => info!("{reading}"),
            Err(e) if e.is_recoverable() => warn!("read error={} ({e})", e.code()),
            Err(e) => return Err(e).context("sensor read failed"),
        }

        taken += 1;
        if args.count.is_some_and(|count| taken >= count) {
            break;
        }
        thread::sleep(Duration::from_millis(args.interval_ms));
    }

    Ok(())
}
