//! Serial-bridge adapter for the DYPTH01.
//!
//! On a host the sensor hangs off a USB-serial bridge: its data output feeds
//! the bridge RX, and one modem-control line (RTS or DTR) drives its
//! active-low select input. A dedicated reader thread stands in for the
//! receive interrupt and pushes every byte into the driver's collector.

use std::fmt;
use std::io::{ErrorKind, Read};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use log::{debug, info, trace, warn};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::dypth01::{BusControl, Dypth01, StdDelay, Timing, WeakByteSink};
use crate::errors::Result;

const DEFAULT_BAUD_RATE: u32 = 9600;
const DEFAULT_IO_TIMEOUT_MS: u64 = 100;
const READER_THREAD_NAME: &str = "dypth01-rx";

/// Modem-control line wired to the sensor's select input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectLine {
    #[default]
    Rts,
    Dtr,
}

impl fmt::Display for SelectLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectLine::Rts => f.write_str("rts"),
            SelectLine::Dtr => f.write_str("dtr"),
        }
    }
}

impl FromStr for SelectLine {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rts" => Ok(SelectLine::Rts),
            "dtr" => Ok(SelectLine::Dtr),
            other => Err(format!("invalid select line '{other}' (expected rts or dtr)")),
        }
    }
}

/// Opens the bridge and wires it to a [`Dypth01`] driver.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    pub baud_rate: u32,
    pub select_line: SelectLine,
    /// Drive the line deasserted to select the sensor (bridges without
    /// inverting level shifters).
    pub invert_select: bool,
    pub io_timeout: Duration,
}

impl Default for SerialConnector {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            select_line: SelectLine::default(),
            invert_select: false,
            io_timeout: Duration::from_millis(DEFAULT_IO_TIMEOUT_MS),
        }
    }
}

impl SerialConnector {
    /// Open the port at `path`, leave select released and start the reader
    /// thread. The thread exits once the returned driver is dropped.
    pub fn open(&self, path: &str, timing: Timing) -> Result<Dypth01<SerialBus, StdDelay>> {
        debug!(
            "opening serial bridge: path={}, baud={}, select={}",
            path, self.baud_rate, self.select_line
        );
        let port = serialport::new(path, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.io_timeout)
            .open()?;
        let reader = port.try_clone()?;

        let bus = SerialBus {
            port: Mutex::new(port),
            select_line: self.select_line,
            invert_select: self.invert_select,
            gate: ReceiveGate::default(),
        };
        let driver = Dypth01::with_timing(bus, StdDelay, timing);
        spawn_reader(reader, driver.byte_sink().downgrade())?;

        info!(
            "serial bridge ready: path={}, select={}{}",
            path,
            self.select_line,
            if self.invert_select { " (inverted)" } else { "" }
        );
        Ok(driver)
    }
}

/// [`BusControl`] over a serial port's modem-control lines.
///
/// Control-line failures are logged and otherwise ignored: a select line
/// that did not move shows up as a read timeout.
pub struct SerialBus {
    port: Mutex<Box<dyn SerialPort>>,
    select_line: SelectLine,
    invert_select: bool,
    gate: ReceiveGate,
}

impl SerialBus {
    pub fn select_line(&self) -> SelectLine {
        self.select_line
    }

    pub fn is_receiving(&self) -> bool {
        self.gate.is_open()
    }

    fn port(&self) -> MutexGuard<'_, Box<dyn SerialPort>> {
        self.port.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn drive_select(&self, active: bool) {
        let level = active != self.invert_select;
        let mut port = self.port();
        let res = match self.select_line {
            SelectLine::Rts => port.write_request_to_send(level),
            SelectLine::Dtr => port.write_data_terminal_ready(level),
        };
        if let Err(e) = res {
            warn!(
                "failed to drive select line: line={}, active={}, error={}",
                self.select_line, active, e
            );
        }
    }
}

impl BusControl for SerialBus {
    fn assert_select(&self) {
        self.drive_select(true);
    }

    fn release_select(&self) {
        self.drive_select(false);
    }

    fn enable_receive(&self) {
        // Drop what the bridge buffered while disabled; anything the reader
        // already pulled out is rejected by the new epoch.
        if let Err(e) = self.port().clear(ClearBuffer::Input) {
            warn!("failed to discard serial input: {}", e);
        }
        self.gate.open();
    }

    fn disable_receive(&self) {
        self.gate.close();
    }
}

impl ReceiveGated for SerialBus {
    fn gate(&self) -> &ReceiveGate {
        &self.gate
    }
}

/// Receive-enable flag plus a transaction epoch bumped on every enable.
///
/// The reader takes a ticket before a blocking read and delivers the batch
/// only if the gate is still open on the same epoch afterwards.
#[derive(Debug, Default)]
struct ReceiveGate {
    open: AtomicBool,
    epoch: AtomicU32,
}

impl ReceiveGate {
    fn open(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.open.store(true, Ordering::Release);
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn ticket(&self) -> Option<u32> {
        let epoch = self.epoch.load(Ordering::Acquire);
        self.is_open().then_some(epoch)
    }

    fn admits(&self, ticket: Option<u32>) -> bool {
        ticket.is_some_and(|epoch| self.is_open() && self.epoch.load(Ordering::Acquire) == epoch)
    }
}

trait ReceiveGated {
    fn gate(&self) -> &ReceiveGate;
}

fn spawn_reader(mut port: Box<dyn SerialPort>, sink: WeakByteSink<SerialBus>) -> Result<()> {
    thread::Builder::new()
        .name(READER_THREAD_NAME.into())
        .spawn(move || {
            let mut buf = [0u8; 16];
            while pump(&mut port, &sink, &mut buf) {}
        })?;
    Ok(())
}

/// One read from the port into the collector. Returns `false` once the
/// reader should exit.
fn pump<B, R>(port: &mut R, sink: &WeakByteSink<B>, buf: &mut [u8]) -> bool
where
    B: BusControl + ReceiveGated,
    R: Read + ?Sized,
{
    // No strong handle across the blocking read, so dropping the driver
    // is noticed within one I/O timeout.
    let ticket = match sink.upgrade() {
        Some(sink) => sink.bus().gate().ticket(),
        None => {
            debug!("driver dropped, serial reader exiting");
            return false;
        }
    };

    let n = match port.read(buf) {
        Ok(n) => n,
        Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => 0,
        Err(e) => {
            warn!("serial reader stopped: {}", e);
            return false;
        }
    };

    let Some(sink) = sink.upgrade() else {
        debug!("driver dropped, serial reader exiting");
        return false;
    };
    if n == 0 {
        return true;
    }
    for &byte in &buf[..n] {
        if !sink.bus().gate().admits(ticket) {
            trace!("dropping {} byte(s) outside the current transaction", n);
            break;
        }
        sink.on_byte(byte);
    }
    true
}
