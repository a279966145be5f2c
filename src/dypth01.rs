//! DYPTH01 humidity/temperature sensor acquisition.
//!
//! The sensor is a bus master: once its select input is pulled active it
//! clocks out a 4-byte frame on its own schedule. The host side therefore
//! never drives the clock; it only:
//!
//! 1. arms the receive trigger and asserts select,
//! 2. sleeps while bytes arrive in "interrupt context" (a hardware ISR on a
//!    microcontroller, a dedicated reader thread on a host bridge),
//! 3. reads the frame once the collector reports it complete.
//!
//! # Concurrency
//!
//! The only state shared between the interrupt context and the caller is the
//! [`FrameCollector`]: a fixed 4-byte buffer plus a completion counter. The
//! collector is the sole writer of both; the driver only reads the buffer
//! after the counter reports completion (release/acquire pair on the counter)
//! or after it has disarmed the collector itself. No locks, no allocation in
//! the byte path.
//!
//! One read may be in flight per driver; `read()` takes `&mut self`, so the
//! borrow checker enforces the single-caller rule.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use embedded_hal::delay::DelayNs;
use log::{debug, trace, warn};

use crate::errors::{DriverError, Result};

// ============================================================================
// Constants
// ============================================================================

/// Bytes per sensor frame: temperature high, temperature low, humidity, check byte.
pub const FRAME_SIZE: usize = 4;

/// Bias the sensor adds to the temperature word (tenths of a degree).
pub const TEMPERATURE_OFFSET: i32 = 400;

/// Minimum time for the sensor to prepare a sample after select goes active.
const FIRST_POLL_DELAY: Duration = Duration::from_millis(50);

/// Polling period once a sample may already be on its way.
const POLL_INTERVAL: Duration = Duration::from_millis(30);

/// Polls after the first delay before giving up on a frame.
const POLL_RETRY_COUNT: u8 = 8;

// ============================================================================
// Data Types
// ============================================================================

/// A raw frame as clocked out by the sensor.
///
/// The last byte is chosen by the sensor so that the XOR of all four bytes is
/// zero; it carries no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Frame([u8; FRAME_SIZE]);

impl Frame {
    #[inline]
    pub const fn new(bytes: [u8; FRAME_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build a frame from its payload, appending the check byte the way the
    /// sensor does.
    pub fn with_checksum(payload: [u8; FRAME_SIZE - 1]) -> Self {
        let check = payload.iter().fold(0u8, |acc, &b| acc ^ b);
        Self([payload[0], payload[1], payload[2], check])
    }

    pub fn bytes(&self) -> &[u8; FRAME_SIZE] {
        &self.0
    }

    /// Running XOR over the whole frame, check byte included.
    pub fn checksum(&self) -> u8 {
        self.0.iter().fold(0u8, |acc, &b| acc ^ b)
    }

    pub fn is_valid(&self) -> bool {
        self.checksum() == 0
    }

    /// Verify the frame and decode its two payload fields.
    ///
    /// Temperature is the big-endian word in bytes 0..2 minus
    /// [`TEMPERATURE_OFFSET`]; humidity is byte 2 as-is.
    pub fn decode(&self) -> Result<Reading> {
        let checksum = self.checksum();
        if checksum != 0 {
            return Err(DriverError::Crc { checksum });
        }

        let raw = u16::from_be_bytes([self.0[0], self.0[1]]);
        Ok(Reading {
            temperature: i32::from(raw) - TEMPERATURE_OFFSET,
            humidity: self.0[2],
        })
    }
}

impl From<[u8; FRAME_SIZE]> for Frame {
    fn from(bytes: [u8; FRAME_SIZE]) -> Self {
        Self(bytes)
    }
}

/// One decoded sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
    /// Temperature in tenths of a degree Celsius (may be negative).
    pub temperature: i32,
    /// Relative humidity in whole percent.
    pub humidity: u8,
}

impl Reading {
    /// Temperature in degrees Celsius.
    pub fn celsius(&self) -> f32 {
        self.temperature as f32 / 10.0
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.temperature < 0 { "-" } else { "" };
        let tenths = self.temperature.unsigned_abs();
        write!(
            f,
            "Temperature = {}{}.{}, Humidity = {}%",
            sign,
            tenths / 10,
            tenths % 10,
            self.humidity
        )
    }
}

/// Wait schedule for one acquisition.
///
/// A read waits `first_poll`, then polls up to `poll_retries` more times,
/// `poll_interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub first_poll: Duration,
    pub poll_interval: Duration,
    pub poll_retries: u8,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            first_poll: FIRST_POLL_DELAY,
            poll_interval: POLL_INTERVAL,
            poll_retries: POLL_RETRY_COUNT,
        }
    }
}

impl Timing {
    /// Longest time a read sleeps before reporting a timeout.
    pub fn max_wait(&self) -> Duration {
        self.first_poll + self.poll_interval * u32::from(self.poll_retries)
    }
}

// ============================================================================
// Bus Abstraction
// ============================================================================

/// Control lines of the sensor bus, as seen by both contexts.
///
/// Methods take `&self`: the interrupt context releases select and disables
/// the trigger while the driver may hold the same bus. Implementations must
/// not block for long and must tolerate `release_select` being called twice.
pub trait BusControl: Send + Sync {
    /// Drive the select line active (start of transaction).
    fn assert_select(&self);
    /// Drive the select line idle. Idempotent.
    fn release_select(&self);
    /// Allow received bytes to reach the collector.
    fn enable_receive(&self);
    /// Stop delivering received bytes.
    fn disable_receive(&self);
    /// Clear the pending receive condition before the byte is handled.
    fn acknowledge(&self) {}
}

// ============================================================================
// Interrupt-Side Collector
// ============================================================================

/// Fixed-size frame buffer filled one byte per receive interrupt.
///
/// `received` is the handoff cell: written only by [`FrameCollector::on_byte`]
/// (and reset by [`FrameCollector::arm`] while the trigger is off), read by
/// the driver to poll for completion.
#[derive(Debug)]
pub struct FrameCollector {
    buf: [AtomicU8; FRAME_SIZE],
    received: AtomicU8,
    armed: AtomicBool,
}

impl Default for FrameCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCollector {
    pub fn new() -> Self {
        Self {
            buf: std::array::from_fn(|_| AtomicU8::new(0)),
            received: AtomicU8::new(0),
            armed: AtomicBool::new(false),
        }
    }

    /// Start a new transaction: counter back to zero, then accept bytes.
    pub fn arm(&self) {
        self.received.store(0, Ordering::Release);
        self.armed.store(true, Ordering::Release);
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Bytes stored in the current transaction.
    pub fn received(&self) -> usize {
        usize::from(self.received.load(Ordering::Acquire))
    }

    pub fn is_complete(&self) -> bool {
        self.received() == FRAME_SIZE
    }

    /// Copy of the buffer. Only meaningful once complete or disarmed.
    pub fn snapshot(&self) -> Frame {
        // Acquire on the counter orders the buffer loads after the last store.
        let _ = self.received.load(Ordering::Acquire);
        Frame(std::array::from_fn(|i| self.buf[i].load(Ordering::Relaxed)))
    }

    /// Receive-interrupt entry point: store one byte.
    ///
    /// The invocation that stores the last byte also releases select and
    /// disables the trigger, so no byte is ever stored past the frame.
    /// Never blocks, allocates or logs.
    pub fn on_byte<B: BusControl + ?Sized>(&self, byte: u8, bus: &B) {
        bus.acknowledge();
        if !self.armed.load(Ordering::Acquire) {
            return;
        }

        let mut count = usize::from(self.received.load(Ordering::Acquire));
        if count < FRAME_SIZE {
            self.buf[count].store(byte, Ordering::Relaxed);
            count += 1;
            self.received.store(count as u8, Ordering::Release);
        }

        if count == FRAME_SIZE {
            bus.release_select();
            self.armed.store(false, Ordering::Release);
            bus.disable_receive();
        }
    }
}

// ============================================================================
// Shared Link
// ============================================================================

struct Link<B> {
    bus: B,
    collector: FrameCollector,
}

/// Handle given to the receive interrupt (or reader thread).
pub struct ByteSink<B> {
    link: Arc<Link<B>>,
}

impl<B> Clone for ByteSink<B> {
    fn clone(&self) -> Self {
        Self {
            link: Arc::clone(&self.link),
        }
    }
}

impl<B: BusControl> ByteSink<B> {
    /// Deliver one received byte to the collector.
    #[inline]
    pub fn on_byte(&self, byte: u8) {
        self.link.collector.on_byte(byte, &self.link.bus);
    }

    pub fn bus(&self) -> &B {
        &self.link.bus
    }

    /// A handle that does not keep the driver's shared state alive.
    pub fn downgrade(&self) -> WeakByteSink<B> {
        WeakByteSink {
            link: Arc::downgrade(&self.link),
        }
    }
}

/// Non-owning [`ByteSink`]; upgrading fails once the driver is dropped.
pub struct WeakByteSink<B> {
    link: Weak<Link<B>>,
}

impl<B> Clone for WeakByteSink<B> {
    fn clone(&self) -> Self {
        Self {
            link: Weak::clone(&self.link),
        }
    }
}

impl<B> WeakByteSink<B> {
    pub fn upgrade(&self) -> Option<ByteSink<B>> {
        self.link.upgrade().map(|link| ByteSink { link })
    }
}

// ============================================================================
// Dypth01 Driver
// ============================================================================

/// DYPTH01 acquisition driver.
///
/// # Example (Rust)
/// ```ignore
/// let mut sensor = SerialConnector::default().open("/dev/ttyUSB0", Timing::default())?;
/// match sensor.read() {
///     Ok(reading) => println!("{reading}"),
///     Err(e) => println!("read error={}", e.code()),
/// }
/// ```
pub struct Dypth01<B, D> {
    link: Arc<Link<B>>,
    delay: D,
    timing: Timing,
}

impl<B: BusControl, D: DelayNs> Dypth01<B, D> {
    pub fn new(bus: B, delay: D) -> Self {
        Self::with_timing(bus, delay, Timing::default())
    }

    /// Create the driver and put the bus in its idle state: select released,
    /// trigger disabled.
    pub fn with_timing(bus: B, delay: D, timing: Timing) -> Self {
        bus.release_select();
        bus.disable_receive();
        Self {
            link: Arc::new(Link {
                bus,
                collector: FrameCollector::new(),
            }),
            delay,
            timing,
        }
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    pub fn set_timing(&mut self, timing: Timing) {
        self.timing = timing;
    }

    pub fn bus(&self) -> &B {
        &self.link.bus
    }

    pub fn collector(&self) -> &FrameCollector {
        &self.link.collector
    }

    pub fn delay_mut(&mut self) -> &mut D {
        &mut self.delay
    }

    /// Handle for the receive interrupt to push bytes through.
    pub fn byte_sink(&self) -> ByteSink<B> {
        ByteSink {
            link: Arc::clone(&self.link),
        }
    }

    /// Run one transaction and decode the result.
    ///
    /// Fails with [`DriverError::Timeout`] if the frame is not complete after
    /// the full [`Timing`] schedule, or [`DriverError::Crc`] if it arrives
    /// corrupted. Either way the bus is left idle for the next call.
    pub fn read(&mut self) -> Result<Reading> {
        let link = &*self.link;
        let timing = self.timing;

        link.collector.arm();
        link.bus.enable_receive();
        link.bus.assert_select();
        debug!(
            "select asserted, waiting {:?} for sample",
            timing.first_poll
        );

        sleep(&mut self.delay, timing.first_poll);
        let mut retries = 0u8;
        while !link.collector.is_complete() && retries < timing.poll_retries {
            sleep(&mut self.delay, timing.poll_interval);
            retries += 1;
            trace!(
                "poll {}/{}: {} of {} bytes",
                retries,
                timing.poll_retries,
                link.collector.received(),
                FRAME_SIZE
            );
        }

        if !link.collector.is_complete() {
            // The collector only lets go of the bus on a full frame.
            link.bus.release_select();
            link.collector.disarm();
            link.bus.disable_receive();
            let waited = timing.first_poll + timing.poll_interval * u32::from(retries);
            warn!(
                "sensor timeout: {} of {} bytes after {:?}",
                link.collector.received(),
                FRAME_SIZE,
                waited
            );
            return Err(DriverError::Timeout { waited });
        }

        let frame = link.collector.snapshot();
        debug!("frame complete after {} polls: {:02X?}", retries, frame.bytes());

        frame.decode().map_err(|e| {
            warn!("discarding frame {:02X?}: {}", frame.bytes(), e);
            e
        })
    }
}

/// Sleep the whole `duration` at microsecond resolution, in `u32` chunks.
fn sleep<D: DelayNs>(delay: &mut D, duration: Duration) {
    let mut remaining = duration.as_micros();
    while remaining > 0 {
        let chunk = u32::try_from(remaining).unwrap_or(u32::MAX);
        delay.delay_us(chunk);
        remaining -= u128::from(chunk);
    }
}

/// [`DelayNs`] backed by `std::thread::sleep`: the calling thread yields for
/// the whole interval.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(Duration::from_nanos(u64::from(ns)));
    }

    fn delay_us(&mut self, us: u32) {
        std::thread::sleep(Duration::from_micros(u64::from(us)));
    }

    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(u64::from(ms)));
    }
}
