//! DYPTH01 humidity/temperature sensor driver.
//!
//! The sensor answers each transaction with a 4-byte frame: a biased
//! temperature word, a humidity byte and an XOR check byte. This crate
//! provides:
//!
//! - [`Frame`] validation and decoding into a [`Reading`],
//! - the interrupt-side [`FrameCollector`] and the blocking, retry-bounded
//!   [`Dypth01::read`] built on top of it,
//! - a [`BusControl`] seam for the platform (select line and receive trigger),
//!   with a serial-bridge implementation in [`SerialConnector`]/[`SerialBus`].
//!
//! # Failure modes
//!
//! A read fails in exactly two recoverable ways: the frame did not complete
//! within the [`Timing`] schedule ([`DriverError::Timeout`]), or it arrived
//! corrupted ([`DriverError::Crc`]). Retrying a whole transaction is up to the
//! caller.

mod dypth01;
mod errors;
pub mod logging;
mod serial;

pub use dypth01::{
    BusControl, ByteSink, Dypth01, Frame, FrameCollector, Reading, StdDelay, Timing,
    WeakByteSink, FRAME_SIZE, TEMPERATURE_OFFSET,
};
pub use errors::*;
pub use serial::{SelectLine, SerialBus, SerialConnector};
