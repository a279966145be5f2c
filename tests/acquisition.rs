//! End-to-end acquisition with a peer thread playing the sensor and
//! delivering bytes the way a receive interrupt would.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use dypth01::{BusControl, ByteSink, DriverError, Dypth01, Frame, StdDelay, Timing};

#[derive(Default)]
struct LineBus {
    selected: AtomicBool,
    receiving: AtomicBool,
    releases: AtomicUsize,
}

impl BusControl for LineBus {
    fn assert_select(&self) {
        self.selected.store(true, Ordering::SeqCst);
    }

    fn release_select(&self) {
        self.selected.store(false, Ordering::SeqCst);
        self.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn enable_receive(&self) {
        self.receiving.store(true, Ordering::SeqCst);
    }

    fn disable_receive(&self) {
        self.receiving.store(false, Ordering::SeqCst);
    }
}

/// Waits for select, then clocks out `bytes` one at a time while the
/// trigger is enabled.
fn spawn_sensor(sink: ByteSink<LineBus>, bytes: Vec<u8>) -> thread::JoinHandle<usize> {
    thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !sink.bus().selected.load(Ordering::SeqCst) {
            if Instant::now() > deadline {
                return 0;
            }
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(5));
        let mut delivered = 0;
        for byte in bytes {
            if sink.bus().receiving.load(Ordering::SeqCst) {
                sink.on_byte(byte);
                delivered += 1;
            }
        }
        delivered
    })
}

fn generous_timing() -> Timing {
    Timing {
        first_poll: Duration::from_millis(20),
        poll_interval: Duration::from_millis(20),
        poll_retries: 50,
    }
}

#[test]
fn reads_frame_from_interrupt_thread() {
    let mut sensor = Dypth01::with_timing(LineBus::default(), StdDelay, generous_timing());
    let frame = Frame::with_checksum([0x0A, 0x3C, 0x28]);
    let peer = spawn_sensor(sensor.byte_sink(), frame.bytes().to_vec());

    let reading = sensor.read().expect("frame should arrive");
    assert_eq!(reading.temperature, 2220);
    assert_eq!(reading.humidity, 40);
    assert_eq!(peer.join().unwrap(), 4);

    assert!(!sensor.bus().selected.load(Ordering::SeqCst));
    assert!(!sensor.bus().receiving.load(Ordering::SeqCst));
}

#[test]
fn extra_bytes_after_frame_are_not_stored() {
    let mut sensor = Dypth01::with_timing(LineBus::default(), StdDelay, generous_timing());
    let mut bytes = Frame::with_checksum([0x01, 0x90, 0x00]).bytes().to_vec();
    bytes.extend_from_slice(&[0xFF, 0xFF, 0xFF]);
    let peer = spawn_sensor(sensor.byte_sink(), bytes);

    let reading = sensor.read().expect("frame should arrive");
    assert_eq!(reading.temperature, 0);
    assert_eq!(reading.humidity, 0);
    // The trigger went off with the fourth byte.
    assert_eq!(peer.join().unwrap(), 4);
    assert_eq!(sensor.collector().received(), 4);
}

#[test]
fn silent_sensor_times_out_with_bus_idle() {
    let timing = Timing {
        first_poll: Duration::from_millis(5),
        poll_interval: Duration::from_millis(2),
        poll_retries: 3,
    };
    let mut sensor = Dypth01::with_timing(LineBus::default(), StdDelay, timing);
    let releases_before = sensor.bus().releases.load(Ordering::SeqCst);

    let started = Instant::now();
    let err = sensor.read().unwrap_err();
    assert!(started.elapsed() >= timing.max_wait());
    assert!(matches!(err, DriverError::Timeout { waited } if waited == timing.max_wait()));

    assert!(!sensor.bus().selected.load(Ordering::SeqCst));
    assert!(!sensor.bus().receiving.load(Ordering::SeqCst));
    assert_eq!(sensor.bus().releases.load(Ordering::SeqCst), releases_before + 1);
}

#[test]
fn corrupted_frame_then_recovery() {
    let mut sensor = Dypth01::with_timing(LineBus::default(), StdDelay, generous_timing());

    let peer = spawn_sensor(sensor.byte_sink(), vec![0x0A, 0x3C, 0x28, 0x00]);
    let err = sensor.read().unwrap_err();
    assert!(matches!(err, DriverError::Crc { .. }));
    assert_eq!(err.code(), 2);
    peer.join().unwrap();
    assert!(!sensor.bus().selected.load(Ordering::SeqCst));

    let frame = Frame::with_checksum([0x02, 0x58, 0x3C]);
    let peer = spawn_sensor(sensor.byte_sink(), frame.bytes().to_vec());
    let reading = sensor.read().expect("second transaction should succeed");
    assert_eq!(reading.temperature, 200);
    assert_eq!(reading.humidity, 60);
    peer.join().unwrap();
}

#[test]
fn weak_sink_dies_with_driver() {
    let sensor = Dypth01::new(LineBus::default(), StdDelay);
    let weak = sensor.byte_sink().downgrade();
    assert!(weak.upgrade().is_some());
    drop(sensor);
    assert!(weak.upgrade().is_none());
}
