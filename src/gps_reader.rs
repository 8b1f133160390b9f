//! GPS serial reader thread: owns the serial port and the NMEA decoder,
//! forwards synchronize events to the core loop, and publishes a read-only
//! fix/position snapshot for telemetry.
//!
//! Grounded in the teacher's original reader: separate thread so the core
//! loop never blocks on serial I/O, automatic reconnect with exponential
//! backoff. The PPS-via-CTS branch from that original is not carried here —
//! the clock disciplinarian drives purely off NMEA-timestamped fixes.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::nmea::{NmeaConfig, NmeaDecoder, SatelliteInfo, SentenceRecord, SynchronizeEvent};
use crate::timeval::Timeval;

const RECONNECT_INITIAL: Duration = Duration::from_secs(5);
const RECONNECT_MAX: Duration = Duration::from_secs(60);
const READ_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Default)]
pub struct GpsSnapshot {
    pub connected: bool,
    pub active: bool,
    pub date: String,
    pub time: String,
    pub latitude: String,
    pub longitude: String,
    pub hemisphere: (char, char),
    pub sentence_history: Vec<SentenceRecord>,
    pub satellites: Vec<SatelliteInfo>,
}

pub struct GpsReaderConfig {
    pub serial_port: String,
    pub baud_rate: u32,
    pub decoder: NmeaConfig,
}

pub struct GpsReader {
    config: GpsReaderConfig,
    events: Sender<SynchronizeEvent>,
    snapshot: Arc<RwLock<GpsSnapshot>>,
    running: Arc<AtomicBool>,
}

impl GpsReader {
    pub fn new(config: GpsReaderConfig, events: Sender<SynchronizeEvent>) -> Self {
        GpsReader {
            config,
            events,
            snapshot: Arc::new(RwLock::new(GpsSnapshot::default())),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn snapshot_arc(&self) -> Arc<RwLock<GpsSnapshot>> {
        Arc::clone(&self.snapshot)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Starts the reader on its own thread, reconnecting with exponential
    /// backoff (5s up to 60s) whenever the serial port errors out.
    pub fn start(self) -> std::thread::JoinHandle<()> {
        tracing::info!(
            port = %self.config.serial_port,
            baud = self.config.baud_rate,
            "starting GPS reader thread"
        );
        std::thread::spawn(move || {
            let mut delay = RECONNECT_INITIAL;
            while self.running.load(Ordering::Relaxed) {
                match self.run_once() {
                    Ok(()) => {
                        tracing::info!("GPS reader stopped normally");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "GPS reader error");
                        if let Ok(mut snap) = self.snapshot.write() {
                            snap.connected = false;
                        }
                        tracing::info!(delay = ?delay, "reconnecting");
                        std::thread::sleep(delay);
                        delay = (delay * 2).min(RECONNECT_MAX);
                    }
                }
            }
            tracing::info!("GPS reader thread terminated");
        })
    }

    fn run_once(&self) -> anyhow::Result<()> {
        let mut port = serialport::new(&self.config.serial_port, self.config.baud_rate)
            .timeout(READ_TIMEOUT)
            .open()?;
        tracing::info!("GPS serial port opened");

        let mut decoder = NmeaDecoder::new(NmeaConfig {
            latency_ms: self.config.decoder.latency_ms,
            burst_mode: self.config.decoder.burst_mode,
            privacy: self.config.decoder.privacy,
            min_satellites: self.config.decoder.min_satellites,
        });
        decoder.on_device_opened(Timeval::now());
        if let Ok(mut snap) = self.snapshot.write() {
            snap.connected = true;
        }

        let mut read_buf = [0u8; 512];
        while self.running.load(Ordering::Relaxed) {
            match port.read(&mut read_buf) {
                Ok(0) => {}
                Ok(n) => {
                    let now = Timeval::now();
                    for event in decoder.feed(&read_buf[..n], now) {
                        if self.events.send(event).is_err() {
                            return Ok(());
                        }
                    }
                    self.publish_snapshot(&decoder, now);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    let now = Timeval::now();
                    if decoder.is_stale(now) {
                        anyhow::bail!("GPS device silent past the staleness window");
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn publish_snapshot(&self, decoder: &NmeaDecoder, now: Timeval) {
        let Ok(mut snap) = self.snapshot.write() else {
            return;
        };
        snap.connected = true;
        snap.active = decoder.is_active(now);
        snap.date = decoder.gps_date().to_string();
        snap.time = decoder.gps_time().to_string();
        snap.latitude = decoder.latitude().to_string();
        snap.longitude = decoder.longitude().to_string();
        snap.hemisphere = decoder.hemisphere();
        snap.sentence_history = decoder.sentence_history().cloned().collect();
        snap.satellites = decoder.satellites().to_vec();
    }
}

impl Drop for GpsReader {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn new_reader_snapshot_starts_disconnected_and_inactive() {
        let (tx, _rx) = mpsc::channel();
        let reader = GpsReader::new(
            GpsReaderConfig {
                serial_port: "/dev/null".to_string(),
                baud_rate: 9600,
                decoder: NmeaConfig {
                    latency_ms: 70,
                    burst_mode: false,
                    privacy: false,
                    min_satellites: 3,
                },
            },
            tx,
        );
        let snap = reader.snapshot_arc();
        let guard = snap.read().unwrap();
        assert!(!guard.connected);
        assert!(!guard.active);
    }
}
