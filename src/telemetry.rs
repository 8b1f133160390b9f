//! Telemetry exporter: the read-only snapshot the core publishes for the
//! HTTP console. Modeled on the teacher's `StatsManager`, but the snapshot
//! itself is now the opaque, versioned struct called for in the design
//! notes rather than a grab-bag of independently-locked fields.

use serde::Serialize;
use std::sync::{Arc, RwLock};

use crate::clock::{ClockStatus, MetricSlot};
use crate::nmea::{SatelliteInfo, SentenceRecord};
use crate::timeval::Timeval;

#[derive(Debug, Clone, Serialize)]
pub struct ClockStatusSnapshot {
    pub synchronized: bool,
    pub precision_ms: i64,
    pub last_drift_ms: i64,
    pub last_avg_drift_ms: i64,
    pub reference_secs: i64,
    pub sampling_period_secs: i64,
    pub accumulator_ms: i64,
    pub count: u32,
}

impl From<ClockStatus> for ClockStatusSnapshot {
    fn from(s: ClockStatus) -> Self {
        ClockStatusSnapshot {
            synchronized: s.synchronized,
            precision_ms: s.precision_ms,
            last_drift_ms: s.last_drift_ms,
            last_avg_drift_ms: s.last_avg_drift_ms,
            reference_secs: s.reference.secs,
            sampling_period_secs: s.sampling_period_secs,
            accumulator_ms: s.accumulator_ms,
            count: s.count,
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct DriftSample {
    pub drift_abs_ms: u32,
    pub adjust_count: u32,
}

impl From<&MetricSlot> for DriftSample {
    fn from(m: &MetricSlot) -> Self {
        DriftSample {
            drift_abs_ms: m.drift_abs_ms,
            adjust_count: m.adjust_count,
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct TrafficBucket {
    pub received: u32,
    pub serviced: u32,
    pub broadcast_sent: u32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientRecord {
    pub address: String,
    pub local_receive_secs: i64,
    pub origin_transmit_seconds: u32,
    pub logged: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamSlotSnapshot {
    pub address: Option<String>,
    pub last_receive_secs: Option<i64>,
    pub stratum: u8,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SentenceSnapshot {
    pub text: String,
    pub timing_secs: i64,
    pub flags: u8,
}

impl From<&SentenceRecord> for SentenceSnapshot {
    fn from(r: &SentenceRecord) -> Self {
        SentenceSnapshot {
            text: r.text.clone(),
            timing_secs: r.timing.secs,
            flags: r.flags,
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct NmeaStatusSnapshot {
    pub fix: bool,
    pub date: String,
    pub time: String,
    pub latitude: String,
    pub longitude: String,
    pub hemisphere: String,
    pub talker_history: Vec<SentenceSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub stratum: u8,
    pub refid: String,
    pub clock: ClockStatusSnapshot,
    pub drift_ring: Vec<DriftSample>,
    pub traffic_ring: Vec<TrafficBucket>,
    pub client_ring: Vec<ClientRecord>,
    pub upstream_pool: Vec<UpstreamSlotSnapshot>,
    pub nmea: NmeaStatusSnapshot,
    pub satellites: Vec<SatelliteInfo>,
    pub current_unix_secs: i64,
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot {
            stratum: 16,
            refid: "INIT".to_string(),
            clock: ClockStatusSnapshot {
                synchronized: false,
                precision_ms: 10,
                last_drift_ms: 0,
                last_avg_drift_ms: 0,
                reference_secs: 0,
                sampling_period_secs: 1,
                accumulator_ms: 0,
                count: 0,
            },
            drift_ring: Vec::new(),
            traffic_ring: Vec::new(),
            client_ring: Vec::new(),
            upstream_pool: Vec::new(),
            nmea: NmeaStatusSnapshot::default(),
            satellites: Vec::new(),
            current_unix_secs: 0,
        }
    }
}

/// Owns the `Arc<RwLock<Snapshot>>` shared with the HTTP console. The core
/// is the only writer; the console only ever reads.
pub struct TelemetryExporter {
    inner: Arc<RwLock<Snapshot>>,
}

impl TelemetryExporter {
    pub fn new() -> Self {
        TelemetryExporter {
            inner: Arc::new(RwLock::new(Snapshot::default())),
        }
    }

    pub fn clone_arc(&self) -> Arc<RwLock<Snapshot>> {
        Arc::clone(&self.inner)
    }

    pub fn publish(&self, snapshot: Snapshot) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = snapshot;
        }
    }

    pub fn get(&self) -> Snapshot {
        self.inner.read().expect("telemetry lock poisoned").clone()
    }
}

impl Default for TelemetryExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Snapshot {
    pub fn now_stamped(mut self, now: Timeval) -> Self {
        self.current_unix_secs = now.secs;
        self
    }
}
