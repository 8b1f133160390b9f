//! NMEA-0183 decoder: frames sentences out of a raw byte stream from the
//! GPS serial device and back-computes a per-sentence arrival timestamp
//! from a single read-completion wake-up time.
//!
//! Grounded in `hc_nmea.c` from the houseclock original — the speed
//! estimator, burst detection, and sentence validity rules all follow that
//! file's arithmetic line for line.

use std::collections::VecDeque;

use serde::Serialize;

use crate::timeval::Timeval;

/// One satellite entry from a GPGSV/GLGSV/GAGSV/GBGSV sentence.
#[derive(Debug, Clone, Serialize)]
pub struct SatelliteInfo {
    pub prn: u8,
    pub elevation: u8,
    pub azimuth: u16,
    pub snr: u8,
    pub constellation: String,
}

const BUFFER_CAPACITY: usize = 2048;
pub const SENTENCE_RING_DEPTH: usize = 32;
pub const TEXT_RING_DEPTH: usize = 16;
const GPS_EXPIRES_SECS: i64 = 5;
const DEFAULT_SPEED: i64 = 115_000;
const SILENCE_GAP_MS: i64 = 300;
const BURST_GAP_MS: i64 = 500;
const SPEED_ACCUMULATOR_LIMIT: i64 = 1_000_000;

pub const NEW_FIX: u8 = 1;
pub const NEW_BURST: u8 = 2;

#[derive(Debug, Clone)]
pub struct SentenceRecord {
    pub text: String,
    pub timing: Timeval,
    pub flags: u8,
}

/// One `(gps_time, local_time, latency_ms)` triple ready for the clock
/// disciplinarian.
#[derive(Debug, Clone, Copy)]
pub struct SynchronizeEvent {
    pub gps_time: Timeval,
    pub local_time: Timeval,
    pub latency_ms: i32,
}

pub struct NmeaConfig {
    pub latency_ms: i32,
    pub burst_mode: bool,
    pub privacy: bool,
    pub min_satellites: u32,
}

pub struct NmeaDecoder {
    config: NmeaConfig,

    buffer: Vec<u8>,
    speed_total_bytes: i64,
    speed_total_duration_ms: i64,
    previous_wake: Option<Timeval>,
    burst_timing: Timeval,
    flags: u8,

    gps_date: String,
    gps_time: String,
    latitude: String,
    longitude: String,
    hemisphere: (char, char),
    fix: bool,
    fix_time: Option<Timeval>,
    last_activity: Option<Timeval>,
    opened_at: Option<Timeval>,

    sentence_ring: [Option<SentenceRecord>; SENTENCE_RING_DEPTH],
    sentence_write: usize,
    text_lines: VecDeque<String>,
    satellites: Vec<SatelliteInfo>,
}

impl NmeaDecoder {
    pub fn new(config: NmeaConfig) -> Self {
        NmeaDecoder {
            config,
            buffer: Vec::with_capacity(BUFFER_CAPACITY),
            speed_total_bytes: 0,
            speed_total_duration_ms: 0,
            previous_wake: None,
            burst_timing: Timeval::default(),
            flags: 0,
            gps_date: String::new(),
            gps_time: String::new(),
            latitude: String::new(),
            longitude: String::new(),
            hemisphere: ('\0', '\0'),
            fix: false,
            fix_time: None,
            last_activity: None,
            opened_at: None,
            sentence_ring: std::array::from_fn(|_| None),
            sentence_write: 0,
            text_lines: VecDeque::with_capacity(TEXT_RING_DEPTH),
            satellites: Vec::new(),
        }
    }

    pub fn satellites(&self) -> &[SatelliteInfo] {
        &self.satellites
    }

    pub fn on_device_opened(&mut self, now: Timeval) {
        self.buffer.clear();
        self.fix = false;
        self.fix_time = None;
        self.gps_date.clear();
        self.gps_time.clear();
        self.opened_at = Some(now);
        self.last_activity = Some(now);
    }

    pub fn fix(&self) -> bool {
        self.fix
    }

    pub fn gps_date(&self) -> &str {
        &self.gps_date
    }

    pub fn gps_time(&self) -> &str {
        &self.gps_time
    }

    pub fn latitude(&self) -> &str {
        &self.latitude
    }

    pub fn longitude(&self) -> &str {
        &self.longitude
    }

    pub fn hemisphere(&self) -> (char, char) {
        self.hemisphere
    }

    pub fn sentence_history(&self) -> impl Iterator<Item = &SentenceRecord> {
        self.sentence_ring.iter().filter_map(|s| s.as_ref())
    }

    pub fn text_lines(&self) -> impl Iterator<Item = &str> {
        self.text_lines.iter().map(|s| s.as_str())
    }

    /// True if a fix was recorded within the last `GPS_EXPIRES_SECS`.
    pub fn is_active(&self, now: Timeval) -> bool {
        self.fix
            && self
                .fix_time
                .is_some_and(|t| now.diff_ms(t) < GPS_EXPIRES_SECS * 1000)
    }

    /// Per spec.md §4.2 staleness: closes the device (caller's job, signaled
    /// by returning `true`) if no sentence activity was seen in 5 seconds.
    pub fn is_stale(&self, now: Timeval) -> bool {
        match (self.opened_at, self.last_activity) {
            (Some(opened), Some(activity)) => {
                now.diff_ms(opened) > GPS_EXPIRES_SECS * 1000
                    && now.diff_ms(activity) > GPS_EXPIRES_SECS * 1000
            }
            _ => false,
        }
    }

    /// Consumes one read's worth of bytes completing at wall time `received`,
    /// returning zero or more synchronize events for the clock disciplinarian.
    pub fn feed(&mut self, data: &[u8], received: Timeval) -> Vec<SynchronizeEvent> {
        if self.buffer.len() >= BUFFER_CAPACITY || data.len() > BUFFER_CAPACITY - self.buffer.len() {
            self.buffer.clear();
        }
        let take = data.len().min(BUFFER_CAPACITY);
        self.buffer.extend_from_slice(&data[..take]);

        let interval_ms = self
            .previous_wake
            .map(|p| received.diff_ms(p))
            .unwrap_or(i64::MAX);

        if interval_ms < SILENCE_GAP_MS {
            if self.speed_total_bytes > SPEED_ACCUMULATOR_LIMIT {
                self.speed_total_bytes /= 2;
                self.speed_total_duration_ms /= 2;
            }
            self.speed_total_bytes += take as i64;
            self.speed_total_duration_ms += interval_ms;
        }

        let speed = if self.speed_total_duration_ms > 0 {
            1_000_000 * self.speed_total_bytes / self.speed_total_duration_ms
        } else {
            DEFAULT_SPEED
        };

        if self.previous_wake.is_some() && interval_ms > BURST_GAP_MS {
            self.burst_timing = Self::timing_at(received, speed, self.buffer.len() as i64);
            self.gps_date.clear();
            self.gps_time.clear();
            self.flags = NEW_BURST;
        }
        self.previous_wake = Some(received);

        let total_len = self.buffer.len();
        let (sentences, leftover_start) = split_lines(&self.buffer);

        let mut events = Vec::new();
        for (start, end) in sentences {
            let k = (total_len - start) as i64;
            let timing = Self::timing_at(received, speed, k);

            if self.buffer[start] != b'$' {
                continue;
            }
            let text = String::from_utf8_lossy(&self.buffer[start + 1..end]).into_owned();

            let newfix = self.decode_sentence(&text);
            self.flags |= if newfix { NEW_FIX } else { 0 };

            self.record_sentence(text, timing, self.flags);
            self.last_activity = Some(self.burst_timing);

            if self.flags == NEW_FIX | NEW_BURST {
                if let Some(gps_time) = self.gps_timestamp() {
                    let local_time = if self.config.burst_mode {
                        self.burst_timing
                    } else {
                        timing
                    };
                    events.push(SynchronizeEvent {
                        gps_time,
                        local_time,
                        latency_ms: self.config.latency_ms,
                    });
                    self.flags = 0;
                }
            }
        }

        if leftover_start > 0 {
            self.buffer.drain(0..leftover_start);
        }
        events
    }

    fn timing_at(received: Timeval, speed: i64, k: i64) -> Timeval {
        let usdelta = (k * 1000) / speed.max(1);
        if usdelta > received.usec as i64 {
            Timeval::new(received.secs - 1, (1_000_000 + received.usec as i64 - usdelta) as i32)
        } else {
            Timeval::new(received.secs, (received.usec as i64 - usdelta) as i32)
        }
    }

    fn record_sentence(&mut self, text: String, timing: Timeval, flags: u8) {
        self.sentence_ring[self.sentence_write] = Some(SentenceRecord { text, timing, flags });
        self.sentence_write = (self.sentence_write + 1) % SENTENCE_RING_DEPTH;
    }

    fn gps_timestamp(&self) -> Option<Timeval> {
        if self.gps_date.len() < 6 || self.gps_time.len() < 6 {
            return None;
        }
        let day: u32 = self.gps_date[0..2].parse().ok()?;
        let month: u32 = self.gps_date[2..4].parse().ok()?;
        let year: i32 = 2000 + self.gps_date[4..6].parse::<i32>().ok()?;
        let hour: u32 = self.gps_time[0..2].parse().ok()?;
        let minute: u32 = self.gps_time[2..4].parse().ok()?;
        let second: u32 = self.gps_time[4..6].parse().ok()?;

        let date = chrono::NaiveDate::from_ymd_opt(year, month, day)?;
        let time = chrono::NaiveTime::from_hms_opt(hour, minute, second)?;
        let dt = chrono::NaiveDateTime::new(date, time);
        Some(Timeval::new(dt.and_utc().timestamp(), 0))
    }

    /// Dispatches a talker-filtered sentence to its decoder. Returns whether
    /// this sentence produced a fresh fix (changed time or position).
    fn decode_sentence(&mut self, sentence: &str) -> bool {
        let fields: Vec<&str> = sentence.split(',').collect();
        if fields.is_empty() || !is_valid_talker(fields[0]) {
            return false;
        }
        let message = &fields[0][2..];
        tracing::debug!(sentence = %message, "nmea sentence decoded");

        match message {
            "RMC" if fields.len() > 12 => self.decode_rmc(&fields),
            "GGA" if fields.len() > 7 => self.decode_gga(&fields),
            "GLL" if fields.len() > 7 => self.decode_gll(&fields),
            "TXT" if fields.len() > 4 => {
                if self.text_lines.len() < TEXT_RING_DEPTH {
                    self.text_lines.push_back(fields[4].to_string());
                }
                false
            }
            "GSV" if fields.len() > 4 => {
                self.decode_gsv(&fields[0][0..2], &fields);
                false
            }
            _ => false,
        }
    }

    fn decode_gsv(&mut self, talker: &str, f: &[&str]) {
        let constellation = match talker {
            "GP" => "GPS",
            "GL" => "GLONASS",
            "GA" => "Galileo",
            "GB" => "BeiDou",
            _ => "GNSS",
        };
        for slot in 0..4 {
            let base = 4 + slot * 4;
            if base + 3 >= f.len() {
                break;
            }
            let Ok(prn) = f[base].parse::<u8>() else { continue };
            if prn == 0 {
                continue;
            }
            let elevation: u8 = f[base + 1].parse().unwrap_or(0);
            let azimuth: u16 = f[base + 2].parse().unwrap_or(0);
            let snr: u8 = f[base + 3].parse().unwrap_or(0);

            if let Some(existing) = self.satellites.iter_mut().find(|s| s.prn == prn) {
                existing.elevation = elevation;
                existing.azimuth = azimuth;
                existing.snr = snr;
                existing.constellation = constellation.to_string();
            } else {
                self.satellites.push(SatelliteInfo {
                    prn,
                    elevation,
                    azimuth,
                    snr,
                    constellation: constellation.to_string(),
                });
            }
        }
    }

    fn decode_rmc(&mut self, f: &[&str]) -> bool {
        // GPRMC,time,status,lat,N/S,lon,E/W,speed,course,date,variation,E/W,integrity
        if is_valid_fix(f[2], f[12]) {
            let new_time = mark_new(f[1], &mut self.gps_time);
            let new_date = mark_new(f[9], &mut self.gps_date);
            let newfix = new_time || new_date;
            if newfix {
                self.store_position(f[3], f[4], f[5], f[6]);
            }
            newfix
        } else {
            self.fix = false;
            false
        }
    }

    fn decode_gga(&mut self, f: &[&str]) -> bool {
        // GPGGA,time,lat,N/S,lon,E/W,fix-quality,sat-count,...
        let fix_quality = f[6].as_bytes().first().copied().unwrap_or(b'0');
        let sats: u32 = f[7].parse().unwrap_or(0);
        if (b'1'..=b'5').contains(&fix_quality) && sats >= self.config.min_satellites {
            let newfix = mark_new(f[1], &mut self.gps_time);
            if newfix {
                self.store_position(f[2], f[3], f[4], f[5]);
            }
            newfix
        } else {
            self.fix = false;
            false
        }
    }

    fn decode_gll(&mut self, f: &[&str]) -> bool {
        // GPGLL,lat,N/S,lon,E/W,time,status,integrity
        if is_valid_fix(f[6], f[7]) {
            let newfix = mark_new(f[5], &mut self.gps_time);
            if newfix {
                self.store_position(f[1], f[2], f[3], f[4]);
            }
            newfix
        } else {
            self.fix = false;
            false
        }
    }

    fn store_position(&mut self, lat: &str, ns: &str, lon: &str, ew: &str) {
        if !self.config.privacy {
            self.latitude = lat.to_string();
            self.longitude = lon.to_string();
            self.hemisphere = (
                ns.chars().next().unwrap_or('\0'),
                ew.chars().next().unwrap_or('\0'),
            );
        }
        self.fix = true;
        self.fix_time = self.last_activity.or(self.previous_wake);
    }
}

fn is_valid_talker(field: &str) -> bool {
    let bytes = field.as_bytes();
    bytes.len() >= 2 && bytes[0] == b'G' && matches!(bytes[1], b'P' | b'A' | b'L')
}

fn is_valid_fix(status: &str, integrity: &str) -> bool {
    status.starts_with('A') && (integrity.starts_with('A') || integrity.starts_with('D'))
}

fn mark_new(received: &str, memorized: &mut String) -> bool {
    if memorized != received {
        memorized.clear();
        memorized.push_str(received);
        true
    } else {
        false
    }
}

/// Splits a buffer on `\r`/`\n`, returning `(start, end)` bounds for each
/// complete sentence (end trimmed at the first `*` CRC marker) plus the
/// offset of the first byte of any trailing partial line.
fn split_lines(buf: &[u8]) -> (Vec<(usize, usize)>, usize) {
    let n = buf.len();
    let mut i = 0;
    while i < n && (buf[i] == b'\n' || buf[i] == b'\r') {
        i += 1;
    }
    let mut begin = i;
    let mut sentences = Vec::new();
    let mut crc_at: Option<usize> = None;

    while i < n {
        match buf[i] {
            b'*' => {
                if crc_at.is_none() {
                    crc_at = Some(i);
                }
                i += 1;
            }
            b'\n' | b'\r' => {
                sentences.push((begin, crc_at.unwrap_or(i)));
                i += 1;
                while i < n && (buf[i] == b'\n' || buf[i] == b'\r') {
                    i += 1;
                }
                begin = i;
                crc_at = None;
            }
            _ => i += 1,
        }
    }
    (sentences, begin)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NmeaConfig {
        NmeaConfig {
            latency_ms: 70,
            burst_mode: false,
            privacy: false,
            min_satellites: 3,
        }
    }

    #[test]
    fn buffer_never_exceeds_capacity_and_sentences_are_dollar_framed() {
        let mut dec = NmeaDecoder::new(config());
        let chunk = vec![b'$'; 100];
        let mut t = Timeval::new(1_000, 0);
        for _ in 0..50 {
            t = t.add_ms(10);
            dec.feed(&chunk, t);
            assert!(dec.buffer.len() <= BUFFER_CAPACITY);
        }
        for rec in dec.sentence_history() {
            assert!(rec.text.is_empty() || !rec.text.starts_with('$'));
        }
    }

    #[test]
    fn speed_halving_preserves_ratio_when_even() {
        let mut dec = NmeaDecoder::new(config());
        dec.speed_total_bytes = 2_000_000;
        dec.speed_total_duration_ms = 4_000;
        let ratio_before = dec.speed_total_bytes as f64 / dec.speed_total_duration_ms as f64;
        if dec.speed_total_bytes > SPEED_ACCUMULATOR_LIMIT {
            dec.speed_total_bytes /= 2;
            dec.speed_total_duration_ms /= 2;
        }
        let ratio_after = dec.speed_total_bytes as f64 / dec.speed_total_duration_ms as f64;
        assert!((ratio_before - ratio_after).abs() < 1e-9);
        assert!(dec.speed_total_bytes < SPEED_ACCUMULATOR_LIMIT);
    }

    #[test]
    fn cold_start_burst_yields_synchronize_event() {
        let mut dec = NmeaDecoder::new(config());
        let t0 = Timeval::new(1_000, 0);
        dec.feed(b"", t0);

        let t1 = t0.add_ms(600);
        let sentence = b"$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W,A*6A\r\n";
        let events = dec.feed(sentence, t1);

        assert_eq!(events.len(), 1);
        let (secs, _) = (events[0].gps_time.secs, events[0].gps_time.usec);
        let expected = chrono::NaiveDate::from_ymd_opt(1994, 3, 23)
            .unwrap()
            .and_hms_opt(12, 35, 19)
            .unwrap()
            .and_utc()
            .timestamp();
        assert_eq!(secs, expected);
        assert_eq!(events[0].latency_ms, 70);
    }

    #[test]
    fn invalid_rmc_status_clears_fix_without_event() {
        let mut dec = NmeaDecoder::new(config());
        let t0 = Timeval::new(2_000, 0);
        let sentence = b"$GPRMC,123519,V,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W,N*6A\r\n";
        let events = dec.feed(sentence, t0);
        assert!(events.is_empty());
        assert!(!dec.fix());
    }

    #[test]
    fn gga_requires_minimum_satellite_count() {
        let mut dec = NmeaDecoder::new(config());
        let t0 = Timeval::new(3_000, 0);
        let sentence = b"$GPGGA,123519,4807.038,N,01131.000,E,1,02,0.9,545.4,M,46.9,M,,*47\r\n";
        dec.feed(sentence, t0);
        assert!(!dec.fix());
    }

    #[test]
    fn txt_sentence_is_appended_to_ring_capped_at_depth() {
        let mut dec = NmeaDecoder::new(config());
        let mut t = Timeval::new(4_000, 0);
        for i in 0..(TEXT_RING_DEPTH + 5) {
            t = t.add_ms(1);
            let line = format!("$GPTXT,01,01,02,hello{i}*00\r\n");
            dec.feed(line.as_bytes(), t);
        }
        assert_eq!(dec.text_lines.len(), TEXT_RING_DEPTH);
    }

    #[test]
    fn gsv_sentence_populates_and_updates_satellite_table() {
        let mut dec = NmeaDecoder::new(config());
        let t0 = Timeval::new(5_000, 0);
        let sentence = b"$GPGSV,3,1,11,10,63,137,17,07,61,098,15,05,59,290,20,08,54,157,30*70\r\n";
        dec.feed(sentence, t0);
        assert_eq!(dec.satellites().len(), 4);
        assert!(dec.satellites().iter().any(|s| s.prn == 10 && s.snr == 17));

        let updated = b"$GPGSV,3,1,11,10,63,137,25,07,61,098,15,05,59,290,20,08,54,157,30*71\r\n";
        dec.feed(updated, t0.add_ms(1000));
        assert_eq!(dec.satellites().len(), 4);
        assert_eq!(dec.satellites().iter().find(|s| s.prn == 10).unwrap().snr, 25);
    }
}
