//! RFC 5905 wire frame: the 48-byte big-endian SNTP header this server
//! reads requests from and writes replies/broadcasts into.

use crate::timeval::Timeval;
use thiserror::Error;

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch (1970-01-01).
pub const NTP_UNIX_EPOCH_OFFSET: u64 = 2_208_988_800;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NtpError {
    #[error("invalid packet size: expected at least {expected}, got {actual}")]
    InvalidSize { expected: usize, actual: usize },
}

/// Leap indicator, the top two bits of the first wire byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeapIndicator {
    NoWarning = 0,
    LastMinute61Seconds = 1,
    LastMinute59Seconds = 2,
    AlarmCondition = 3,
}

impl From<u8> for LeapIndicator {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0 => LeapIndicator::NoWarning,
            1 => LeapIndicator::LastMinute61Seconds,
            2 => LeapIndicator::LastMinute59Seconds,
            _ => LeapIndicator::AlarmCondition,
        }
    }
}

/// Association mode, the low three bits of the first wire byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NtpMode {
    Reserved = 0,
    SymmetricActive = 1,
    SymmetricPassive = 2,
    Client = 3,
    Server = 4,
    Broadcast = 5,
    ControlMessage = 6,
    ReservedPrivate = 7,
}

impl NtpMode {
    pub fn from_u8(value: u8) -> Self {
        match value & 0x07 {
            0 => NtpMode::Reserved,
            1 => NtpMode::SymmetricActive,
            2 => NtpMode::SymmetricPassive,
            3 => NtpMode::Client,
            4 => NtpMode::Server,
            5 => NtpMode::Broadcast,
            6 => NtpMode::ControlMessage,
            _ => NtpMode::ReservedPrivate,
        }
    }
}

/// A 64-bit NTP timestamp: 32-bit seconds since 1900, 32-bit fraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NtpTimestamp {
    pub seconds: u32,
    pub fraction: u32,
}

impl NtpTimestamp {
    pub const ZERO: NtpTimestamp = NtpTimestamp { seconds: 0, fraction: 0 };

    /// Unix seconds convert to NTP seconds by adding the epoch offset;
    /// microseconds convert to the NTP fraction by `usec * 2^32 / 10^6`.
    pub fn from_unix(secs: i64, usec: i32) -> Self {
        let ntp_secs = secs + NTP_UNIX_EPOCH_OFFSET as i64;
        let fraction = ((usec as u64) << 32) / 1_000_000;
        NtpTimestamp {
            seconds: ntp_secs as u32,
            fraction: fraction as u32,
        }
    }

    pub fn from_timeval(t: Timeval) -> Self {
        Self::from_unix(t.secs, t.usec)
    }

    /// Inverse of `from_unix`.
    pub fn to_unix(self) -> (i64, i32) {
        let secs = self.seconds as i64 - NTP_UNIX_EPOCH_OFFSET as i64;
        let usec = ((self.fraction as u64) * 1_000_000) >> 32;
        (secs, usec as i32)
    }

    pub fn to_timeval(self) -> Timeval {
        let (secs, usec) = self.to_unix();
        Timeval::new(secs, usec)
    }

    fn from_bytes(buf: &[u8]) -> Self {
        NtpTimestamp {
            seconds: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            fraction: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
        }
    }

    fn write_to(self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.seconds.to_be_bytes());
        buf[4..8].copy_from_slice(&self.fraction.to_be_bytes());
    }
}

/// Encodes a non-negative seconds value as 16.16 fixed point.
pub fn seconds_to_fixed(seconds: f64) -> u32 {
    (seconds.max(0.0) * 65536.0).round() as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtpPacket {
    pub leap_indicator: LeapIndicator,
    pub version: u8,
    pub mode: NtpMode,
    pub stratum: u8,
    pub poll: i8,
    pub precision: i8,
    pub root_delay: u32,
    pub root_dispersion: u32,
    pub reference_identifier: [u8; 4],
    pub reference_timestamp: NtpTimestamp,
    pub originate_timestamp: NtpTimestamp,
    pub receive_timestamp: NtpTimestamp,
    pub transmit_timestamp: NtpTimestamp,
}

impl NtpPacket {
    pub const SIZE: usize = 48;

    /// A reply/broadcast template with the fields that never change per
    /// message already filled in; callers set the four timestamps, stratum,
    /// and refid before sending.
    pub fn template(version: u8, mode: NtpMode, precision: i8) -> Self {
        NtpPacket {
            leap_indicator: LeapIndicator::NoWarning,
            version,
            mode,
            stratum: 0,
            poll: 10,
            precision,
            root_delay: 0,
            root_dispersion: 0,
            reference_identifier: [0; 4],
            reference_timestamp: NtpTimestamp::ZERO,
            originate_timestamp: NtpTimestamp::ZERO,
            receive_timestamp: NtpTimestamp::ZERO,
            transmit_timestamp: NtpTimestamp::ZERO,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NtpError> {
        if bytes.len() < Self::SIZE {
            return Err(NtpError::InvalidSize {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }

        let li_vn_mode = bytes[0];
        Ok(NtpPacket {
            leap_indicator: LeapIndicator::from(li_vn_mode >> 6),
            version: (li_vn_mode >> 3) & 0x07,
            mode: NtpMode::from_u8(li_vn_mode),
            stratum: bytes[1],
            poll: bytes[2] as i8,
            precision: bytes[3] as i8,
            root_delay: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
            root_dispersion: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
            reference_identifier: bytes[12..16].try_into().unwrap(),
            reference_timestamp: NtpTimestamp::from_bytes(&bytes[16..24]),
            originate_timestamp: NtpTimestamp::from_bytes(&bytes[24..32]),
            receive_timestamp: NtpTimestamp::from_bytes(&bytes[32..40]),
            transmit_timestamp: NtpTimestamp::from_bytes(&bytes[40..48]),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = ((self.leap_indicator as u8) << 6)
            | ((self.version & 0x07) << 3)
            | (self.mode as u8 & 0x07);
        bytes[1] = self.stratum;
        bytes[2] = self.poll as u8;
        bytes[3] = self.precision as u8;
        bytes[4..8].copy_from_slice(&self.root_delay.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.root_dispersion.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.reference_identifier);
        self.reference_timestamp.write_to(&mut bytes[16..24]);
        self.originate_timestamp.write_to(&mut bytes[24..32]);
        self.receive_timestamp.write_to(&mut bytes[32..40]);
        self.transmit_timestamp.write_to(&mut bytes[40..48]);
        bytes
    }

    pub fn is_valid_client_request(&self) -> bool {
        self.mode == NtpMode::Client && self.version >= 1 && self.version <= 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_round_trips_within_one_microsecond() {
        for secs in [0i64, 1, 1_000_000, (1i64 << 31) - 1] {
            for usec in [0i32, 1, 500_000, 999_999] {
                let ts = NtpTimestamp::from_unix(secs, usec);
                let (back_secs, back_usec) = ts.to_unix();
                assert_eq!(back_secs, secs);
                assert!((back_usec - usec).abs() <= 1, "usec {back_usec} vs {usec}");
            }
        }
    }

    #[test]
    fn encode_decode_round_trips_on_well_formed_frames() {
        let mut pkt = NtpPacket::template(4, NtpMode::Server, -20);
        pkt.stratum = 1;
        pkt.reference_identifier = *b"GPS\0";
        pkt.transmit_timestamp = NtpTimestamp::from_unix(1_700_000_000, 123_456);
        let bytes = pkt.to_bytes();
        let decoded = NtpPacket::from_bytes(&bytes).unwrap();
        assert_eq!(pkt, decoded);
    }

    #[test]
    fn reply_origin_matches_request_transmit_byte_identical() {
        let mut request = NtpPacket::template(4, NtpMode::Client, 0);
        request.transmit_timestamp = NtpTimestamp::from_unix(1_700_000_001, 42);
        let mut reply = NtpPacket::template(4, NtpMode::Server, -20);
        reply.originate_timestamp = request.transmit_timestamp;
        assert_eq!(reply.originate_timestamp, request.transmit_timestamp);
    }

    #[test]
    fn too_short_buffer_is_rejected() {
        let buf = [0u8; 10];
        assert_eq!(
            NtpPacket::from_bytes(&buf),
            Err(NtpError::InvalidSize { expected: 48, actual: 10 })
        );
    }

    #[test]
    fn client_request_requires_client_mode_and_known_version() {
        let mut req = NtpPacket::template(4, NtpMode::Client, 0);
        assert!(req.is_valid_client_request());
        req.mode = NtpMode::Server;
        assert!(!req.is_valid_client_request());
    }
}
