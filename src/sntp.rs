//! SNTP protocol engine: RFC 5905 request/reply, periodic broadcast, and
//! the broadcast-client upstream pool used when no GPS fix is available.
//!
//! The pool/election/fan-out design here is not present in the captured
//! `hc_ntp.c`/`hc_broadcast.c` (an older, single-upstream version); it is
//! built directly from spec prose, following the same reply-assembly and
//! timestamp-encoding conventions those files do use.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};

use crate::clock::ClockDisciplinarian;
use crate::interfaces::InterfaceRegistry;
use crate::packet::{seconds_to_fixed, NtpMode, NtpPacket, NtpTimestamp};
use crate::timeval::Timeval;

const POOL_SIZE: usize = 4;
const CLIENT_RING_DEPTH: usize = 128;
const TRAFFIC_RING_DEPTH: usize = 128;
pub const MIN_BROADCAST_PERIOD_SECS: u64 = 10;

#[derive(Debug, Clone, Default)]
pub struct UpstreamSlot {
    pub address: Option<Ipv4Addr>,
    pub last_receive: Option<Timeval>,
    pub last_origin: NtpTimestamp,
    pub stratum: u8,
    pub logged: bool,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub address: Ipv4Addr,
    pub local_receive: Timeval,
    pub origin_transmit: NtpTimestamp,
    pub logged: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrafficBucket {
    pub received: u32,
    pub serviced: u32,
    pub broadcast_sent: u32,
    pub timestamp: i64,
}

pub struct SntpConfig {
    pub port: u16,
    pub broadcast_period_secs: u64,
    pub broadcast_without_gps: bool,
    pub precision: i8,
}

impl SntpConfig {
    pub fn period(&self) -> u64 {
        self.broadcast_period_secs.max(MIN_BROADCAST_PERIOD_SECS)
    }
}

pub struct SntpEngine {
    config: SntpConfig,
    stratum: u8,
    refid: [u8; 4],
    pool: [UpstreamSlot; POOL_SIZE],
    selected: Option<usize>,
    clients: VecDeque<ClientRecord>,
    traffic_ring: [TrafficBucket; TRAFFIC_RING_DEPTH],
    live_received: u32,
    live_serviced: u32,
    live_broadcast_sent: u32,
    last_bucket_decasecond: Option<i64>,
    last_broadcast_at_secs: Option<i64>,
}

impl SntpEngine {
    pub fn new(config: SntpConfig) -> Self {
        SntpEngine {
            config,
            stratum: 0,
            refid: [0; 4],
            pool: Default::default(),
            selected: None,
            clients: VecDeque::with_capacity(CLIENT_RING_DEPTH),
            traffic_ring: [TrafficBucket::default(); TRAFFIC_RING_DEPTH],
            live_received: 0,
            live_serviced: 0,
            live_broadcast_sent: 0,
            last_bucket_decasecond: None,
            last_broadcast_at_secs: None,
        }
    }

    pub fn stratum(&self) -> u8 {
        self.stratum
    }

    pub fn refid(&self) -> [u8; 4] {
        self.refid
    }

    pub fn pool(&self) -> &[UpstreamSlot; POOL_SIZE] {
        &self.pool
    }

    pub fn clients(&self) -> impl Iterator<Item = &ClientRecord> {
        self.clients.iter()
    }

    pub fn traffic_ring(&self) -> &[TrafficBucket; TRAFFIC_RING_DEPTH] {
        &self.traffic_ring
    }

    /// Dispatches one received datagram per spec.md §4.4's mode table.
    /// Returns reply bytes to send back to `peer`, if any.
    pub fn handle_datagram(
        &mut self,
        buf: &[u8],
        peer: SocketAddr,
        local_now: Timeval,
        clock: &mut ClockDisciplinarian,
        interfaces: &InterfaceRegistry,
        gps_active: bool,
    ) -> Option<Vec<u8>> {
        self.live_received += 1;
        let Ok(packet) = NtpPacket::from_bytes(buf) else {
            return None;
        };
        let SocketAddr::V4(peer_v4) = peer else {
            return None; // IPv6 is out of scope.
        };

        match packet.mode {
            NtpMode::Client => {
                self.handle_client_request(packet, *peer_v4.ip(), local_now, clock, interfaces, gps_active)
            }
            NtpMode::Server => None, // calibration-reply handling is observation-only
            NtpMode::Broadcast => {
                if !gps_active {
                    self.handle_upstream_broadcast(packet, *peer_v4.ip(), local_now, clock);
                }
                None
            }
            NtpMode::ControlMessage => None,
            _ => {
                tracing::debug!(mode = ?packet.mode, "ignoring unrecognized mode");
                None
            }
        }
    }

    fn handle_client_request(
        &mut self,
        request: NtpPacket,
        peer: Ipv4Addr,
        local_now: Timeval,
        clock: &ClockDisciplinarian,
        interfaces: &InterfaceRegistry,
        gps_active: bool,
    ) -> Option<Vec<u8>> {
        if self.stratum == 0 || !clock.synchronized() {
            return None;
        }
        if !gps_active && interfaces.local_match(peer).is_none() {
            tracing::debug!(%peer, "dropping client request from non-local peer");
            return None;
        }

        let mut reply = NtpPacket::template(request.version.clamp(1, 4), NtpMode::Server, self.config.precision);
        reply.poll = request.poll;
        reply.stratum = self.stratum;
        reply.reference_identifier = self.refid;
        reply.originate_timestamp = request.transmit_timestamp;
        reply.receive_timestamp = NtpTimestamp::from_timeval(local_now);
        reply.reference_timestamp = NtpTimestamp::from_timeval(clock.reference());
        reply.root_dispersion = seconds_to_fixed(clock.dispersion_seconds());
        reply.transmit_timestamp = NtpTimestamp::from_timeval(Timeval::now());

        self.record_client(peer, local_now, request.transmit_timestamp);
        self.live_serviced += 1;
        Some(reply.to_bytes().to_vec())
    }

    fn record_client(&mut self, address: Ipv4Addr, local_receive: Timeval, origin_transmit: NtpTimestamp) {
        if self.clients.len() >= CLIENT_RING_DEPTH {
            self.clients.pop_front();
        }
        self.clients.push_back(ClientRecord {
            address,
            local_receive,
            origin_transmit,
            logged: true,
        });
    }

    fn handle_upstream_broadcast(
        &mut self,
        packet: NtpPacket,
        peer: Ipv4Addr,
        local_now: Timeval,
        clock: &mut ClockDisciplinarian,
    ) {
        if packet.stratum == 0 {
            return;
        }
        let period = self.config.period();
        let Some(idx) = self.find_or_allocate_slot(peer, packet.stratum, local_now, period) else {
            tracing::debug!(%peer, "upstream pool full, no slot qualifies, dropping");
            return;
        };

        // A dead slot can be reused by an unrelated peer. If that slot was
        // the selected source, its death must force re-election rather than
        // silently rediscipline off the new occupant's data.
        let evicting_selected = self.selected == Some(idx) && self.pool[idx].address != Some(peer);

        self.pool[idx] = UpstreamSlot {
            address: Some(peer),
            last_receive: Some(local_now),
            last_origin: packet.transmit_timestamp,
            stratum: packet.stratum,
            logged: true,
            name: peer.to_string(),
        };

        if evicting_selected {
            self.selected = None;
        }

        match self.selected {
            None => self.selected = self.elect(local_now, period),
            Some(sel) if self.pool[idx].stratum < self.pool[sel].stratum => self.selected = Some(idx),
            _ => {}
        }

        if self.selected == Some(idx) {
            let source = self.pool[idx].last_origin.to_timeval();
            clock.synchronize(source, local_now, 0);
            self.stratum = self.pool[idx].stratum + 1;
            self.refid = peer.octets();
        }
    }

    fn find_or_allocate_slot(&self, peer: Ipv4Addr, incoming_stratum: u8, now: Timeval, period: u64) -> Option<usize> {
        if let Some(idx) = self.pool.iter().position(|s| s.address == Some(peer)) {
            return Some(idx);
        }
        if let Some(idx) = self.pool.iter().position(|s| s.address.is_none() || self.is_dead(s, now, period)) {
            return Some(idx);
        }
        self.pool
            .iter()
            .enumerate()
            .filter(|(_, s)| s.stratum > incoming_stratum)
            .max_by_key(|(_, s)| s.stratum)
            .map(|(i, _)| i)
    }

    fn elect(&self, now: Timeval, period: u64) -> Option<usize> {
        self.pool
            .iter()
            .enumerate()
            .filter(|(_, s)| s.address.is_some() && !self.is_dead(s, now, period))
            .min_by_key(|(i, s)| (s.stratum, *i))
            .map(|(i, _)| i)
    }

    fn is_dead(&self, slot: &UpstreamSlot, now: Timeval, period: u64) -> bool {
        match slot.last_receive {
            Some(t) => now.diff_ms(t) > 3 * period as i64 * 1000,
            None => true,
        }
    }

    /// Runs once per advancing second: rolls the traffic bucket, ages the
    /// upstream pool (client mode only), and sends a periodic broadcast
    /// when due.
    pub fn periodic(
        &mut self,
        now: Timeval,
        clock: &ClockDisciplinarian,
        interfaces: &mut InterfaceRegistry,
        gps_active: bool,
    ) {
        self.roll_traffic_bucket(now);

        if gps_active {
            self.stratum = if clock.synchronized() { 1 } else { 0 };
            self.refid = *b"GPS\0";
        } else {
            let period = self.config.period();
            if let Some(sel) = self.selected {
                if self.is_dead(&self.pool[sel], now, period) {
                    self.selected = None;
                    self.stratum = 0;
                }
            }
            if self.selected.is_none() {
                self.stratum = 0;
            } else if let Some(sel) = self.selected {
                self.refid = self.pool[sel].address.map(|a| a.octets()).unwrap_or([0; 4]);
            }
        }

        let should_broadcast = clock.synchronized() && (gps_active || self.config.broadcast_without_gps);
        if !should_broadcast {
            return;
        }
        let period = self.config.period() as i64;
        let due = self.last_broadcast_at_secs.map_or(true, |t| now.secs - t >= period);
        if !due {
            return;
        }

        if let Err(e) = interfaces.enumerate() {
            tracing::warn!(error = %e, "interface re-enumeration failed before broadcast");
        }

        let stratum = self.stratum;
        let precision = self.config.precision;
        let reference = NtpTimestamp::from_timeval(clock.reference());
        let port = self.config.port;
        let mut sent = 0u32;
        interfaces.broadcast(port, |addr| {
            sent += 1;
            let mut pkt = NtpPacket::template(4, NtpMode::Broadcast, precision);
            pkt.stratum = stratum;
            pkt.reference_identifier = addr.octets();
            pkt.reference_timestamp = reference;
            pkt.transmit_timestamp = NtpTimestamp::from_timeval(Timeval::now());
            pkt.to_bytes().to_vec()
        });
        self.live_broadcast_sent += sent;
        self.last_broadcast_at_secs = Some(now.secs);
    }

    fn roll_traffic_bucket(&mut self, now: Timeval) {
        let decasecond = now.secs / 10;
        if self.last_bucket_decasecond == Some(decasecond) {
            return;
        }
        if let Some(prev) = self.last_bucket_decasecond {
            let idx = prev.rem_euclid(TRAFFIC_RING_DEPTH as i64) as usize;
            self.traffic_ring[idx] = TrafficBucket {
                received: self.live_received,
                serviced: self.live_serviced,
                broadcast_sent: self.live_broadcast_sent,
                timestamp: prev * 10,
            };
            self.live_received = 0;
            self.live_serviced = 0;
            self.live_broadcast_sent = 0;
        }
        self.last_bucket_decasecond = Some(decasecond);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, SocketAddrV4};

    fn config() -> SntpConfig {
        SntpConfig {
            port: 123,
            broadcast_period_secs: 10,
            broadcast_without_gps: false,
            precision: -20,
        }
    }

    fn peer(ip: [u8; 4]) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), 123))
    }

    #[test]
    fn client_request_reply_echoes_origin_and_samples_transmit_after_receive() {
        let mut engine = SntpEngine::new(config());
        engine.stratum = 1;
        engine.refid = *b"GPS\0";
        let mut clock = ClockDisciplinarian::new(10);
        let t0 = Timeval::new(1_700_000_000, 0);
        clock.synchronize(t0, t0, 0);

        let mut interfaces = InterfaceRegistry::new();
        let mut request = NtpPacket::template(4, NtpMode::Client, 0);
        request.transmit_timestamp = NtpTimestamp::from_unix(1_700_000_050, 500);
        let local_now = Timeval::new(1_700_000_050, 600);

        let reply_bytes = engine
            .handle_datagram(&request.to_bytes(), peer([127, 0, 0, 1]), local_now, &mut clock, &interfaces, true)
            .expect("synchronized stratum-1 server must reply");
        let reply = NtpPacket::from_bytes(&reply_bytes).unwrap();

        assert_eq!(reply.originate_timestamp, request.transmit_timestamp);
        assert_eq!(reply.receive_timestamp, NtpTimestamp::from_timeval(local_now));
        assert_eq!(reply.stratum, 1);
        assert_eq!(&reply.reference_identifier, b"GPS\0");
        assert!(reply.transmit_timestamp.to_unix().0 >= local_now.secs);
    }

    #[test]
    fn unsynchronized_server_ignores_client_requests() {
        let mut engine = SntpEngine::new(config());
        engine.stratum = 0;
        let mut clock = ClockDisciplinarian::new(10);
        let interfaces = InterfaceRegistry::new();
        let request = NtpPacket::template(4, NtpMode::Client, 0);
        let reply = engine.handle_datagram(
            &request.to_bytes(),
            peer([127, 0, 0, 1]),
            Timeval::default(),
            &mut clock,
            &interfaces,
            true,
        );
        assert!(reply.is_none());
    }

    #[test]
    fn upstream_election_prefers_lower_stratum_and_ages_out() {
        let mut engine = SntpEngine::new(config());
        let mut clock = ClockDisciplinarian::new(10);
        clock.synchronize(Timeval::new(0, 0), Timeval::new(0, 0), 0);

        let mut make_broadcast = |stratum: u8, secs: i64| {
            let mut pkt = NtpPacket::template(4, NtpMode::Broadcast, -20);
            pkt.stratum = stratum;
            pkt.transmit_timestamp = NtpTimestamp::from_unix(secs, 0);
            pkt
        };

        let a = make_broadcast(2, 0);
        engine.handle_upstream_broadcast(a, Ipv4Addr::new(10, 0, 0, 1), Timeval::new(0, 0), &mut clock);
        assert_eq!(engine.selected, Some(engine.find_or_allocate_slot(Ipv4Addr::new(10, 0, 0, 1), 2, Timeval::new(0, 0), 10).unwrap()));

        let b = make_broadcast(3, 1);
        engine.handle_upstream_broadcast(b, Ipv4Addr::new(10, 0, 0, 2), Timeval::new(1, 0), &mut clock);
        let selected_after_b = engine.pool[engine.selected.unwrap()].address;
        assert_eq!(selected_after_b, Some(Ipv4Addr::new(10, 0, 0, 1)));

        let c = make_broadcast(1, 2);
        engine.handle_upstream_broadcast(c, Ipv4Addr::new(10, 0, 0, 3), Timeval::new(2, 0), &mut clock);
        let selected_after_c = engine.pool[engine.selected.unwrap()].address;
        assert_eq!(selected_after_c, Some(Ipv4Addr::new(10, 0, 0, 3)));

        let mut interfaces = InterfaceRegistry::new();
        // Selected slot `c` last received at secs=2; it's dead once more
        // than 3*period seconds have elapsed since then.
        let late = Timeval::new(2 + 3 * 10 + 1, 0);
        engine.periodic(late, &clock, &mut interfaces, false);
        assert_eq!(engine.selected, None);
        assert_eq!(engine.stratum, 0);
    }

    #[test]
    fn dead_selected_slot_reused_by_unrelated_peer_forces_reelection() {
        let mut engine = SntpEngine::new(config());
        let mut clock = ClockDisciplinarian::new(10);
        clock.synchronize(Timeval::new(0, 0), Timeval::new(0, 0), 0);

        let mut broadcast = |stratum: u8, secs: i64| {
            let mut pkt = NtpPacket::template(4, NtpMode::Broadcast, -20);
            pkt.stratum = stratum;
            pkt.transmit_timestamp = NtpTimestamp::from_unix(secs, 0);
            pkt
        };

        // Three slots stay alive (last receive at t=35), one slot (the
        // lowest-stratum, selected one) last received at t=0 and will age
        // out on its own while the others remain live.
        engine.handle_upstream_broadcast(broadcast(5, 35), Ipv4Addr::new(10, 0, 0, 1), Timeval::new(35, 0), &mut clock);
        engine.handle_upstream_broadcast(broadcast(5, 35), Ipv4Addr::new(10, 0, 0, 2), Timeval::new(35, 0), &mut clock);
        engine.handle_upstream_broadcast(broadcast(5, 35), Ipv4Addr::new(10, 0, 0, 3), Timeval::new(35, 0), &mut clock);
        engine.handle_upstream_broadcast(broadcast(1, 0), Ipv4Addr::new(10, 0, 0, 4), Timeval::new(0, 0), &mut clock);
        let dying_idx = engine.selected.expect("lowest-stratum peer must be selected");
        assert_eq!(engine.pool[dying_idx].address, Some(Ipv4Addr::new(10, 0, 0, 4)));

        // At t=40 slot `dying_idx` (last seen at t=0) is dead (40s > 3*10s)
        // while the other three (last seen at t=35) are still alive. An
        // unrelated new peer with a *worse* stratum reuses that dead slot.
        let now = Timeval::new(40, 0);
        engine.handle_upstream_broadcast(broadcast(9, 40), Ipv4Addr::new(10, 0, 0, 99), now, &mut clock);

        let reelected = engine.selected.expect("re-election must pick a live slot");
        assert_ne!(reelected, dying_idx, "the reused dead slot must not remain selected without re-election");
        assert_eq!(engine.pool[reelected].stratum, 5, "election must pick the best surviving stratum, not the new occupant's");
    }

    #[test]
    fn traffic_bucket_rolls_on_decasecond_boundary() {
        let mut engine = SntpEngine::new(config());
        let mut clock = ClockDisciplinarian::new(10);
        let mut interfaces = InterfaceRegistry::new();
        engine.live_received = 5;
        engine.periodic(Timeval::new(9, 0), &clock, &mut interfaces, false);
        engine.live_received += 2;
        engine.periodic(Timeval::new(11, 0), &clock, &mut interfaces, false);
        assert_eq!(engine.traffic_ring[0].received, 5);
        let _ = &clock;
    }
}
