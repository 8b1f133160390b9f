//! Core event loop: the single thread that owns the UDP socket, the SNTP
//! engine, and the clock disciplinarian. It is the only thread that ever
//! calls `ClockDisciplinarian::synchronize`, matching spec.md §5's
//! single-writer rule on `settimeofday`/`adjtime`.
//!
//! Grounded in houseclock's single-threaded `poll(2)`-driven main loop;
//! `nix::poll` replaces the raw libc wrapper the original used. Since GPS
//! synchronize events arrive over an `mpsc` channel rather than a pollable
//! fd, the UDP socket is polled with a 1-second timeout and the channel is
//! drained non-blockingly after every wake, which keeps the once-a-second
//! upkeep (traffic roll, pool aging, periodic broadcast) on schedule without
//! a second polled fd.

use std::net::UdpSocket;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::{Arc, RwLock};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::clock::ClockDisciplinarian;
use crate::gps_reader::GpsSnapshot;
use crate::interfaces::InterfaceRegistry;
use crate::nmea::SynchronizeEvent;
use crate::security::{IpFilter, RateLimiter};
use crate::sntp::SntpEngine;
use crate::telemetry::{
    ClientRecord, ClockStatusSnapshot, DriftSample, NmeaStatusSnapshot, SentenceSnapshot, Snapshot,
    TelemetryExporter, TrafficBucket, UpstreamSlotSnapshot,
};
use crate::timeval::Timeval;

const POLL_TIMEOUT_MS: u16 = 1000;
const RECV_BUFFER_SIZE: usize = 512;

pub struct Engine {
    socket: UdpSocket,
    clock: ClockDisciplinarian,
    sntp: SntpEngine,
    interfaces: InterfaceRegistry,
    telemetry: TelemetryExporter,
    rate_limiter: Option<RateLimiter>,
    ip_filter: IpFilter,
    gps_events: Receiver<SynchronizeEvent>,
    gps_snapshot: Arc<RwLock<GpsSnapshot>>,
    last_tick_secs: Option<i64>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        socket: UdpSocket,
        clock: ClockDisciplinarian,
        sntp: SntpEngine,
        mut interfaces: InterfaceRegistry,
        telemetry: TelemetryExporter,
        rate_limiter: Option<RateLimiter>,
        ip_filter: IpFilter,
        gps_events: Receiver<SynchronizeEvent>,
        gps_snapshot: Arc<RwLock<GpsSnapshot>>,
    ) -> anyhow::Result<Self> {
        socket.set_nonblocking(true)?;
        if let Err(e) = interfaces.enumerate() {
            tracing::warn!(error = %e, "initial interface enumeration failed");
        }
        Ok(Engine {
            socket,
            clock,
            sntp,
            interfaces,
            telemetry,
            rate_limiter,
            ip_filter,
            gps_events,
            gps_snapshot,
            last_tick_secs: None,
        })
    }

    pub fn telemetry_arc(&self) -> Arc<RwLock<Snapshot>> {
        self.telemetry.clone_arc()
    }

    /// Runs until `shutdown` is set. Each iteration: poll the socket with a
    /// 1s timeout, drain pending GPS synchronize events, service a ready
    /// datagram if any, then run the once-a-second upkeep if the wall clock
    /// has advanced.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        let mut buf = [0u8; RECV_BUFFER_SIZE];

        while !shutdown.load(Ordering::Relaxed) {
            let borrowed = self.socket.as_fd();
            let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    tracing::error!(error = %e, "poll failed");
                    continue;
                }
            }

            self.drain_gps_events();

            let readable = fds[0]
                .revents()
                .is_some_and(|r| r.contains(PollFlags::POLLIN));
            if readable {
                self.service_socket(&mut buf);
            }

            let now = Timeval::now();
            if self.last_tick_secs != Some(now.secs) {
                self.last_tick_secs = Some(now.secs);
                self.tick(now);
            }
        }
    }

    fn drain_gps_events(&mut self) {
        loop {
            match self.gps_events.try_recv() {
                Ok(event) => self
                    .clock
                    .synchronize(event.gps_time, event.local_time, event.latency_ms),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn service_socket(&mut self, buf: &mut [u8]) {
        loop {
            match self.socket.recv_from(buf) {
                Ok((n, peer)) => {
                    let local_now = Timeval::now();
                    if !self.ip_filter.is_allowed(peer.ip()) {
                        continue;
                    }
                    if let Some(limiter) = &self.rate_limiter {
                        if !limiter.check_rate_limit(peer.ip()) {
                            continue;
                        }
                    }
                    let gps_active = self.gps_active();
                    if let Some(reply) = self.sntp.handle_datagram(
                        &buf[..n],
                        peer,
                        local_now,
                        &mut self.clock,
                        &self.interfaces,
                        gps_active,
                    ) {
                        if let Err(e) = self.socket.send_to(&reply, peer) {
                            tracing::warn!(%peer, error = %e, "reply send failed");
                        }
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "socket recv failed");
                    break;
                }
            }
        }
    }

    fn gps_active(&self) -> bool {
        self.gps_snapshot.read().map(|s| s.active).unwrap_or(false)
    }

    fn tick(&mut self, now: Timeval) {
        let gps_active = self.gps_active();
        self.sntp.periodic(now, &self.clock, &mut self.interfaces, gps_active);
        self.publish_telemetry(now);
    }

    fn publish_telemetry(&self, now: Timeval) {
        let gps = self.gps_snapshot.read().ok();
        let nmea = gps.as_ref().map_or_else(NmeaStatusSnapshot::default, |g| NmeaStatusSnapshot {
            fix: g.active,
            date: g.date.clone(),
            time: g.time.clone(),
            latitude: g.latitude.clone(),
            longitude: g.longitude.clone(),
            hemisphere: format!("{}{}", g.hemisphere.0, g.hemisphere.1),
            talker_history: g.sentence_history.iter().map(SentenceSnapshot::from).collect(),
        });
        let satellites = gps.map(|g| g.satellites.clone()).unwrap_or_default();

        let clock_status: ClockStatusSnapshot = self.clock.status().into();
        let drift_ring: Vec<DriftSample> = self.clock.metrics_ring().iter().map(DriftSample::from).collect();
        let traffic_ring: Vec<TrafficBucket> = self
            .sntp
            .traffic_ring()
            .iter()
            .map(|b| TrafficBucket {
                received: b.received,
                serviced: b.serviced,
                broadcast_sent: b.broadcast_sent,
                timestamp: b.timestamp,
            })
            .collect();
        let client_ring: Vec<ClientRecord> = self
            .sntp
            .clients()
            .map(|c| ClientRecord {
                address: c.address.to_string(),
                local_receive_secs: c.local_receive.secs,
                origin_transmit_seconds: c.origin_transmit.seconds,
                logged: c.logged,
            })
            .collect();
        let upstream_pool: Vec<UpstreamSlotSnapshot> = self
            .sntp
            .pool()
            .iter()
            .map(|s| UpstreamSlotSnapshot {
                address: s.address.map(|a| a.to_string()),
                last_receive_secs: s.last_receive.map(|t| t.secs),
                stratum: s.stratum,
                name: s.name.clone(),
            })
            .collect();

        let refid = String::from_utf8_lossy(&self.sntp.refid())
            .trim_end_matches('\0')
            .to_string();

        let snapshot = Snapshot {
            stratum: self.sntp.stratum(),
            refid,
            clock: clock_status,
            drift_ring,
            traffic_ring,
            client_ring,
            upstream_pool,
            nmea,
            satellites,
            current_unix_secs: now.secs,
        }
        .now_stamped(now);
        self.telemetry.publish(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sntp::SntpConfig;
    use std::sync::mpsc;

    #[test]
    fn engine_construction_binds_nonblocking_socket() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let clock = ClockDisciplinarian::new(10);
        let sntp = SntpEngine::new(SntpConfig {
            port: 123,
            broadcast_period_secs: 10,
            broadcast_without_gps: false,
            precision: -20,
        });
        let (_tx, rx) = mpsc::channel();
        let gps_snapshot = Arc::new(RwLock::new(GpsSnapshot::default()));
        let engine = Engine::new(
            socket,
            clock,
            sntp,
            InterfaceRegistry::new(),
            TelemetryExporter::new(),
            None,
            IpFilter::new(vec![], vec![]),
            rx,
            gps_snapshot,
        );
        assert!(engine.is_ok());
    }
}
