use crate::packet_id::PacketId;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// sliding window over which the per-second rates and the packet loss figures are computed
const STATS_WINDOW: Duration = Duration::from_secs(5);

/// how much a fresh ping measurement moves the application-visible rtt estimate
const RTT_PREDICT_BIAS: f32 = 0.5;

/// Application-visible snapshot of a connection's traffic and quality figures, refreshed
///  once per second by the worker.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ConnectionStats {
    pub rtt_millis: f32,
    pub bytes_in_per_sec: f32,
    pub bytes_out_per_sec: f32,
    pub packets_in_per_sec: f32,
    pub packets_out_per_sec: f32,
    pub msgs_in_per_sec: f32,
    pub msgs_out_per_sec: f32,
    /// fraction of datagrams missing from the received packet id sequence
    pub packet_loss_rate: f32,
    /// missing datagrams per second
    pub packet_loss_count: f32,
}

struct TrafficTrack {
    at: Instant,
    bytes_in: u64,
    bytes_out: u64,
    packets_in: u64,
    packets_out: u64,
    msgs_in: u64,
    msgs_out: u64,
}

struct PingTrack {
    ping_id: u8,
    sent_at: Instant,
    reply_received: bool,
}

struct ReceivedPacketTrack {
    at: Instant,
    packet_id: PacketId,
}

struct StatsInner {
    traffic: Vec<TrafficTrack>,
    pings: Vec<PingTrack>,
    recv_packet_ids: Vec<ReceivedPacketTrack>,
    snapshot: ConnectionStats,
}

/// Connection statistics behind their own lock: the worker records events and folds them
///  into the snapshot, application threads only ever read the snapshot.
pub struct StatsContainer {
    inner: Mutex<StatsInner>,
}

impl StatsContainer {
    pub fn new() -> StatsContainer {
        StatsContainer {
            inner: Mutex::new(StatsInner {
                traffic: Vec::new(),
                pings: Vec::new(),
                recv_packet_ids: Vec::new(),
                snapshot: ConnectionStats::default(),
            }),
        }
    }

    pub fn add_inbound(&self, now: Instant, bytes: u64, packets: u64, msgs: u64) {
        if bytes == 0 && packets == 0 && msgs == 0 {
            return;
        }
        self.inner.lock().unwrap().traffic.push(TrafficTrack {
            at: now,
            bytes_in: bytes,
            bytes_out: 0,
            packets_in: packets,
            packets_out: 0,
            msgs_in: msgs,
            msgs_out: 0,
        });
    }

    pub fn add_outbound(&self, now: Instant, bytes: u64, packets: u64, msgs: u64) {
        if bytes == 0 && packets == 0 && msgs == 0 {
            return;
        }
        self.inner.lock().unwrap().traffic.push(TrafficTrack {
            at: now,
            bytes_in: 0,
            bytes_out: bytes,
            packets_in: 0,
            packets_out: packets,
            msgs_in: 0,
            msgs_out: msgs,
        });
    }

    pub fn record_received_packet_id(&self, now: Instant, packet_id: PacketId) {
        self.inner.lock().unwrap().recv_packet_ids.push(ReceivedPacketTrack { at: now, packet_id });
    }

    /// registers an outgoing ping and returns its id
    pub fn start_ping(&self, now: Instant) -> u8 {
        let mut inner = self.inner.lock().unwrap();
        let ping_id = inner.pings.last().map(|p| p.ping_id.wrapping_add(1)).unwrap_or(1);
        inner.pings.push(PingTrack {
            ping_id,
            sent_at: now,
            reply_received: false,
        });
        ping_id
    }

    /// Matches a ping reply against the outstanding requests. A match blends the measured
    ///  round trip into the rtt estimate.
    pub fn on_ping_reply(&self, now: Instant, ping_id: u8) {
        let mut inner = self.inner.lock().unwrap();

        let ping = inner
            .pings
            .iter_mut()
            .find(|p| p.ping_id == ping_id && !p.reply_received);
        match ping {
            Some(ping) => {
                ping.reply_received = true;
                let sample_millis = now.saturating_duration_since(ping.sent_at).as_secs_f32() * 1000.0;
                inner.snapshot.rtt_millis = RTT_PREDICT_BIAS * sample_millis
                    + (1.0 - RTT_PREDICT_BIAS) * inner.snapshot.rtt_millis;
            }
            None => {
                warn!("ping reply with id {} has no matching outstanding ping request", ping_id);
            }
        }
    }

    pub fn snapshot(&self) -> ConnectionStats {
        self.inner.lock().unwrap().snapshot
    }

    /// folds the event tracks of the last five seconds into the per-second snapshot
    pub fn refresh(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap();

        inner.traffic.retain(|t| now.saturating_duration_since(t.at) <= STATS_WINDOW);
        inner.recv_packet_ids.retain(|t| now.saturating_duration_since(t.at) <= STATS_WINDOW);
        inner.pings.retain(|p| !p.reply_received || now.saturating_duration_since(p.sent_at) <= STATS_WINDOW);

        Self::compute_traffic_rates(&mut inner);
        Self::compute_packet_loss(&mut inner);
    }

    fn compute_traffic_rates(inner: &mut StatsInner) {
        if inner.traffic.len() <= 1 {
            inner.snapshot.bytes_in_per_sec = 0.0;
            inner.snapshot.bytes_out_per_sec = 0.0;
            inner.snapshot.packets_in_per_sec = 0.0;
            inner.snapshot.packets_out_per_sec = 0.0;
            inner.snapshot.msgs_in_per_sec = 0.0;
            inner.snapshot.msgs_out_per_sec = 0.0;
            return;
        }

        let secs = inner
            .traffic
            .last()
            .unwrap()
            .at
            .saturating_duration_since(inner.traffic.first().unwrap().at)
            .as_secs_f32();
        if secs <= 0.0 {
            return;
        }

        let mut bytes_in = 0;
        let mut bytes_out = 0;
        let mut packets_in = 0;
        let mut packets_out = 0;
        let mut msgs_in = 0;
        let mut msgs_out = 0;
        for t in &inner.traffic {
            bytes_in += t.bytes_in;
            bytes_out += t.bytes_out;
            packets_in += t.packets_in;
            packets_out += t.packets_out;
            msgs_in += t.msgs_in;
            msgs_out += t.msgs_out;
        }

        inner.snapshot.bytes_in_per_sec = bytes_in as f32 / secs;
        inner.snapshot.bytes_out_per_sec = bytes_out as f32 / secs;
        inner.snapshot.packets_in_per_sec = packets_in as f32 / secs;
        inner.snapshot.packets_out_per_sec = packets_out as f32 / secs;
        inner.snapshot.msgs_in_per_sec = msgs_in as f32 / secs;
        inner.snapshot.msgs_out_per_sec = msgs_out as f32 / secs;
    }

    /// Gap analysis over the received packet ids: every id between the oldest and newest
    ///  received id that never arrived counts as a missed datagram.
    fn compute_packet_loss(inner: &mut StatsInner) {
        if inner.recv_packet_ids.len() <= 1 {
            inner.snapshot.packet_loss_rate = 0.0;
            inner.snapshot.packet_loss_count = 0.0;
            return;
        }

        let oldest = inner
            .recv_packet_ids
            .iter()
            .map(|t| t.packet_id)
            .reduce(|oldest, id| if oldest.is_newer_than(id) { id } else { oldest })
            .unwrap();

        let mut rel_ids: Vec<u32> = inner
            .recv_packet_ids
            .iter()
            .map(|t| t.packet_id.minus(oldest))
            .collect();
        rel_ids.sort_unstable();
        rel_ids.dedup();

        let mut num_missed = 0u32;
        for pair in rel_ids.windows(2) {
            num_missed += pair[1] - pair[0] - 1;
        }

        inner.snapshot.packet_loss_rate =
            num_missed as f32 / (rel_ids.len() as u32 + num_missed) as f32;
        inner.snapshot.packet_loss_count = num_missed as f32 / STATS_WINDOW.as_secs_f32();
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.traffic.clear();
        inner.pings.clear();
        inner.recv_packet_ids.clear();
    }
}

impl Default for StatsContainer {
    fn default() -> Self {
        Self::new()
    }
}
