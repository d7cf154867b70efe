use anyhow::bail;
use std::time::Duration;

/// Tuning knobs for a connection. The wire-relevant values (ack delay, ack window, fragment
///  sizing) must match on both peers to interoperate; the queue capacities and throttles are
///  local policy.
pub struct MessagingConfig {
    /// Number of messages the application can have queued towards the worker before
    ///  `send_message` starts failing (reliable) or dropping (unreliable).
    pub accept_queue_capacity: usize,

    /// Number of parsed inbound messages buffered towards the application. A datagram is
    ///  dropped outright if fewer than 64 slots are left, so that a partially applied
    ///  datagram never needs a partial ack.
    pub inbound_queue_capacity: usize,

    /// Number of pooled message descriptors kept around for reuse; descriptors in excess of
    ///  this are dropped when returned.
    pub message_pool_capacity: usize,

    /// Number of pooled datagram buffers kept around for socket send and receive.
    pub buffer_pool_size: usize,

    /// Size of the sliding window of recently seen inbound packet ids used for duplicate
    ///  suppression.
    pub received_id_window: usize,

    /// Upper bound for a single fragment's payload, applied on top of the
    ///  `max_send_size / 4 - 32` sizing rule.
    pub max_fragment_payload: usize,

    /// A connection with no inbound traffic for this long is considered lost and closed.
    pub connection_lost_timeout: Duration,

    /// Interval for keepalive ping requests (which double as the connection-lost probe).
    pub ping_interval: Duration,

    /// Interval at which the per-second statistics are refreshed.
    pub stats_refresh_interval: Duration,

    /// Cadence of the per-connection protocol bookkeeping (timeout scan, flow control tick,
    ///  ack generation).
    pub update_tick_interval: Duration,

    /// Oldest age a pending ack may reach before an ack message is forced out.
    pub max_ack_delay: Duration,

    /// Number of buffered pending acks that forces an ack message out regardless of age.
    pub max_pending_acks: usize,

    /// How long an inbound content-id stamp suppresses older packet ids in the same slot.
    pub content_stamp_expiry: Duration,

    /// Throttle: maximum datagrams read from the socket in one worker pass.
    pub max_datagrams_per_read: usize,

    /// Throttle: maximum datagrams sent in one worker pass.
    pub max_sends_per_burst: usize,

    /// Throttle: maximum messages accepted from the application per update tick.
    pub max_accepts_per_tick: usize,
}

impl MessagingConfig {
    pub fn default_ipv4() -> MessagingConfig {
        MessagingConfig {
            accept_queue_capacity: 4096,
            inbound_queue_capacity: 4096,
            message_pool_capacity: 1024,
            buffer_pool_size: 64,
            received_id_window: 64 * 1024,
            max_fragment_payload: 470,
            connection_lost_timeout: Duration::from_secs(15),
            ping_interval: Duration::from_millis(3500),
            stats_refresh_interval: Duration::from_secs(1),
            update_tick_interval: Duration::from_millis(10),
            max_ack_delay: Duration::from_millis(33),
            max_pending_acks: 33,
            content_stamp_expiry: Duration::from_secs(5),
            max_datagrams_per_read: 2048,
            max_sends_per_burst: 50,
            max_accepts_per_tick: 500,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.inbound_queue_capacity < 128 {
            bail!("inbound queue must have room for at least two max-size datagrams worth of messages");
        }
        if self.max_fragment_payload == 0 || self.max_fragment_payload > 2047 {
            bail!("fragment payload must fit the 11-bit message content length");
        }
        if self.max_pending_acks == 0 || self.max_pending_acks > 33 {
            bail!("an ack message covers at most a base id plus 32 following ids");
        }
        Ok(())
    }

    /// Fragment payload size for a socket with the given datagram budget: a quarter of the
    ///  datagram minus header headroom, capped by the policy maximum.
    pub fn fragment_size(&self, max_send_size: usize) -> usize {
        (max_send_size / 4).saturating_sub(32).min(self.max_fragment_payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(MessagingConfig::default_ipv4().validate().is_ok());
    }

    #[rstest]
    #[case::tiny_inbound_queue(|c: &mut MessagingConfig| c.inbound_queue_capacity = 64)]
    #[case::zero_fragment(|c: &mut MessagingConfig| c.max_fragment_payload = 0)]
    #[case::oversized_fragment(|c: &mut MessagingConfig| c.max_fragment_payload = 2048)]
    #[case::zero_ack_window(|c: &mut MessagingConfig| c.max_pending_acks = 0)]
    #[case::oversized_ack_window(|c: &mut MessagingConfig| c.max_pending_acks = 34)]
    fn test_validate_rejects(#[case] break_config: fn(&mut MessagingConfig)) {
        let mut config = MessagingConfig::default_ipv4();
        break_config(&mut config);
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::small_socket(512, 96)]
    #[case::full_ethernet(1472, 336)]
    #[case::capped_by_policy(2048, 470)]
    #[case::large_socket(65536, 470)]
    fn test_fragment_size(#[case] max_send_size: usize, #[case] expected: usize) {
        let config = MessagingConfig::default_ipv4();
        assert_eq!(config.fragment_size(max_send_size), expected);
    }
}
