use std::time::Duration;
use tracing::trace;

const ALPHA: f32 = 1.0 / 8.0;
const BETA: f32 = 1.0 / 4.0;

/// RTO bounds in seconds
const MIN_RTO: f32 = 1.0;
const MAX_RTO: f32 = 5.0;

/// constant headroom added to the RTO so excellent conditions (localhost, LAN) do not
///  produce overly optimistic timeouts
const SAFETY_THRESHOLD_ADD: f32 = 1.0;
const SAFETY_THRESHOLD_MUL: f32 = 2.0;

/// Smoothed RTT / RTO estimation in the style of RFC 2988. All values in seconds. Samples
///  are only taken from packets acked on their first transmission attempt, so retransmission
///  ambiguity never pollutes the estimate.
pub struct RttEstimator {
    smoothed_rtt: f32,
    rtt_variation: f32,
    retransmission_timeout: f32,
    /// true until the first sample arrives; the first sample initializes rather than blends
    rtt_cleared: bool,
}

impl RttEstimator {
    pub fn new() -> RttEstimator {
        RttEstimator {
            smoothed_rtt: 3.0,
            rtt_variation: 0.0,
            retransmission_timeout: 3.0,
            rtt_cleared: true,
        }
    }

    pub fn smoothed_rtt(&self) -> f32 {
        self.smoothed_rtt
    }

    pub fn rtt_variation(&self) -> f32 {
        self.rtt_variation
    }

    pub fn rto(&self) -> Duration {
        Duration::from_secs_f32(self.retransmission_timeout)
    }

    /// feeds one round trip measurement (in seconds) from a first-attempt ack
    pub fn on_ack_sample(&mut self, rtt: f32) {
        if self.rtt_cleared {
            self.rtt_cleared = false;
            self.rtt_variation = rtt / 2.0;
            self.smoothed_rtt = rtt;
        }
        else {
            self.rtt_variation = (1.0 - BETA) * self.rtt_variation + BETA * (self.smoothed_rtt - rtt).abs();
            self.smoothed_rtt = (1.0 - ALPHA) * self.smoothed_rtt + ALPHA * rtt;
        }

        self.retransmission_timeout = (SAFETY_THRESHOLD_ADD
            + SAFETY_THRESHOLD_MUL * (self.smoothed_rtt + self.rtt_variation))
            .clamp(MIN_RTO, MAX_RTO);

        trace!(
            "rtt sample {:.3}s: srtt {:.3}s, rttvar {:.3}s, rto {:.3}s",
            rtt, self.smoothed_rtt, self.rtt_variation, self.retransmission_timeout
        );
    }

    /// a packet was lost: back the timeout off exponentially and restart variation tracking
    pub fn on_loss(&mut self) {
        self.smoothed_rtt = (self.smoothed_rtt * 2.0).clamp(MIN_RTO, MAX_RTO);
        self.retransmission_timeout = self.smoothed_rtt;
        self.rtt_variation = 0.0;
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_first_sample_initializes() {
        let mut rtt = RttEstimator::new();
        rtt.on_ack_sample(0.2);

        assert_eq!(rtt.smoothed_rtt(), 0.2);
        assert_eq!(rtt.rtt_variation(), 0.1);
        // 1 + 2 * (0.2 + 0.1) = 1.6s
        assert!((rtt.rto().as_secs_f32() - 1.6).abs() < 1e-3);
    }

    #[test]
    fn test_subsequent_samples_blend() {
        let mut rtt = RttEstimator::new();
        rtt.on_ack_sample(0.2);
        rtt.on_ack_sample(0.4);

        // rttvar = 0.75 * 0.1 + 0.25 * |0.2 - 0.4| = 0.125
        assert!((rtt.rtt_variation() - 0.125).abs() < 1e-4);
        // srtt = 0.875 * 0.2 + 0.125 * 0.4 = 0.225
        assert!((rtt.smoothed_rtt() - 0.225).abs() < 1e-4);
    }

    #[rstest]
    #[case::tiny_rtt(0.001)]
    #[case::lan_rtt(0.01)]
    fn test_rto_floor(#[case] sample: f32) {
        let mut rtt = RttEstimator::new();
        rtt.on_ack_sample(sample);
        assert!(rtt.rto() >= Duration::from_secs(1));
    }

    #[test]
    fn test_rto_ceiling() {
        let mut rtt = RttEstimator::new();
        rtt.on_ack_sample(10.0);
        assert_eq!(rtt.rto(), Duration::from_secs(5));
    }

    #[test]
    fn test_consecutive_losses_stay_bounded() {
        let mut rtt = RttEstimator::new();
        rtt.on_ack_sample(0.05);

        for _ in 0..50 {
            rtt.on_loss();
        }

        assert!(rtt.smoothed_rtt() <= 5.0);
        assert!(rtt.rto() <= Duration::from_secs(5));
        assert!(rtt.rto() >= Duration::from_secs(1));
        assert_eq!(rtt.rtt_variation(), 0.0);
    }

    #[test]
    fn test_loss_doubles_timeout() {
        let mut rtt = RttEstimator::new();
        rtt.on_ack_sample(0.05);

        rtt.on_loss();
        // smoothed rtt 0.05 doubled is below the floor, so it clamps to 1s
        assert_eq!(rtt.smoothed_rtt(), 1.0);
        assert_eq!(rtt.rto(), Duration::from_secs(1));

        rtt.on_loss();
        assert_eq!(rtt.rto(), Duration::from_secs(2));
        rtt.on_loss();
        assert_eq!(rtt.rto(), Duration::from_secs(4));
        rtt.on_loss();
        assert_eq!(rtt.rto(), Duration::from_secs(5));
    }
}
