use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// initial datagram send rate at connection start, in datagrams per second
pub const INITIAL_DATAGRAM_SEND_RATE: f32 = 70.0;

/// nominal bandwidth ceiling the additive increase converges towards, in datagrams per second
const TOTAL_ESTIMATED_BANDWIDTH: f32 = 50.0;

const ADDITIVE_INCREASE_AGGRESSIVENESS: f32 = 5e-2;

/// length of one flow control frame
const FRAME_LENGTH: Duration = Duration::from_millis(10);

/// single sporadic losses within a frame do not trigger a rate decrease
const LOSS_THRESHOLD_PER_FRAME: u32 = 5;

/// Adaptive send-rate regulation: additive increase towards a nominal bandwidth estimate,
///  multiplicative decrease on observed packet loss, plus the pacing state deciding when the
///  next datagram may go out.
pub struct FlowControl {
    datagram_send_rate: f32,
    /// the lowest rate snapshot among the packets lost since the last additive step; the
    ///  reference point for multiplicative decrease
    lowest_send_rate_on_loss: f32,
    num_acks_this_frame: u32,
    num_losses_this_frame: u32,
    last_frame_time: Instant,
    last_datagram_send_time: Instant,
}

impl FlowControl {
    pub fn new(now: Instant) -> FlowControl {
        FlowControl {
            datagram_send_rate: INITIAL_DATAGRAM_SEND_RATE,
            lowest_send_rate_on_loss: INITIAL_DATAGRAM_SEND_RATE,
            num_acks_this_frame: 0,
            num_losses_this_frame: 0,
            last_frame_time: now,
            last_datagram_send_time: now,
        }
    }

    pub fn rate(&self) -> f32 {
        self.datagram_send_rate
    }

    /// a first-attempt packet was acked
    pub fn on_ack(&mut self) {
        self.num_acks_this_frame += 1;
    }

    /// a reliable packet timed out; `rate_at_send` is the rate snapshot stored when it went
    ///  out
    pub fn on_loss(&mut self, rate_at_send: f32) {
        self.lowest_send_rate_on_loss = self.lowest_send_rate_on_loss.min(rate_at_send);
        self.num_losses_this_frame += 1;
    }

    /// The periodic rate adjustment. Counts whole 10 ms frames since the last adjustment
    ///  (capped at 100) and applies multiplicative decrease under loss, additive increase
    ///  otherwise.
    pub fn handle_frame_tick(&mut self, now: Instant) {
        let num_frames = (now.saturating_duration_since(self.last_frame_time).as_nanos()
            / FRAME_LENGTH.as_nanos()) as u64;
        if num_frames == 0 {
            return;
        }
        let capped_frames = num_frames.min(100);

        if self.num_losses_this_frame > LOSS_THRESHOLD_PER_FRAME {
            let old_rate = self.datagram_send_rate;
            self.datagram_send_rate = self
                .datagram_send_rate
                .min((self.lowest_send_rate_on_loss * 0.9).max(1.0));
            debug!(
                "{} losses this frame: send rate backed off from {:.2} to {:.2}",
                self.num_losses_this_frame, old_rate, self.datagram_send_rate
            );
        }
        else {
            let increment = (capped_frames as f32
                * ADDITIVE_INCREASE_AGGRESSIVENESS
                * (TOTAL_ESTIMATED_BANDWIDTH - self.datagram_send_rate))
                .min(1.0);
            self.datagram_send_rate =
                (self.datagram_send_rate + increment).min(TOTAL_ESTIMATED_BANDWIDTH);
            self.lowest_send_rate_on_loss = self.datagram_send_rate;
            trace!("send rate incremented by {:.2} to {:.2}", increment, self.datagram_send_rate);
        }

        self.num_acks_this_frame = 0;
        self.num_losses_this_frame = 0;

        if num_frames < 100 {
            self.last_frame_time += FRAME_LENGTH * capped_frames as u32;
        }
        else {
            // after a long gap, snap to now instead of accumulating frame-length drift
            self.last_frame_time = now;
        }
    }

    fn send_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.datagram_send_rate as f64)
    }

    /// pacing gate: a datagram may go out once a full send interval has passed since the
    ///  (virtual) last send time
    pub fn can_send(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_datagram_send_time) >= self.send_interval()
    }

    pub fn time_until_can_send(&self, now: Instant) -> Duration {
        let next = self.last_datagram_send_time + self.send_interval();
        next.saturating_duration_since(now)
    }

    /// Advances the pacing clock by one send interval. If 20 or more intervals have already
    ///  elapsed, the clock snaps to now - idle periods must not accumulate unbounded send
    ///  credit.
    pub fn on_datagram_sent(&mut self, now: Instant) {
        let interval = self.send_interval();
        let elapsed_intervals =
            now.saturating_duration_since(self.last_datagram_send_time).as_nanos() / interval.as_nanos().max(1);

        if elapsed_intervals < 20 {
            self.last_datagram_send_time += interval;
        }
        else {
            self.last_datagram_send_time = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    #[tokio::test(start_paused = true)]
    async fn test_additive_increase_converges_to_ceiling() {
        let mut flow = FlowControl::new(Instant::now());
        assert_eq!(flow.rate(), INITIAL_DATAGRAM_SEND_RATE);

        // starting above the ceiling, the first additive step pulls the rate down to it
        time::sleep(Duration::from_millis(10)).await;
        flow.handle_frame_tick(Instant::now());
        assert_eq!(flow.rate(), TOTAL_ESTIMATED_BANDWIDTH);

        for _ in 0..100 {
            time::sleep(Duration::from_millis(10)).await;
            flow.handle_frame_tick(Instant::now());
        }
        assert!(flow.rate() <= TOTAL_ESTIMATED_BANDWIDTH);
        assert!(flow.rate() > TOTAL_ESTIMATED_BANDWIDTH - 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_additive_increase_from_below() {
        let mut flow = FlowControl::new(Instant::now());
        flow.datagram_send_rate = 10.0;
        flow.lowest_send_rate_on_loss = 10.0;

        time::sleep(Duration::from_millis(10)).await;
        flow.handle_frame_tick(Instant::now());

        // one frame: increment = min(1 * 0.05 * (50 - 10), 1) = 1
        assert!((flow.rate() - 11.0).abs() < 1e-3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sporadic_losses_do_not_decrease() {
        let mut flow = FlowControl::new(Instant::now());
        flow.datagram_send_rate = 40.0;

        for _ in 0..LOSS_THRESHOLD_PER_FRAME {
            flow.on_loss(40.0);
        }
        time::sleep(Duration::from_millis(10)).await;
        flow.handle_frame_tick(Instant::now());

        assert!(flow.rate() >= 40.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multiplicative_decrease() {
        let mut flow = FlowControl::new(Instant::now());
        flow.datagram_send_rate = 40.0;
        flow.lowest_send_rate_on_loss = 40.0;

        for _ in 0..=LOSS_THRESHOLD_PER_FRAME {
            flow.on_loss(30.0);
        }
        time::sleep(Duration::from_millis(10)).await;
        flow.handle_frame_tick(Instant::now());

        // decreased to lowest-rate-on-loss * 0.9
        assert!((flow.rate() - 27.0).abs() < 1e-3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decrease_has_floor_of_one() {
        let mut flow = FlowControl::new(Instant::now());
        flow.datagram_send_rate = 2.0;

        for _ in 0..10 {
            flow.on_loss(0.5);
        }
        time::sleep(Duration::from_millis(10)).await;
        flow.handle_frame_tick(Instant::now());

        assert_eq!(flow.rate(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_anti_drift_snap_after_long_gap() {
        let mut flow = FlowControl::new(Instant::now());

        time::sleep(Duration::from_secs(2)).await;
        let now = Instant::now();
        flow.handle_frame_tick(now);
        assert_eq!(flow.last_frame_time, now);

        // a short gap advances by whole frames instead
        time::sleep(Duration::from_millis(25)).await;
        let now2 = Instant::now();
        flow.handle_frame_tick(now2);
        assert_eq!(flow.last_frame_time, now + Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing() {
        let mut flow = FlowControl::new(Instant::now());
        flow.datagram_send_rate = 100.0; // 10ms interval

        assert!(!flow.can_send(Instant::now()));
        time::sleep(Duration::from_millis(10)).await;
        assert!(flow.can_send(Instant::now()));

        flow.on_datagram_sent(Instant::now());
        assert!(!flow.can_send(Instant::now()));
        assert_eq!(flow.time_until_can_send(Instant::now()), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_credit_is_capped() {
        let mut flow = FlowControl::new(Instant::now());
        flow.datagram_send_rate = 100.0;

        // after a long idle period the send clock snaps to now instead of granting
        // 20+ intervals of burst credit
        time::sleep(Duration::from_secs(1)).await;
        let now = Instant::now();
        assert!(flow.can_send(now));
        flow.on_datagram_sent(now);
        assert_eq!(flow.last_datagram_send_time, now);
        assert!(!flow.can_send(now));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_accumulates_within_cap() {
        let mut flow = FlowControl::new(Instant::now());
        flow.datagram_send_rate = 100.0;

        time::sleep(Duration::from_millis(50)).await;
        let now = Instant::now();
        flow.on_datagram_sent(now);
        // within the credit cap, the clock advances by one interval and leaves credit
        assert!(flow.can_send(now));
    }
}
