use std::time::Duration;
use tokio::time::Instant;

/// A one-shot timer that is polled rather than awaited. The worker loop runs on a fixed
///  cadence anyway, so the protocol timers (update tick, ping interval, stats refresh) are
///  cheapest as plain deadline checks against the runtime clock.
pub struct PolledTimer {
    alarm: Option<Instant>,
}

impl PolledTimer {
    pub fn new() -> PolledTimer {
        PolledTimer { alarm: None }
    }

    pub fn start(&mut self, duration: Duration) {
        self.alarm = Some(Instant::now() + duration);
    }

    pub fn stop(&mut self) {
        self.alarm = None;
    }

    pub fn is_running(&self) -> bool {
        self.alarm.is_some()
    }

    /// tests whether the timer has gone off, resetting it if so
    pub fn test(&mut self) -> bool {
        match self.alarm {
            Some(alarm) if Instant::now() >= alarm => {
                self.alarm = None;
                true
            }
            _ => false,
        }
    }

    pub fn triggered_or_not_running(&mut self) -> bool {
        self.test() || !self.is_running()
    }
}

impl Default for PolledTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    #[tokio::test(start_paused = true)]
    async fn test_elapses_once() {
        let mut timer = PolledTimer::new();
        timer.start(Duration::from_millis(50));
        assert!(timer.is_running());
        assert!(!timer.test());

        time::sleep(Duration::from_millis(60)).await;
        assert!(timer.test());

        // one-shot: a second poll does not trigger again
        assert!(!timer.test());
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggered_or_not_running() {
        let mut timer = PolledTimer::new();
        assert!(timer.triggered_or_not_running());

        timer.start(Duration::from_millis(50));
        assert!(!timer.triggered_or_not_running());

        time::sleep(Duration::from_millis(60)).await;
        assert!(timer.triggered_or_not_running());
        assert!(timer.triggered_or_not_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop() {
        let mut timer = PolledTimer::new();
        timer.start(Duration::from_millis(50));
        timer.stop();

        time::sleep(Duration::from_millis(60)).await;
        assert!(!timer.test());
    }
}
