use std::time::{Duration, Instant};

/// Rate limiting of outgoing datagrams to a fixed frequency.
///
/// Every send advances a virtual send time by exactly one period, so that small delays in waking
///  up do not reduce the effective rate. After a stall of more than one and a half periods, the
///  virtual send time jumps to the present instead of catching up with a burst.
pub struct Pacer {
    period: Duration,
    last_send: Option<Instant>,
}

impl Pacer {
    pub fn new(period: Duration) -> Pacer {
        Pacer {
            period,
            last_send: None,
        }
    }

    /// Time to wait before the next send opportunity, or `None` if it is now. The opportunity
    ///  opens a quarter period early.
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        let elapsed = self.elapsed(now)?;
        if elapsed < self.period * 3 / 4 {
            Some(self.period - elapsed)
        }
        else {
            None
        }
    }

    /// Claims the send opportunity at `now` if the rate allows it
    pub fn try_consume(&mut self, now: Instant) -> bool {
        let Some(elapsed) = self.elapsed(now) else {
            self.last_send = Some(now);
            return true;
        };

        if elapsed < self.period / 2 {
            return false;
        }

        if elapsed > self.period * 3 / 2 {
            self.last_send = Some(now);
        }
        else {
            self.last_send = self.last_send.map(|t| t + self.period);
        }
        true
    }

    fn elapsed(&self, now: Instant) -> Option<Duration> {
        self.last_send
            .map(|t| now.saturating_duration_since(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const PERIOD: Duration = Duration::from_millis(40);

    #[test]
    fn test_first_send_is_immediate() {
        let mut pacer = Pacer::new(PERIOD);
        let now = Instant::now();
        assert_eq!(pacer.timeout(now), None);
        assert!(pacer.try_consume(now));
        assert_eq!(pacer.timeout(now), Some(PERIOD));
    }

    #[rstest]
    #[case::just_sent(0, Some(40))]
    #[case::early(10, Some(30))]
    #[case::almost_three_quarters(29, Some(11))]
    #[case::three_quarters(30, None)]
    #[case::overdue(100, None)]
    fn test_timeout(#[case] elapsed_millis: u64, #[case] expected_millis: Option<u64>) {
        let mut pacer = Pacer::new(PERIOD);
        let start = Instant::now();
        pacer.try_consume(start);

        let timeout = pacer.timeout(start + Duration::from_millis(elapsed_millis));
        assert_eq!(timeout, expected_millis.map(Duration::from_millis));
    }

    #[test]
    fn test_too_early_is_refused() {
        let mut pacer = Pacer::new(PERIOD);
        let start = Instant::now();
        pacer.try_consume(start);

        assert!(!pacer.try_consume(start + Duration::from_millis(19)));
        assert!(pacer.try_consume(start + Duration::from_millis(20)));
    }

    #[test]
    fn test_drift_correction() {
        let mut pacer = Pacer::new(PERIOD);
        let start = Instant::now();
        pacer.try_consume(start);

        // waking up late does not shift the schedule
        assert!(pacer.try_consume(start + Duration::from_millis(45)));
        assert_eq!(pacer.timeout(start + Duration::from_millis(45)), Some(Duration::from_millis(35)));
    }

    #[test]
    fn test_resync_after_stall() {
        let mut pacer = Pacer::new(PERIOD);
        let start = Instant::now();
        pacer.try_consume(start);

        let late = start + Duration::from_millis(500);
        assert!(pacer.try_consume(late));
        assert!(!pacer.try_consume(late + Duration::from_millis(10)));
        assert_eq!(pacer.timeout(late), Some(PERIOD));
    }
}
