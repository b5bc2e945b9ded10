use crate::time::Duration;

/// Minimum retransmission timeout in the normal delay mode.
pub(crate) const MIN_RTO_NORMAL: Duration = Duration::from_millis(100);
/// Minimum retransmission timeout in the low-delay modes.
pub(crate) const MIN_RTO_NODELAY: Duration = Duration::from_millis(30);

const DEFAULT_RTO: u32 = 200;
const MAX_RTO: u32 = 60_000;

/// A smoothed round-trip-time estimator.
///
/// Keeps the classic smoothed-RTT and RTT-variance pair, updated from the
/// echoed send timestamps of incoming acknowledgements, and derives the
/// retransmission timeout from them. The timeout is clamped between a
/// configurable floor (lowered in the low-delay modes) and a fixed ceiling.
#[derive(Debug)]
pub(crate) struct RttEstimator {
    srtt: u32,
    rttval: u32,
    rto: u32,
    min_rto: Duration,
}

impl RttEstimator {
    pub fn new() -> RttEstimator {
        RttEstimator {
            srtt: 0,
            rttval: 0,
            rto: DEFAULT_RTO,
            min_rto: MIN_RTO_NORMAL,
        }
    }

    /// Return the current retransmission timeout.
    pub fn rto(&self) -> Duration {
        Duration::from_millis(self.rto as u64)
    }

    /// Set the retransmission timeout floor.
    pub fn set_min_rto(&mut self, min_rto: Duration) {
        self.min_rto = min_rto;
    }

    /// Fold one round-trip-time measurement into the estimate.
    ///
    /// `flush_interval` bounds the variance term from below so that the
    /// timeout never undercuts the granularity the session is driven at.
    pub fn sample(&mut self, rtt: u32, flush_interval: Duration) {
        if self.srtt == 0 {
            self.srtt = rtt;
            self.rttval = rtt / 2;
        } else {
            let delta = rtt.abs_diff(self.srtt);
            self.rttval = (3 * self.rttval + delta) / 4;
            self.srtt = ((7 * self.srtt + rtt) / 8).max(1);
        }
        let interval = flush_interval.total_millis() as u32;
        let rto = self.srtt + interval.max(4 * self.rttval);
        self.rto = rto.clamp(self.min_rto.total_millis() as u32, MAX_RTO);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(100);

    #[test]
    fn test_first_sample() {
        let mut rtt = RttEstimator::new();
        assert_eq!(rtt.rto(), Duration::from_millis(200));

        rtt.sample(100, INTERVAL);
        // srtt = 100, rttval = 50, rto = 100 + max(100, 200)
        assert_eq!(rtt.rto(), Duration::from_millis(300));
    }

    #[test]
    fn test_smoothing() {
        let mut rtt = RttEstimator::new();
        rtt.sample(100, INTERVAL);
        rtt.sample(200, INTERVAL);
        // srtt = (7*100 + 200)/8 = 112, rttval = (3*50 + 100)/4 = 62
        assert_eq!(rtt.rto(), Duration::from_millis(112 + 4 * 62));
    }

    #[test]
    fn test_floor() {
        let mut rtt = RttEstimator::new();
        rtt.sample(1, Duration::from_millis(10));
        assert_eq!(rtt.rto(), MIN_RTO_NORMAL);

        rtt.set_min_rto(MIN_RTO_NODELAY);
        rtt.sample(1, Duration::from_millis(10));
        assert_eq!(rtt.rto(), MIN_RTO_NODELAY);
    }

    #[test]
    fn test_ceiling() {
        let mut rtt = RttEstimator::new();
        rtt.sample(100_000, INTERVAL);
        assert_eq!(rtt.rto(), Duration::from_millis(60_000));
    }
}
