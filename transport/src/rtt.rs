use std::cmp::max;
use std::time::Duration;
use crate::config::ReliableConfig;

/// Round-trip time estimation as an exponential moving average with weight 1/8 for each new
///  sample, in whole milliseconds.
///
/// The remainder of each integer division is carried into the next update, so a constant
///  series of samples is reached exactly from either side.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    ave_rtt_millis: u64,
    remainder: u64,
    last_rtt: Duration,
    num_samples: u64,
}

impl RttEstimator {
    const WEIGHT: u64 = 8;

    pub fn new(initial_rtt: Duration) -> RttEstimator {
        RttEstimator {
            ave_rtt_millis: max(initial_rtt.as_millis() as u64, 1),
            remainder: 0,
            last_rtt: initial_rtt,
            num_samples: 0,
        }
    }

    pub fn update(&mut self, sample: Duration) {
        let sample_millis = max(sample.as_millis() as u64, 1);

        if self.num_samples == 0 {
            // the configured initial value is a guess, the first real sample replaces it
            self.ave_rtt_millis = sample_millis;
            self.remainder = 0;
        }
        else {
            let total = (Self::WEIGHT - 1) * self.ave_rtt_millis + self.remainder + sample_millis;
            self.ave_rtt_millis = total / Self::WEIGHT;
            self.remainder = total % Self::WEIGHT;
        }

        self.num_samples += 1;
        self.last_rtt = sample;
    }

    pub fn ave_rtt(&self) -> Duration {
        Duration::from_millis(self.ave_rtt_millis)
    }

    pub fn last_rtt(&self) -> Duration {
        self.last_rtt
    }

    pub fn num_samples(&self) -> u64 {
        self.num_samples
    }

    /// retransmission timeout: a multiple of the average RTT, clamped to the configured bounds
    pub fn rto(&self, config: &ReliableConfig) -> Duration {
        (self.ave_rtt() * config.rto_rtt_factor)
            .clamp(config.min_rto, config.max_rto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_first_sample_replaces_initial() {
        let mut rtt = RttEstimator::new(Duration::from_secs(1));
        assert_eq!(rtt.ave_rtt(), Duration::from_secs(1));

        rtt.update(Duration::from_millis(40));
        assert_eq!(rtt.ave_rtt(), Duration::from_millis(40));
        assert_eq!(rtt.last_rtt(), Duration::from_millis(40));
        assert_eq!(rtt.num_samples(), 1);
    }

    #[rstest]
    #[case::from_below(1, 10)]
    #[case::from_above(100, 10)]
    #[case::same(10, 10)]
    #[case::big_step(1, 5000)]
    fn test_converges_without_truncation_bias(#[case] first: u64, #[case] steady: u64) {
        let mut rtt = RttEstimator::new(Duration::from_secs(1));
        rtt.update(Duration::from_millis(first));
        for _ in 0..200 {
            rtt.update(Duration::from_millis(steady));
        }
        assert_eq!(rtt.ave_rtt(), Duration::from_millis(steady));
    }

    #[test]
    fn test_zero_sample_counts_as_one_milli() {
        let mut rtt = RttEstimator::new(Duration::from_secs(1));
        rtt.update(Duration::ZERO);
        assert_eq!(rtt.ave_rtt(), Duration::from_millis(1));
    }

    #[rstest]
    #[case::floor(10, Duration::from_millis(500))]
    #[case::inside(400, Duration::from_millis(1200))]
    #[case::ceiling(100_000, Duration::from_secs(60))]
    fn test_rto(#[case] ave_millis: u64, #[case] expected: Duration) {
        let mut config = ReliableConfig::default();
        config.min_rto = Duration::from_millis(500);
        config.max_rto = Duration::from_secs(60);
        config.rto_rtt_factor = 3;

        let mut rtt = RttEstimator::new(Duration::from_secs(1));
        rtt.update(Duration::from_millis(ave_millis));
        assert_eq!(rtt.rto(&config), expected);
    }
}
