use std::time::Duration;
use anyhow::bail;
use crate::adaptive_flow_control::AdaptiveFlowControl;
use crate::flow_control::{FixedFlowControl, FlowControl};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlKind {
    /// constant window, mainly useful as a baseline and for testing
    Fixed { rwindow: u32 },
    /// window adapts to the observed ACK rate, RTT and losses
    Adaptive { initial_rwindow: u32 },
}

/// Configuration shared by both directions of a reliable stream pair. Both peers are expected
///  to use compatible values, in particular for `max_queue_size`.
#[derive(Debug, Clone)]
pub struct ReliableConfig {
    /// Maximum number of payload bytes per chunk, i.e. per carrier message. Writes are
    ///  accumulated until a chunk is full (or the stream is flushed).
    pub chunk_size: usize,

    /// This is the maximum number of chunks a receiver buffers, and the bound for the number
    ///  of selective ACKs in a single ACK message. The sender uses it as the remote queue size
    ///  that limits its window.
    pub max_queue_size: u32,

    /// RTT assumed before the first sample is available
    pub initial_rtt: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
    /// RTO = average RTT * this factor (clamped to `min_rto..=max_rto`)
    pub rto_rtt_factor: u32,

    /// time a closed output stream keeps retransmitting unacknowledged chunks before it gives up
    pub close_linger: Duration,

    /// `None` means blocking reads wait indefinitely
    pub read_timeout: Option<Duration>,

    /// A writer waiting for room in the retransmission queue re-checks at least this often
    pub backpressure_poll_interval: Duration,

    /// minimum interval between two unsolicited ACKs a receiver sends to request retransmission
    ///  of a missing chunk
    pub retransmission_request_cooldown: Duration,

    pub flow_control: FlowControlKind,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        ReliableConfig {
            chunk_size: 63 * 1024,
            max_queue_size: 100,
            initial_rtt: Duration::from_secs(1),
            min_rto: Duration::from_millis(500),
            max_rto: Duration::from_secs(60),
            rto_rtt_factor: 3,
            close_linger: Duration::from_secs(120),
            read_timeout: None,
            backpressure_poll_interval: Duration::from_secs(1),
            retransmission_request_cooldown: Duration::from_millis(250),
            flow_control: FlowControlKind::Adaptive { initial_rwindow: 2 },
        }
    }
}

impl ReliableConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk size must be positive");
        }
        if self.max_queue_size < 2 {
            bail!("max queue size must be at least 2, was {}", self.max_queue_size);
        }
        if self.min_rto.is_zero() || self.min_rto > self.max_rto {
            bail!("RTO bounds are inconsistent: {:?}..{:?}", self.min_rto, self.max_rto);
        }
        if self.rto_rtt_factor == 0 {
            bail!("RTO factor must be positive");
        }
        if self.backpressure_poll_interval.is_zero() {
            bail!("backpressure poll interval must be positive");
        }

        let rwindow = match self.flow_control {
            FlowControlKind::Fixed { rwindow } => rwindow,
            FlowControlKind::Adaptive { initial_rwindow } => initial_rwindow,
        };
        if rwindow < 2 || rwindow > self.max_queue_size {
            bail!("flow control window {} is outside of 2..={}", rwindow, self.max_queue_size);
        }

        Ok(())
    }

    pub fn create_flow_control(&self) -> Box<dyn FlowControl> {
        match self.flow_control {
            FlowControlKind::Fixed { rwindow } => Box::new(FixedFlowControl::new(rwindow)),
            FlowControlKind::Adaptive { initial_rwindow } => Box::new(AdaptiveFlowControl::new(initial_rwindow)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(ReliableConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case::zero_chunk(|c: &mut ReliableConfig| c.chunk_size = 0)]
    #[case::tiny_queue(|c: &mut ReliableConfig| c.max_queue_size = 1)]
    #[case::zero_min_rto(|c: &mut ReliableConfig| c.min_rto = Duration::ZERO)]
    #[case::inverted_rto(|c: &mut ReliableConfig| c.max_rto = Duration::from_millis(1))]
    #[case::zero_factor(|c: &mut ReliableConfig| c.rto_rtt_factor = 0)]
    #[case::zero_poll(|c: &mut ReliableConfig| c.backpressure_poll_interval = Duration::ZERO)]
    #[case::window_too_small(|c: &mut ReliableConfig| c.flow_control = FlowControlKind::Fixed { rwindow: 1 })]
    #[case::window_too_big(|c: &mut ReliableConfig| c.flow_control = FlowControlKind::Adaptive { initial_rwindow: 101 })]
    fn test_invalid(#[case] modify: fn(&mut ReliableConfig)) {
        let mut config = ReliableConfig::default();
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::fixed(FlowControlKind::Fixed { rwindow: 17 }, 17)]
    #[case::adaptive(FlowControlKind::Adaptive { initial_rwindow: 5 }, 5)]
    fn test_create_flow_control(#[case] kind: FlowControlKind, #[case] expected_rwindow: u32) {
        let config = ReliableConfig { flow_control: kind, ..ReliableConfig::default() };
        assert_eq!(config.create_flow_control().rwindow(), expected_rwindow);
    }
}
