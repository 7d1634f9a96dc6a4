use std::fmt::Debug;
use std::time::Duration;
use tokio::time::Instant;
use crate::seq_num::SeqNum;

/// Lower bound for every window: with less than two chunks in flight, a single loss stalls the
///  stream for a full retransmission timeout
pub const MIN_RWINDOW: u32 = 2;

/// Decides how many unacknowledged chunks a sender may have in flight.
///
/// The sender reports each incoming ACK as one event:
///
/// ```ascii
/// ack_event_begin  (packet_acked | packet_missing)*  ack_event_end
/// ```
///
/// Acked and missing chunks are reported in ascending sequence order, which is what allows
///  strategies to detect runs of consecutive holes.
pub trait FlowControl: Send + Sync + Debug {
    fn ack_event_begin(&mut self, now: Instant);

    fn packet_acked(&mut self, seq: SeqNum);

    fn packet_missing(&mut self, seq: SeqNum);

    /// Finishes an ACK event and returns the window to use from now on. The result is always
    ///  in `[MIN_RWINDOW, remote_queue_size]` (or exactly `MIN_RWINDOW` if the remote queue is
    ///  smaller than that).
    fn ack_event_end(&mut self, remote_queue_size: u32, ave_rtt: Duration, last_rtt: Duration) -> u32;

    fn rwindow(&self) -> u32;
}

pub fn clamp_rwindow(rwindow: u32, remote_queue_size: u32) -> u32 {
    rwindow
        .min(remote_queue_size)
        .max(MIN_RWINDOW)
}

#[derive(Debug)]
pub struct FixedFlowControl {
    rwindow: u32,
}

impl FixedFlowControl {
    pub fn new(rwindow: u32) -> FixedFlowControl {
        FixedFlowControl {
            rwindow: rwindow.max(MIN_RWINDOW),
        }
    }
}

impl FlowControl for FixedFlowControl {
    fn ack_event_begin(&mut self, _now: Instant) {}

    fn packet_acked(&mut self, _seq: SeqNum) {}

    fn packet_missing(&mut self, _seq: SeqNum) {}

    fn ack_event_end(&mut self, remote_queue_size: u32, _ave_rtt: Duration, _last_rtt: Duration) -> u32 {
        clamp_rwindow(self.rwindow, remote_queue_size)
    }

    fn rwindow(&self) -> u32 {
        self.rwindow
    }
}
