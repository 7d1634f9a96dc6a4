//! Flow control that adapts the window to what the path and the receiver actually sustain.
//!
//! The primary signal is the rate at which ACKs arrive: the average period between recent ACK
//!  events is compared to the fastest period seen so far. Getting faster means there is room,
//!  and the window grows. Getting slower is inconclusive by itself, so the RTT trend is
//!  consulted as well: a rising RTT means queues are building up somewhere, and the window
//!  shrinks.
//!
//! Losses are the second signal. Isolated holes are normal on a lossy link, but a run of
//!  several consecutive holes in a single ACK is treated as congestion. An ACK that
//!  acknowledges nothing at all is the strongest congestion signal.
//!
//! *Tension* accumulates congestion evidence and damps growth: the higher it is, the smaller
//!  the steps upward and the bigger the steps downward.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, trace};
use crate::flow_control::{clamp_rwindow, FlowControl};
use crate::seq_num::SeqNum;

const MAX_TENSION: u32 = 8;
/// consecutive holes in a single ACK that count as congestion
const CONGESTION_HOLE_RUN: u32 = 3;
/// number of ACK event timestamps the average ACK period is calculated from
const ACK_HISTORY: usize = 8;
const TAKE_A_CHANCE_AFTER: u32 = 4;
/// fixed-point scale of the RTT increase signal
const RTT_SCALE: u64 = 1000;
/// RTT increase (scaled by [RTT_SCALE]) from which the window backs off
const BACKOFF_RTT_INCREASE: u64 = 500;

#[derive(Debug)]
pub struct AdaptiveFlowControl {
    rwindow: u32,
    tension: u32,
    fast_mode: bool,

    fastest_period: Option<Duration>,
    fast_threshold: Duration,
    slow_threshold: Duration,
    take_a_chance: u32,
    next_change_allowed: Option<Instant>,
    ack_times: VecDeque<Instant>,

    event_time: Option<Instant>,
    acked_in_event: u32,
    current_hole_run: u32,
    longest_hole_run: u32,
}

impl AdaptiveFlowControl {
    pub fn new(initial_rwindow: u32) -> AdaptiveFlowControl {
        AdaptiveFlowControl {
            rwindow: initial_rwindow,
            tension: 0,
            fast_mode: false,
            fastest_period: None,
            fast_threshold: Duration::ZERO,
            slow_threshold: Duration::ZERO,
            take_a_chance: 0,
            next_change_allowed: None,
            ack_times: VecDeque::with_capacity(ACK_HISTORY + 1),
            event_time: None,
            acked_in_event: 0,
            current_hole_run: 0,
            longest_hole_run: 0,
        }
    }

    pub fn tension(&self) -> u32 {
        self.tension
    }

    pub fn is_fast_mode(&self) -> bool {
        self.fast_mode
    }

    fn average_ack_period(&self) -> Option<Duration> {
        if self.ack_times.len() < 2 {
            return None;
        }
        let first = *self.ack_times.front()?;
        let last = *self.ack_times.back()?;
        Some((last - first) / (self.ack_times.len() as u32 - 1))
    }

    /// Relative RTT increase of the last sample over the average, scaled by [RTT_SCALE] and
    ///  damped by tension:
    ///
    /// ```ascii
    ///  (last - ave) * RTT_SCALE * (MAX_TENSION + 1)
    ///  --------------------------------------------
    ///        ave * (MAX_TENSION + 1 + tension)
    /// ```
    fn rtt_increase(ave_rtt: Duration, last_rtt: Duration, tension: u32) -> u64 {
        if last_rtt <= ave_rtt {
            return 0;
        }
        let ave_millis = (ave_rtt.as_millis() as u64).max(1);
        let delta_millis = (last_rtt - ave_rtt).as_millis() as u64;

        let numerator = delta_millis * RTT_SCALE * (MAX_TENSION as u64 + 1);
        let denominator = ave_millis * (MAX_TENSION as u64 + 1 + tension as u64);
        numerator / denominator
    }

    fn on_acks(&mut self, ave_rtt: Duration, last_rtt: Duration) {
        let Some(period) = self.average_ack_period() else {
            trace!("no ACK period yet");
            if self.tension < MAX_TENSION {
                self.rwindow += 1;
            }
            return;
        };

        if self.fastest_period.map_or(true, |fastest| period < fastest) {
            trace!("ACK period {:?} is the fastest so far", period);
            self.fastest_period = Some(period);
            self.tension = self.tension.saturating_sub(1);
            self.fast_threshold = period + period / 4;
            self.slow_threshold = period * 2;
            self.rwindow += (MAX_TENSION - self.tension).clamp(1, MAX_TENSION);
            self.fast_mode = true;
            self.take_a_chance = 0;
            return;
        }

        let rtt_increase = Self::rtt_increase(ave_rtt, last_rtt, self.tension);
        if rtt_increase >= BACKOFF_RTT_INCREASE {
            debug!("RTT increase signal {} - backing off", rtt_increase);
            self.rwindow = self.rwindow.saturating_sub(1 + self.tension / 4);
            self.tension = (self.tension + 1).min(MAX_TENSION);
            self.fast_mode = false;
            self.take_a_chance = 0;
            return;
        }

        if period > self.slow_threshold {
            // slow, but the RTT does not get worse: the bottleneck may have moved, so after
            //  some confirmations we relax and try again
            self.fast_mode = false;
            self.take_a_chance += 1;
            if self.take_a_chance >= TAKE_A_CHANCE_AFTER {
                trace!("taking a chance");
                self.take_a_chance = 0;
                self.tension = self.tension.saturating_sub(1);
                self.rwindow += 1;
            }
        }
        else if period <= self.fast_threshold {
            if self.tension < MAX_TENSION / 2 {
                self.rwindow += 1;
            }
        }
        else {
            self.take_a_chance += 1;
            if self.take_a_chance >= TAKE_A_CHANCE_AFTER {
                self.take_a_chance = 0;
                self.tension = self.tension.saturating_sub(1);
            }
            if self.tension < MAX_TENSION / 2 {
                self.rwindow += 1;
            }
        }
    }
}

impl FlowControl for AdaptiveFlowControl {
    fn ack_event_begin(&mut self, now: Instant) {
        self.event_time = Some(now);
        self.acked_in_event = 0;
        self.current_hole_run = 0;
        self.longest_hole_run = 0;
    }

    fn packet_acked(&mut self, _seq: SeqNum) {
        self.acked_in_event += 1;
        self.current_hole_run = 0;
    }

    fn packet_missing(&mut self, _seq: SeqNum) {
        self.current_hole_run += 1;
        self.longest_hole_run = self.longest_hole_run.max(self.current_hole_run);
    }

    #[instrument]
    fn ack_event_end(&mut self, remote_queue_size: u32, ave_rtt: Duration, last_rtt: Duration) -> u32 {
        let now = self.event_time.unwrap_or_else(Instant::now);

        if self.acked_in_event > 0 {
            self.ack_times.push_back(now);
            while self.ack_times.len() > ACK_HISTORY {
                self.ack_times.pop_front();
            }
        }
        else {
            self.tension = MAX_TENSION;
        }

        let old_rwindow = self.rwindow;

        if self.next_change_allowed.map_or(false, |t| now < t) {
            trace!("window change cooldown");
        }
        else if self.longest_hole_run >= CONGESTION_HOLE_RUN {
            debug!("{} consecutive holes - shrinking", self.longest_hole_run);
            self.rwindow = self.rwindow.saturating_sub(2 + self.rwindow / 4);
            self.tension = (self.tension + 2).min(MAX_TENSION);
            self.fast_mode = false;
        }
        else if self.acked_in_event == 0 {
            debug!("nothing acknowledged - shrinking");
            self.rwindow = self.rwindow.saturating_sub(1);
            self.fast_mode = false;
        }
        else {
            self.on_acks(ave_rtt, last_rtt);
        }

        self.rwindow = clamp_rwindow(self.rwindow, remote_queue_size);

        if self.rwindow != old_rwindow {
            let cooldown = if self.fast_mode { last_rtt } else { ave_rtt * 2 };
            self.next_change_allowed = Some(now + cooldown);
            debug!("rwindow {} -> {} (tension {}, fast mode {})", old_rwindow, self.rwindow, self.tension, self.fast_mode);
        }

        self.rwindow
    }

    fn rwindow(&self) -> u32 {
        self.rwindow
    }
}
