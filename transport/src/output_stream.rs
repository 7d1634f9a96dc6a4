use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::ack::AckMessage;
use crate::config::ReliableConfig;
use crate::error::{TransportError, TransportResult};
use crate::flow_control::FlowControl;
use crate::message::{Message, MessageElement};
use crate::outgoing::Outgoing;
use crate::rtt::RttEstimator;
use crate::seq_num::SeqNum;

struct RetransmitEntry {
    seq: SeqNum,
    message: Message,
    enqueued_at: Instant,
    sent_at: Instant,
    /// number of retransmissions so far
    marks: u32,
}

impl RetransmitEntry {
    fn retransmit_copy(&mut self, now: Instant) -> Message {
        self.marks += 1;
        self.sent_at = now;

        let mut message = self.message.clone();
        message.add_element(MessageElement::retry_marker(self.marks));
        message
    }
}

enum ChunkKind {
    Data(Bytes),
    Close,
}

enum TickOutcome {
    Retransmit(Vec<Message>),
    Finished,
    Dead,
}

struct OutputStreamInner {
    last_seq: SeqNum,
    /// ordered by sequence number
    retransmit_queue: VecDeque<RetransmitEntry>,

    flow_control: Box<dyn FlowControl>,
    rwindow: u32,
    remote_free_queue_space: u32,

    rtt: RttEstimator,
    rto: Duration,
    highest_ack: SeqNum,
    last_ack_at: Instant,
    last_activity_at: Instant,
    retransmit_count: u64,

    local_closed: bool,
    linger_deadline: Option<Instant>,
    hard_closed: bool,
    dead_reason: Option<String>,
}

impl OutputStreamInner {
    fn new(config: &ReliableConfig) -> OutputStreamInner {
        let now = Instant::now();
        let flow_control = config.create_flow_control();
        let rtt = RttEstimator::new(config.initial_rtt);

        OutputStreamInner {
            last_seq: SeqNum::ZERO,
            retransmit_queue: VecDeque::new(),
            rwindow: flow_control.rwindow(),
            flow_control,
            remote_free_queue_space: config.max_queue_size,
            rto: rtt.rto(config),
            rtt,
            highest_ack: SeqNum::ZERO,
            last_ack_at: now,
            last_activity_at: now,
            retransmit_count: 0,
            local_closed: false,
            linger_deadline: None,
            hard_closed: false,
            dead_reason: None,
        }
    }

    fn check_open(&self) -> TransportResult<()> {
        if let Some(reason) = &self.dead_reason {
            return Err(TransportError::ConnectionDead(reason.clone()));
        }
        if self.hard_closed || self.local_closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// a window of n admits exactly n chunks in flight
    fn has_room(&self) -> bool {
        let limit = self.rwindow
            .min(self.remote_free_queue_space.saturating_mul(2))
            .max(1);
        self.retransmit_queue.len() < limit as usize
    }

    /// Chunks above the cumulative ACK that are no longer in the retransmission queue were
    ///  selectively acknowledged, i.e. they are buffered in the receiver's queue until the
    ///  receiver consumes them.
    fn estimate_remote_free_queue_space(&self, max_queue_size: u32) -> u32 {
        let unacked = u32::try_from(self.retransmit_queue.len()).unwrap_or(u32::MAX);
        let held_by_receiver = self.last_seq.to_raw()
            .saturating_sub(self.highest_ack.to_raw())
            .saturating_sub(unacked);
        max_queue_size.saturating_sub(held_by_receiver)
    }

    fn hard_close(&mut self, reason: Option<String>) {
        self.hard_closed = true;
        self.local_closed = true;
        self.retransmit_queue.clear();
        if reason.is_some() {
            self.dead_reason = reason;
        }
    }

    fn connection_failure(&self, outgoing: &dyn Outgoing, now: Instant) -> Option<String> {
        if let Some(oldest) = self.retransmit_queue.front() {
            let age = now.saturating_duration_since(oldest.enqueued_at);
            if age > outgoing.max_retry_age() {
                return Some(format!("chunk #{} unacknowledged for {:?}", oldest.seq, age));
            }
        }

        let idle = now.saturating_duration_since(outgoing.last_accessed());
        if idle > outgoing.idle_timeout() {
            return Some(format!("connection idle for {:?}", idle));
        }
        None
    }

    fn collect_retransmits(&mut self, now: Instant) -> Vec<Message> {
        let rto = self.rto;
        let mut result = Vec::new();

        // only the part of the queue that is inside the window is eligible
        for entry in self.retransmit_queue.iter_mut().take(self.rwindow as usize) {
            let threshold = if entry.marks == 0 { rto } else { rto * 2 };
            if now.saturating_duration_since(entry.sent_at) >= threshold {
                trace!("retransmitting chunk #{} (attempt {})", entry.seq, entry.marks + 1);
                result.push(entry.retransmit_copy(now));
            }
        }
        self.retransmit_count += result.len() as u64;
        result
    }

    fn adjust_rto(&mut self, config: &ReliableConfig, outgoing: &dyn Outgoing, now: Instant, timer_expired: bool) {
        if self.retransmit_queue.is_empty() {
            if now.saturating_duration_since(self.last_activity_at) >= outgoing.min_idle_reconnect_time() {
                let rto = self.rtt.rto(config);
                if rto != self.rto {
                    debug!("stream was idle - resetting RTO to {:?}", rto);
                    self.rto = rto;
                }
            }
        }
        else if timer_expired && now.saturating_duration_since(self.last_ack_at) >= self.rto {
            self.rto = (self.rto * 2).min(config.max_rto);
            debug!("no ACK received within RTO - backing off to {:?}", self.rto);
        }
    }
}

struct OutputShared {
    config: Arc<ReliableConfig>,
    outgoing: Arc<dyn Outgoing>,
    inner: Mutex<OutputStreamInner>,
    state_changed: Notify,
}

impl OutputShared {
    async fn emit(&self, kind: ChunkKind) -> TransportResult<()> {
        let message = loop {
            // registered before checking the state so that no notification can get lost
            let notified = self.state_changed.notified();
            {
                let mut inner = self.inner.lock().await;
                inner.check_open()?;

                if inner.has_room() {
                    let seq = inner.last_seq.next()?;
                    inner.last_seq = seq;

                    let element = match &kind {
                        ChunkKind::Data(data) => MessageElement::block(seq, data.clone()),
                        ChunkKind::Close => MessageElement::close(seq),
                    };
                    let message = Message::with_element(element);

                    let now = Instant::now();
                    inner.retransmit_queue.push_back(RetransmitEntry {
                        seq,
                        message: message.clone(),
                        enqueued_at: now,
                        sent_at: now,
                        marks: 0,
                    });
                    inner.last_activity_at = now;
                    trace!("enqueued chunk #{}, {} chunks in flight", seq, inner.retransmit_queue.len());
                    break message;
                }
            }

            trace!("retransmission queue is full - waiting");
            let _ = time::timeout(self.config.backpressure_poll_interval, notified).await;
        };

        self.state_changed.notify_waiters();

        match self.outgoing.send(message).await {
            Ok(()) => self.outgoing.set_last_accessed(Instant::now()),
            Err(e) => warn!("sending chunk failed, leaving it to retransmission: {}", e),
        }
        Ok(())
    }

    async fn send_all(&self, messages: Vec<Message>) {
        for message in messages {
            if let Err(e) = self.outgoing.send(message).await {
                warn!("retransmission failed, skipping the rest of this cycle: {}", e);
                break;
            }
        }
    }

    async fn hard_close(&self, reason: Option<String>) {
        self.inner.lock().await
            .hard_close(reason);
        self.state_changed.notify_waiters();
    }

    async fn ack_received(&self, ack: AckMessage) {
        let now = Instant::now();

        let fast_retransmits = {
            let mut inner = self.inner.lock().await;
            if inner.hard_closed {
                trace!("ACK for a closed stream - ignoring");
                return;
            }
            if ack.cumulative > inner.last_seq {
                warn!("ACK for chunk #{} which was never sent (highest #{}) - ignoring", ack.cumulative, inner.last_seq);
                return;
            }

            let cumulative = ack.cumulative.max(inner.highest_ack);
            inner.highest_ack = cumulative;
            inner.last_ack_at = now;
            inner.last_activity_at = now;

            // acked (true) and missing (false) chunks, in sequence order for flow control
            let mut events = BTreeMap::new();
            // (marks, sample) of the least retransmitted retired entry
            let mut rtt_sample: Option<(u32, Duration)> = None;
            let mut consider_sample = |entry: &RetransmitEntry| {
                let sample = now.saturating_duration_since(entry.sent_at);
                match rtt_sample {
                    Some((marks, _)) if marks < entry.marks => {}
                    _ => rtt_sample = Some((entry.marks, sample)),
                }
            };

            while inner.retransmit_queue.front().map_or(false, |e| e.seq <= cumulative) {
                if let Some(entry) = inner.retransmit_queue.pop_front() {
                    consider_sample(&entry);
                    events.insert(entry.seq, true);
                }
            }
            for &seq in &ack.selective {
                if let Ok(idx) = inner.retransmit_queue.binary_search_by_key(&seq, |e| e.seq) {
                    if let Some(entry) = inner.retransmit_queue.remove(idx) {
                        consider_sample(&entry);
                        events.insert(seq, true);
                    }
                }
            }

            if let Some((_, sample)) = rtt_sample {
                inner.rtt.update(sample);
            }
            let ave_rtt = inner.rtt.ave_rtt();
            let last_rtt = inner.rtt.last_rtt();
            inner.rto = inner.rtt.rto(&self.config);

            // retained entries below the highest selective ACK are holes at the receiver
            let mut fast_retransmits = Vec::new();
            if let Some(&highest_sack) = ack.selective.last() {
                for entry in inner.retransmit_queue.iter_mut() {
                    if entry.seq >= highest_sack {
                        break;
                    }
                    events.insert(entry.seq, false);
                    if now.saturating_duration_since(entry.sent_at) >= ave_rtt {
                        trace!("fast retransmit of chunk #{}", entry.seq);
                        fast_retransmits.push(entry.retransmit_copy(now));
                    }
                }
            }
            inner.retransmit_count += fast_retransmits.len() as u64;

            inner.remote_free_queue_space = inner.estimate_remote_free_queue_space(self.config.max_queue_size);

            inner.flow_control.ack_event_begin(now);
            for (seq, acked) in events {
                if acked {
                    inner.flow_control.packet_acked(seq);
                }
                else {
                    inner.flow_control.packet_missing(seq);
                }
            }
            inner.rwindow = inner.flow_control.ack_event_end(self.config.max_queue_size, ave_rtt, last_rtt);

            trace!("ACK #{} processed: {} chunks in flight, rwindow {}, RTO {:?}", cumulative, inner.retransmit_queue.len(), inner.rwindow, inner.rto);
            fast_retransmits
        };

        self.outgoing.set_last_accessed(now);
        self.state_changed.notify_waiters();
        self.send_all(fast_retransmits).await;
    }

    async fn on_retransmit_tick(&self, timer_expired: bool) -> TickOutcome {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        if inner.hard_closed {
            return TickOutcome::Finished;
        }
        if inner.local_closed && inner.retransmit_queue.is_empty() {
            debug!("stream is closed and all chunks are acknowledged");
            return TickOutcome::Finished;
        }
        if inner.linger_deadline.map_or(false, |deadline| now >= deadline) {
            warn!("close linger expired with {} unacknowledged chunks - discarding them", inner.retransmit_queue.len());
            inner.hard_close(None);
            drop(inner);
            self.state_changed.notify_waiters();
            return TickOutcome::Finished;
        }
        if let Some(reason) = inner.connection_failure(self.outgoing.as_ref(), now) {
            warn!("connection is dead: {}", reason);
            inner.hard_close(Some(reason));
            drop(inner);
            self.state_changed.notify_waiters();
            return TickOutcome::Dead;
        }

        let to_send = inner.collect_retransmits(now);
        inner.adjust_rto(&self.config, self.outgoing.as_ref(), now, timer_expired);
        TickOutcome::Retransmit(to_send)
    }
}

async fn retransmit_loop(shared: Arc<OutputShared>) {
    debug!("starting retransmission loop");
    loop {
        let notified = shared.state_changed.notified();
        let wait = {
            let inner = shared.inner.lock().await;
            match inner.linger_deadline {
                Some(deadline) => inner.rto.min(deadline.saturating_duration_since(Instant::now())),
                None => inner.rto,
            }
        };
        let timer_expired = time::timeout(wait, notified).await.is_err();

        match shared.on_retransmit_tick(timer_expired).await {
            TickOutcome::Retransmit(messages) => shared.send_all(messages).await,
            TickOutcome::Finished => break,
            TickOutcome::Dead => {
                shared.outgoing.close().await;
                break;
            }
        }
    }
    debug!("retransmission loop terminated");
}

/// The sending half of a reliable stream.
///
/// Bytes written to the stream are accumulated into chunks of `chunk_size` bytes, each of which
///  goes out as one sequence-numbered message. Every chunk stays in the retransmission queue
///  until the peer acknowledges it, and a background task retransmits chunks whose
///  acknowledgement is overdue. ACKs from the peer are fed in through [ReliableOutputStream::recv].
///
/// The number of chunks in flight is limited by the flow control window and by the free space
///  in the peer's receive queue: writers block while the limit is reached.
pub struct ReliableOutputStream {
    shared: Arc<OutputShared>,
    /// serializes writers and holds the bytes of the chunk that is currently being filled
    write_buffer: Mutex<BytesMut>,
    retransmitter: OnceLock<JoinHandle<()>>,
}

impl Drop for ReliableOutputStream {
    fn drop(&mut self) {
        if let Some(handle) = self.retransmitter.get() {
            handle.abort();
        }
    }
}

impl ReliableOutputStream {
    pub fn new(config: Arc<ReliableConfig>, outgoing: Arc<dyn Outgoing>) -> anyhow::Result<ReliableOutputStream> {
        config.validate()?;

        let inner = OutputStreamInner::new(&config);
        Ok(ReliableOutputStream {
            shared: Arc::new(OutputShared {
                config,
                outgoing,
                inner: Mutex::new(inner),
                state_changed: Notify::new(),
            }),
            write_buffer: Mutex::new(BytesMut::new()),
            retransmitter: OnceLock::new(),
        })
    }

    fn ensure_retransmitter(&self) {
        self.retransmitter.get_or_init(|| tokio::spawn(retransmit_loop(self.shared.clone())));
    }

    /// Checks that the stream is still open for the holder of the write buffer. Bytes that
    ///  were buffered when the stream was closed are discarded here if [Self::hard_close]
    ///  could not get hold of the buffer itself.
    async fn check_open(&self, buf: &mut BytesMut) -> TransportResult<()> {
        let result = self.shared.inner.lock().await
            .check_open();
        if result.is_err() {
            buf.clear();
        }
        result
    }

    /// a chunk that can not be emitted takes the rest of the buffer with it
    async fn emit_buffered(&self, buf: &mut BytesMut, kind: ChunkKind) -> TransportResult<()> {
        let result = self.shared.emit(kind).await;
        if result.is_err() {
            buf.clear();
        }
        result
    }

    pub async fn write(&self, mut data: &[u8]) -> TransportResult<()> {
        let mut buf = self.write_buffer.lock().await;
        self.check_open(&mut buf).await?;
        self.ensure_retransmitter();

        let chunk_size = self.shared.config.chunk_size;
        while !data.is_empty() {
            let len = (chunk_size - buf.len()).min(data.len());
            buf.put_slice(&data[..len]);
            data = &data[len..];

            if buf.len() >= chunk_size {
                let chunk = buf.split().freeze();
                self.emit_buffered(&mut buf, ChunkKind::Data(chunk)).await?;
            }
        }
        Ok(())
    }

    /// sends buffered bytes as a (short) chunk
    pub async fn flush(&self) -> TransportResult<()> {
        let mut buf = self.write_buffer.lock().await;
        self.check_open(&mut buf).await?;
        self.ensure_retransmitter();

        if !buf.is_empty() {
            let chunk = buf.split().freeze();
            self.emit_buffered(&mut buf, ChunkKind::Data(chunk)).await?;
        }
        Ok(())
    }

    /// Sends `message` as a chunk of its own, so that a receiver in listener mode gets it as
    ///  exactly one message. Buffered bytes are flushed first.
    ///
    /// NB: The message is not split, even if it is bigger than the configured chunk size
    pub async fn send_message(&self, message: Bytes) -> TransportResult<()> {
        let mut buf = self.write_buffer.lock().await;
        self.check_open(&mut buf).await?;
        self.ensure_retransmitter();

        if !buf.is_empty() {
            let chunk = buf.split().freeze();
            self.emit_buffered(&mut buf, ChunkKind::Data(chunk)).await?;
        }
        self.emit_buffered(&mut buf, ChunkKind::Data(message)).await
    }

    /// Flushes buffered data, marks the end of the stream and waits until the peer has
    ///  acknowledged everything. Unacknowledged chunks are retransmitted for the configured
    ///  linger period and discarded afterwards.
    ///
    /// Closing an already closed stream waits for the same condition.
    pub async fn close(&self) -> TransportResult<()> {
        {
            let mut buf = self.write_buffer.lock().await;
            let already_closed = {
                let inner = self.shared.inner.lock().await;
                if let Some(reason) = &inner.dead_reason {
                    buf.clear();
                    return Err(TransportError::ConnectionDead(reason.clone()));
                }
                if inner.hard_closed {
                    buf.clear();
                }
                inner.local_closed
            };

            if !already_closed {
                self.ensure_retransmitter();
                if !buf.is_empty() {
                    let chunk = buf.split().freeze();
                    self.emit_buffered(&mut buf, ChunkKind::Data(chunk)).await?;
                }
                self.emit_buffered(&mut buf, ChunkKind::Close).await?;

                let mut inner = self.shared.inner.lock().await;
                inner.local_closed = true;
                inner.linger_deadline = Some(Instant::now() + self.shared.config.close_linger);
                debug!("closing stream after chunk #{}", inner.last_seq);
            }
        }
        self.shared.state_changed.notify_waiters();

        loop {
            let notified = self.shared.state_changed.notified();
            let deadline = {
                let inner = self.shared.inner.lock().await;
                if inner.retransmit_queue.is_empty() || inner.hard_closed {
                    return match &inner.dead_reason {
                        Some(reason) => Err(TransportError::ConnectionDead(reason.clone())),
                        None => Ok(()),
                    };
                }
                inner.linger_deadline
            };

            match deadline {
                Some(deadline) => {
                    if time::timeout_at(deadline, notified).await.is_err() {
                        warn!("close linger expired with unacknowledged chunks - discarding them");
                        self.shared.hard_close(None).await;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// discards all queued and buffered data and stops retransmission immediately
    pub async fn hard_close(&self) {
        debug!("hard close");
        self.shared.hard_close(None).await;
        if let Some(handle) = self.retransmitter.get() {
            handle.abort();
        }
        // a writer holding the buffer clears it when it sees the closed stream
        if let Ok(mut buf) = self.write_buffer.try_lock() {
            buf.clear();
        }
    }

    /// Handles a message from the peer. Messages without an ACK element are ignored, and so
    ///  are malformed ACKs.
    pub async fn recv(&self, message: &Message) {
        match AckMessage::from_message(message) {
            None => trace!("message without ACK - ignoring"),
            Some(Err(e)) => warn!("received malformed ACK - ignoring: {}", e),
            Some(Ok(ack)) => self.shared.ack_received(ack).await,
        }
    }

    pub async fn rwindow(&self) -> u32 {
        self.shared.inner.lock().await.rwindow
    }

    pub async fn queue_len(&self) -> usize {
        self.shared.inner.lock().await.retransmit_queue.len()
    }

    pub async fn highest_ack(&self) -> SeqNum {
        self.shared.inner.lock().await.highest_ack
    }

    pub async fn rto(&self) -> Duration {
        self.shared.inner.lock().await.rto
    }

    pub async fn retransmit_count(&self) -> u64 {
        self.shared.inner.lock().await.retransmit_count
    }

    pub async fn is_closed(&self) -> bool {
        let inner = self.shared.inner.lock().await;
        inner.local_closed || inner.hard_closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlowControlKind;
    use crate::message::{MIME_TYPE_CLOSE, RELIABLE_NAMESPACE, RETRY_ELEMENT_NAME};
    use crate::outgoing::MockOutgoing;
    use crate::test_util::TrackingOutgoing;
    use mockall::Sequence;
    use rstest::rstest;

    fn config(chunk_size: usize, rwindow: u32) -> Arc<ReliableConfig> {
        Arc::new(ReliableConfig {
            chunk_size,
            initial_rtt: Duration::from_millis(100),
            min_rto: Duration::from_millis(500),
            close_linger: Duration::from_secs(2),
            flow_control: FlowControlKind::Fixed { rwindow },
            ..ReliableConfig::default()
        })
    }

    fn ack(cumulative: u32, selective: &[u32]) -> Message {
        AckMessage {
            cumulative: SeqNum::from_raw(cumulative),
            selective: selective.iter().map(|&s| SeqNum::from_raw(s)).collect(),
        }.to_message()
    }

    fn setup(chunk_size: usize, rwindow: u32) -> (Arc<TrackingOutgoing>, Arc<ReliableOutputStream>) {
        let outgoing = Arc::new(TrackingOutgoing::new());
        let stream = Arc::new(ReliableOutputStream::new(config(chunk_size, rwindow), outgoing.clone()).unwrap());
        (outgoing, stream)
    }

    fn payloads(messages: &[Message]) -> Vec<Vec<u8>> {
        messages.iter()
            .map(|m| m.elements()[0].content.to_vec())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_chunks() {
        let (outgoing, stream) = setup(4, 10);

        stream.write(b"abcdefghij").await.unwrap();
        assert_eq!(payloads(&outgoing.sent_messages().await), vec![b"abcd".to_vec(), b"efgh".to_vec()]);

        stream.flush().await.unwrap();
        assert_eq!(outgoing.sent_chunk_seqs().await, vec![SeqNum::from_raw(1), SeqNum::from_raw(2), SeqNum::from_raw(3)]);
        assert_eq!(payloads(&outgoing.sent_messages().await)[2], b"ij".to_vec());
        assert_eq!(stream.queue_len().await, 3);

        // flushing an empty buffer sends nothing
        stream.flush().await.unwrap();
        assert_eq!(outgoing.sent_messages().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_message() {
        let (outgoing, stream) = setup(2, 10);

        stream.write(b"x").await.unwrap();
        stream.send_message(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(payloads(&outgoing.sent_messages().await), vec![b"x".to_vec(), b"hello".to_vec()]);
    }

    #[rstest]
    #[case::cumulative(3, vec![], 2, 3)]
    #[case::partial(1, vec![], 4, 1)]
    #[case::selective(1, vec![3, 5], 2, 1)]
    #[case::selective_unknown(2, vec![7], 3, 2)]
    #[case::everything(5, vec![], 0, 5)]
    #[tokio::test(start_paused = true)]
    async fn test_ack_retires_entries(#[case] cumulative: u32, #[case] selective: Vec<u32>, #[case] expected_queue_len: usize, #[case] expected_highest_ack: u32) {
        let (_outgoing, stream) = setup(1, 10);
        stream.write(b"12345").await.unwrap();
        assert_eq!(stream.queue_len().await, 5);

        stream.recv(&ack(cumulative, &selective)).await;
        assert_eq!(stream.queue_len().await, expected_queue_len);
        assert_eq!(stream.highest_ack().await, SeqNum::from_raw(expected_highest_ack));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cumulative_ack_is_monotonic() {
        let (_outgoing, stream) = setup(1, 10);
        stream.write(b"12345").await.unwrap();

        stream.recv(&ack(3, &[])).await;
        stream.recv(&ack(1, &[])).await;
        assert_eq!(stream.highest_ack().await, SeqNum::from_raw(3));
        assert_eq!(stream.queue_len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_for_unsent_chunk_is_ignored() {
        let (_outgoing, stream) = setup(1, 10);
        stream.write(b"12").await.unwrap();

        stream.recv(&ack(5, &[])).await;
        assert_eq!(stream.highest_ack().await, SeqNum::ZERO);
        assert_eq!(stream.queue_len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_ack_is_ignored() {
        let (_outgoing, stream) = setup(1, 10);
        stream.write(b"12").await.unwrap();

        let malformed = Message::with_element(MessageElement::new(
            RELIABLE_NAMESPACE, crate::message::ACK_ELEMENT_NAME, crate::message::MIME_TYPE_ACK, Bytes::from_static(&[0, 1])));
        stream.recv(&malformed).await;
        stream.recv(&Message::new()).await;
        assert_eq!(stream.queue_len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_retransmit_of_holes() {
        let (outgoing, stream) = setup(1, 10);
        stream.write(b"1234").await.unwrap();

        time::sleep(Duration::from_millis(20)).await;
        stream.recv(&ack(1, &[])).await;

        time::sleep(Duration::from_millis(30)).await;
        stream.recv(&ack(1, &[3, 4])).await;

        assert_eq!(stream.queue_len().await, 1);
        assert_eq!(stream.retransmit_count().await, 1);
        assert_eq!(outgoing.num_retry_marked().await, 1);
        let seqs = outgoing.sent_chunk_seqs().await;
        assert_eq!(seqs.last(), Some(&SeqNum::from_raw(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_retransmit_and_backoff() {
        let (outgoing, stream) = setup(1, 10);
        stream.write(b"1").await.unwrap();
        assert_eq!(stream.rto().await, Duration::from_millis(500));

        time::sleep(Duration::from_millis(600)).await;
        assert_eq!(outgoing.sent_messages().await.len(), 2);
        assert_eq!(outgoing.num_retry_marked().await, 1);
        assert_eq!(stream.retransmit_count().await, 1);
        assert_eq!(stream.rto().await, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_is_retransmitted() {
        let (outgoing, stream) = setup(1, 10);
        outgoing.set_fail_sends(true);

        stream.write(b"1").await.unwrap();
        assert_eq!(stream.queue_len().await, 1);
        outgoing.assert_no_remaining_messages().await;

        outgoing.set_fail_sends(false);
        time::sleep(Duration::from_millis(600)).await;
        assert_eq!(outgoing.sent_chunk_seqs().await, vec![SeqNum::from_raw(1)]);
        assert_eq!(outgoing.num_retry_marked().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure() {
        let (outgoing, stream) = setup(1, 2);

        let writer = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.write(b"abc").await })
        };

        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(outgoing.sent_chunk_seqs().await.len(), 2);
        assert_eq!(stream.queue_len().await, 2);
        assert!(!writer.is_finished());

        stream.recv(&ack(1, &[])).await;
        time::sleep(Duration::from_millis(10)).await;
        assert!(writer.await.unwrap().is_ok());
        assert_eq!(outgoing.sent_chunk_seqs().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_for_ack() {
        let (outgoing, stream) = setup(4, 10);
        stream.write(b"ab").await.unwrap();

        let closer = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.close().await })
        };

        time::sleep(Duration::from_millis(10)).await;
        let sent = outgoing.sent_messages().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].elements()[0].content, Bytes::from_static(b"ab"));
        assert_eq!(sent[1].elements()[0].mime_type, MIME_TYPE_CLOSE);
        assert!(!closer.is_finished());

        stream.recv(&ack(2, &[])).await;
        assert!(closer.await.unwrap().is_ok());
        assert!(stream.is_closed().await);
        assert!(matches!(stream.write(b"x").await, Err(TransportError::Closed)));

        // closing again is a no-op
        assert!(stream.close().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_linger_expires() {
        let (outgoing, stream) = setup(4, 10);
        stream.write(b"ab").await.unwrap();

        let started = Instant::now();
        assert!(stream.close().await.is_ok());
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(stream.queue_len().await, 0);
        assert!(stream.is_closed().await);
        assert_eq!(outgoing.num_closed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_close() {
        let (_outgoing, stream) = setup(4, 10);
        stream.write(b"abcdef").await.unwrap();
        assert_eq!(stream.queue_len().await, 1);

        stream.hard_close().await;
        assert_eq!(stream.queue_len().await, 0);
        assert!(stream.is_closed().await);
        assert!(matches!(stream.write(b"x").await, Err(TransportError::Closed)));
        assert!(matches!(stream.flush().await, Err(TransportError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_after_max_retry_age() {
        let outgoing = Arc::new(TrackingOutgoing::new()
            .with_max_retry_age(Duration::from_secs(5)));
        let stream = ReliableOutputStream::new(config(1, 10), outgoing.clone()).unwrap();
        stream.write(b"1").await.unwrap();

        time::sleep(Duration::from_secs(20)).await;
        assert_eq!(outgoing.num_closed(), 1);
        assert_eq!(stream.queue_len().await, 0);
        assert!(matches!(stream.write(b"x").await, Err(TransportError::ConnectionDead(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_after_idle_timeout() {
        let outgoing = Arc::new(TrackingOutgoing::new()
            .with_idle_timeout(Duration::from_secs(3)));
        let stream = ReliableOutputStream::new(config(1, 10), outgoing.clone()).unwrap();
        stream.write(b"1").await.unwrap();
        stream.recv(&ack(1, &[])).await;

        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(outgoing.num_closed(), 1);
        assert!(matches!(stream.flush().await, Err(TransportError::ConnectionDead(_))));
    }

    #[rstest]
    #[case::empty_chunks(|c: &mut ReliableConfig| c.chunk_size = 0)]
    #[case::window_beyond_remote_queue(|c: &mut ReliableConfig| c.flow_control = FlowControlKind::Fixed { rwindow: 500 })]
    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_is_rejected(#[case] modify: fn(&mut ReliableConfig)) {
        let mut config = ReliableConfig::default();
        modify(&mut config);
        assert!(ReliableOutputStream::new(Arc::new(config), Arc::new(TrackingOutgoing::new())).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_free_space_counts_buffered_chunks() {
        let outgoing = Arc::new(TrackingOutgoing::new());
        let config = Arc::new(ReliableConfig {
            chunk_size: 1,
            max_queue_size: 4,
            flow_control: FlowControlKind::Fixed { rwindow: 4 },
            ..ReliableConfig::default()
        });
        let stream = Arc::new(ReliableOutputStream::new(config, outgoing.clone()).unwrap());
        stream.write(b"abcd").await.unwrap();

        // #1 is missing, the receiver buffers #2..#4
        stream.recv(&ack(0, &[2, 3, 4])).await;
        stream.write(b"e").await.unwrap();
        assert_eq!(stream.queue_len().await, 2);

        // the buffered chunks are not listed again, but they still occupy the receiver's queue
        stream.recv(&ack(0, &[])).await;
        let writer = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.write(b"f").await })
        };
        time::sleep(Duration::from_millis(10)).await;
        assert!(!writer.is_finished());
        assert_eq!(stream.queue_len().await, 2);

        stream.recv(&ack(3, &[])).await;
        time::sleep(Duration::from_millis(10)).await;
        assert!(writer.await.unwrap().is_ok());
        assert_eq!(outgoing.sent_chunk_seqs().await.last(), Some(&SeqNum::from_raw(6)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_close_clears_held_write_buffer() {
        let (_outgoing, stream) = setup(4, 10);
        stream.write(b"ab").await.unwrap();

        let held = stream.write_buffer.lock().await;
        stream.hard_close().await;
        drop(held);

        assert!(matches!(stream.flush().await, Err(TransportError::Closed)));
        assert!(stream.write_buffer.lock().await.is_empty());
        assert!(matches!(stream.close().await, Ok(())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_retransmission_skips_rest_of_cycle() {
        let mut outgoing = MockOutgoing::new();
        let mut sequence = Sequence::new();
        outgoing.expect_send()
            .times(3)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(()));
        outgoing.expect_send()
            .once()
            .in_sequence(&mut sequence)
            .withf(|m| m.get_element(RELIABLE_NAMESPACE, RETRY_ELEMENT_NAME).is_some())
            .returning(|_| Err(anyhow::anyhow!("simulated send failure")));
        outgoing.expect_set_last_accessed()
            .returning(|_| ());
        outgoing.expect_last_accessed()
            .returning(Instant::now);
        outgoing.expect_max_retry_age()
            .return_const(Duration::from_secs(3600));
        outgoing.expect_idle_timeout()
            .return_const(Duration::from_secs(3600));
        outgoing.expect_min_idle_reconnect_time()
            .return_const(Duration::from_secs(10));
        outgoing.expect_close()
            .never();

        let stream = ReliableOutputStream::new(config(1, 10), Arc::new(outgoing)).unwrap();
        stream.write(b"abc").await.unwrap();

        time::sleep(Duration::from_millis(600)).await;
        assert_eq!(stream.retransmit_count().await, 3);
        assert_eq!(stream.queue_len().await, 3);
        assert!(!stream.is_closed().await);
    }
}
