use std::collections::BTreeMap;
use std::sync::Arc;
use async_trait::async_trait;
use bytes::{Buf, Bytes};
#[cfg(test)] use mockall::automock;
use tokio::sync::{Mutex, Notify};
use tokio::time;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};
use crate::ack::AckMessage;
use crate::config::ReliableConfig;
use crate::error::{TransportError, TransportResult};
use crate::message::{Message, MIME_TYPE_BLOCK, MIME_TYPE_CLOSE, RELIABLE_NAMESPACE};
use crate::outgoing::Outgoing;
use crate::seq_num::SeqNum;

/// Receives the chunks of a stream as messages, strictly in order and each at most once.
///  Errors are logged by the stream and have no effect on delivery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageListener: Send + Sync + 'static {
    async fn on_message(&self, seq: SeqNum, payload: Bytes) -> anyhow::Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ElementKind {
    Block,
    Close,
}

struct QueuedElement {
    kind: ElementKind,
    content: Bytes,
    /// included in an ACK (as a selective ACK) since it arrived
    acked: bool,
}

struct InputStreamInner {
    last_consumed: SeqNum,
    queue: BTreeMap<SeqNum, QueuedElement>,
    /// no new chunks are accepted, queued chunks are still delivered
    input_closed: bool,
    /// the peer's close marker was consumed
    end_of_stream: bool,
    closed: bool,
    last_retransmission_request: Option<Instant>,
}

impl InputStreamInner {
    fn pop_next(&mut self) -> Option<(SeqNum, QueuedElement)> {
        let next = self.last_consumed.next().ok()?;
        let element = self.queue.remove(&next)?;
        self.last_consumed = next;
        Some((next, element))
    }

    fn is_gap_suspected(&self) -> bool {
        match (self.queue.keys().next(), self.last_consumed.next()) {
            (Some(&first), Ok(expected)) => first != expected,
            _ => false,
        }
    }

    fn build_ack(&mut self, max_selective: usize) -> AckMessage {
        let selective = self.queue.iter_mut()
            .filter(|(_, e)| !e.acked)
            .take(max_selective)
            .map(|(&seq, e)| {
                e.acked = true;
                seq
            })
            .collect();

        AckMessage {
            cumulative: self.last_consumed,
            selective,
        }
    }

    fn on_close_marker(&mut self) {
        debug!("end of stream after chunk #{}", self.last_consumed);
        self.end_of_stream = true;
        self.input_closed = true;
    }
}

/// The receiving half of a reliable stream.
///
/// The delivery layer feeds all messages of the stream into [ReliableInputStream::recv], in
///  whatever order and multiplicity they arrive. The stream puts their chunks back in order,
///  drops duplicates and acknowledges them to the sender through the same [Outgoing].
///
/// Data is consumed either by pulling it ([ReliableInputStream::read],
///  [ReliableInputStream::read_message]) or by registering a [MessageListener] that gets each
///  chunk pushed as soon as it is in order. The two modes are mutually exclusive.
pub struct ReliableInputStream {
    config: Arc<ReliableConfig>,
    outgoing: Arc<dyn Outgoing>,
    listener: Option<Arc<dyn MessageListener>>,
    inner: Mutex<InputStreamInner>,
    data_available: Notify,
    /// serializes readers and holds the unread rest of the current chunk
    read_buffer: Mutex<Bytes>,
    /// serializes listener notifications to preserve their order
    delivery_lock: Mutex<()>,
}

impl ReliableInputStream {
    pub fn new(config: Arc<ReliableConfig>, outgoing: Arc<dyn Outgoing>) -> anyhow::Result<ReliableInputStream> {
        Self::create(config, outgoing, None)
    }

    pub fn with_listener(config: Arc<ReliableConfig>, outgoing: Arc<dyn Outgoing>, listener: Arc<dyn MessageListener>) -> anyhow::Result<ReliableInputStream> {
        Self::create(config, outgoing, Some(listener))
    }

    fn create(config: Arc<ReliableConfig>, outgoing: Arc<dyn Outgoing>, listener: Option<Arc<dyn MessageListener>>) -> anyhow::Result<ReliableInputStream> {
        config.validate()?;

        Ok(ReliableInputStream {
            config,
            outgoing,
            listener,
            inner: Mutex::new(InputStreamInner {
                last_consumed: SeqNum::ZERO,
                queue: BTreeMap::new(),
                input_closed: false,
                end_of_stream: false,
                closed: false,
                last_retransmission_request: None,
            }),
            data_available: Notify::new(),
            read_buffer: Mutex::new(Bytes::new()),
            delivery_lock: Mutex::new(()),
        })
    }

    fn max_selective(&self) -> usize {
        self.config.max_queue_size as usize
    }

    async fn send_ack(&self, ack: AckMessage) {
        trace!("sending ACK #{} {:?}", ack.cumulative, ack.selective);
        if let Err(e) = self.outgoing.send(ack.to_message()).await {
            warn!("sending ACK failed: {}", e);
        }
    }

    /// Handles a message from the peer. Elements outside the reliable namespace are ignored,
    ///  and so are elements with a malformed sequence number.
    pub async fn recv(&self, message: &Message) {
        let incoming = message.elements_in(RELIABLE_NAMESPACE)
            .filter_map(|e| {
                let kind = match e.mime_type.as_str() {
                    MIME_TYPE_BLOCK => ElementKind::Block,
                    MIME_TYPE_CLOSE => ElementKind::Close,
                    _ => return None,
                };
                match SeqNum::parse(&e.name) {
                    Some(seq) => Some((seq, kind, e.content.clone())),
                    None => {
                        warn!("element with invalid sequence number {:?} - ignoring", e.name);
                        None
                    }
                }
            })
            .collect::<Vec<_>>();

        if incoming.is_empty() {
            trace!("message without stream data - ignoring");
            return;
        }

        let now = Instant::now();
        let ack = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                trace!("stream is closed - dropping message");
                return;
            }

            let mut needs_ack = false;
            let mut has_new_data = false;
            for (seq, kind, content) in incoming {
                if seq <= inner.last_consumed {
                    trace!("chunk #{} was already consumed", seq);
                    needs_ack = true;
                    continue;
                }
                if let Some(queued) = inner.queue.get_mut(&seq) {
                    trace!("chunk #{} is already queued", seq);
                    // the previous ACK may have been lost
                    queued.acked = false;
                    needs_ack = true;
                    continue;
                }
                if inner.input_closed {
                    trace!("stream is closed for input - dropping chunk #{}", seq);
                    continue;
                }
                // the next chunk in sequence is accepted even if the queue is full: it is the
                //  one that allows the queue to drain
                if inner.queue.len() >= self.max_selective() && inner.last_consumed.next().ok() != Some(seq) {
                    warn!("receive queue is full - dropping chunk #{}", seq);
                    needs_ack = true;
                    continue;
                }

                trace!("queueing chunk #{}", seq);
                inner.queue.insert(seq, QueuedElement { kind, content, acked: false });
                has_new_data = true;
            }

            if needs_ack {
                Some(inner.build_ack(self.max_selective()))
            }
            else if has_new_data && inner.is_gap_suspected() && inner.last_retransmission_request
                .map_or(true, |t| now.saturating_duration_since(t) >= self.config.retransmission_request_cooldown)
            {
                debug!("gap after chunk #{} - requesting retransmission", inner.last_consumed);
                inner.last_retransmission_request = Some(now);
                Some(inner.build_ack(self.max_selective()))
            }
            else {
                None
            }
        };

        self.data_available.notify_waiters();
        self.outgoing.set_last_accessed(now);

        if let Some(ack) = ack {
            self.send_ack(ack).await;
        }
        if self.listener.is_some() {
            self.deliver_to_listener().await;
        }
    }

    async fn deliver_to_listener(&self) {
        let Some(listener) = &self.listener else {
            return;
        };

        let _delivery_guard = self.delivery_lock.lock().await;

        let (batch, ack) = {
            let mut inner = self.inner.lock().await;
            let mut batch = Vec::new();
            let mut consumed_any = false;
            while let Some((seq, element)) = inner.pop_next() {
                consumed_any = true;
                match element.kind {
                    ElementKind::Block => batch.push((seq, element.content)),
                    ElementKind::Close => inner.on_close_marker(),
                }
            }
            if !consumed_any {
                return;
            }
            (batch, inner.build_ack(self.max_selective()))
        };

        for (seq, payload) in batch {
            if let Err(e) = listener.on_message(seq, payload).await {
                error!("listener failed to handle message #{}: {}", seq, e);
            }
        }
        self.send_ack(ack).await;
    }

    /// Waits for the next chunk in sequence and returns its content, or `None` at the end of
    ///  the stream.
    pub async fn read_message(&self) -> TransportResult<Option<Bytes>> {
        if self.listener.is_some() {
            return Err(TransportError::ListenerMode);
        }

        let deadline = self.config.read_timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.data_available.notified();
            {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return Err(TransportError::Closed);
                }

                if let Some((_, element)) = inner.pop_next() {
                    let result = match element.kind {
                        ElementKind::Block => Some(element.content),
                        ElementKind::Close => {
                            inner.on_close_marker();
                            None
                        }
                    };
                    let ack = inner.build_ack(self.max_selective());
                    drop(inner);

                    self.send_ack(ack).await;
                    return Ok(result);
                }

                if inner.end_of_stream || inner.input_closed {
                    return Ok(None);
                }
            }

            match deadline {
                Some(deadline) => {
                    if time::timeout_at(deadline, notified).await.is_err() {
                        return Err(TransportError::Timeout(self.config.read_timeout.unwrap_or_default()));
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Reads up to `buf.len()` bytes, crossing chunk boundaries as needed. Returns 0 at the end
    ///  of the stream (or for an empty `buf`).
    pub async fn read(&self, buf: &mut [u8]) -> TransportResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut current = self.read_buffer.lock().await;
        loop {
            if self.inner.lock().await.closed {
                // the rest of a chunk that was read before the stream was closed
                current.clear();
                return Err(TransportError::Closed);
            }
            if !current.is_empty() {
                let len = current.len().min(buf.len());
                current.copy_to_slice(&mut buf[..len]);
                return Ok(len);
            }

            match self.read_message().await? {
                Some(content) => *current = content,
                None => return Ok(0),
            }
        }
    }

    /// reads everything up to the end of the stream
    pub async fn read_to_end(&self) -> TransportResult<Vec<u8>> {
        let mut current = self.read_buffer.lock().await;
        if self.inner.lock().await.closed {
            current.clear();
            return Err(TransportError::Closed);
        }
        let mut result = current.to_vec();
        current.clear();

        while let Some(content) = self.read_message().await? {
            result.extend_from_slice(&content);
        }
        Ok(result)
    }

    /// Stops accepting new chunks. Chunks that are already queued can still be read.
    pub async fn soft_close(&self) {
        debug!("soft close");
        self.inner.lock().await.input_closed = true;
        self.data_available.notify_waiters();
    }

    /// Discards all queued data. Blocked readers wake up with [TransportError::Closed].
    pub async fn close(&self) {
        debug!("hard close");
        {
            let mut inner = self.inner.lock().await;
            inner.closed = true;
            inner.input_closed = true;
            inner.queue.clear();
        }
        self.data_available.notify_waiters();
        // a reader holding the buffer clears it when it sees the closed stream
        if let Ok(mut current) = self.read_buffer.try_lock() {
            current.clear();
        }
    }

    pub async fn last_consumed(&self) -> SeqNum {
        self.inner.lock().await.last_consumed
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    pub async fn is_end_of_stream(&self) -> bool {
        self.inner.lock().await.end_of_stream
    }

    pub async fn is_closed(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.closed || inner.input_closed
    }
}
