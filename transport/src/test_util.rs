use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use crate::ack::AckMessage;
use crate::message::{Message, MIME_TYPE_BLOCK, MIME_TYPE_CLOSE, RELIABLE_NAMESPACE, RETRY_ELEMENT_NAME};
use crate::outgoing::Outgoing;
use crate::seq_num::SeqNum;

/// An [Outgoing] that records everything sent through it instead of transmitting it
#[derive(Debug)]
pub struct TrackingOutgoing {
    tracker: RwLock<Vec<Message>>,
    fail_sends: AtomicBool,
    num_closed: AtomicUsize,
    last_accessed: Mutex<Instant>,
    min_idle_reconnect_time: Duration,
    idle_timeout: Duration,
    max_retry_age: Duration,
}

impl Default for TrackingOutgoing {
    fn default() -> Self {
        TrackingOutgoing {
            tracker: Default::default(),
            fail_sends: AtomicBool::new(false),
            num_closed: AtomicUsize::new(0),
            last_accessed: Mutex::new(Instant::now()),
            min_idle_reconnect_time: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(3600),
            max_retry_age: Duration::from_secs(3600),
        }
    }
}

impl TrackingOutgoing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_idle_reconnect_time(mut self, min_idle_reconnect_time: Duration) -> Self {
        self.min_idle_reconnect_time = min_idle_reconnect_time;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_max_retry_age(mut self, max_retry_age: Duration) -> Self {
        self.max_retry_age = max_retry_age;
        self
    }

    /// while set, all sends fail and nothing is recorded
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn num_closed(&self) -> usize {
        self.num_closed.load(Ordering::SeqCst)
    }

    pub async fn sent_messages(&self) -> Vec<Message> {
        self.tracker.read().await.clone()
    }

    pub async fn take_sent_messages(&self) -> Vec<Message> {
        std::mem::take(&mut *self.tracker.write().await)
    }

    /// sequence numbers of all data and close chunks sent so far, in the order they were sent
    pub async fn sent_chunk_seqs(&self) -> Vec<SeqNum> {
        self.tracker.read().await
            .iter()
            .flat_map(|m| m.elements_in(RELIABLE_NAMESPACE))
            .filter(|e| e.mime_type == MIME_TYPE_BLOCK || e.mime_type == MIME_TYPE_CLOSE)
            .filter_map(|e| SeqNum::parse(&e.name))
            .collect()
    }

    pub async fn num_retry_marked(&self) -> usize {
        self.tracker.read().await
            .iter()
            .filter(|m| m.get_element(RELIABLE_NAMESPACE, RETRY_ELEMENT_NAME).is_some())
            .count()
    }

    pub async fn sent_acks(&self) -> Vec<AckMessage> {
        self.tracker.read().await
            .iter()
            .filter_map(AckMessage::from_message)
            .filter_map(|r| r.ok())
            .collect()
    }

    pub async fn assert_no_remaining_messages(&self) {
        assert!(
            self.tracker.read().await
                .is_empty()
        );
    }
}

#[async_trait]
impl Outgoing for TrackingOutgoing {
    async fn send(&self, message: Message) -> anyhow::Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            anyhow::bail!("simulated send failure");
        }
        self.tracker.write().await.push(message);
        Ok(())
    }

    async fn close(&self) {
        self.num_closed.fetch_add(1, Ordering::SeqCst);
    }

    fn min_idle_reconnect_time(&self) -> Duration {
        self.min_idle_reconnect_time
    }

    fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    fn max_retry_age(&self) -> Duration {
        self.max_retry_age
    }

    fn last_accessed(&self) -> Instant {
        *self.last_accessed.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn set_last_accessed(&self, at: Instant) {
        *self.last_accessed.lock()
            .unwrap_or_else(|e| e.into_inner()) = at;
    }
}
