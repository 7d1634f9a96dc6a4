use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::time::Duration;
use tokio::time::Instant;
use crate::message::Message;

/// This is the abstraction of the unreliable carrier that reliable streams send on: it may
///  drop, duplicate or reorder messages. Both directions of a stream pair use it - the output
///  stream for data chunks, the input stream for ACKs.
///
/// Besides sending, it exposes the connection policy that the retransmission task consults to
///  decide when a connection is to be abandoned.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Outgoing: Send + Sync + 'static {
    /// NB: A failed send is not fatal for the stream - the message stays in the retransmission
    ///      queue and goes out again on the next retransmission cycle
    async fn send(&self, message: Message) -> anyhow::Result<()>;

    async fn close(&self);

    /// idle period after which the retransmission timeout is reset to its RTT-derived value
    fn min_idle_reconnect_time(&self) -> Duration;

    /// a connection without traffic for longer than this is considered dead
    fn idle_timeout(&self) -> Duration;

    /// a chunk that stays unacknowledged for longer than this kills the connection
    fn max_retry_age(&self) -> Duration;

    fn last_accessed(&self) -> Instant;

    fn set_last_accessed(&self, at: Instant);
}
