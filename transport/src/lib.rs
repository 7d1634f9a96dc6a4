//! Reliable, ordered streams on top of an unreliable message carrier.
//!
//! The carrier (see [outgoing::Outgoing]) delivers messages, but it may drop, duplicate or
//!  reorder them. This crate adds sequence numbers, acknowledgements and retransmission on top,
//!  i.e. it is a simplified TCP for arbitrary datagram-like carriers.
//!
//! ## Design goals
//!
//! * A stream has two halves that are used independently: a [output_stream::ReliableOutputStream]
//!   on the sending side and a [input_stream::ReliableInputStream] on the receiving side. A
//!   bidirectional connection is simply two streams
//! * No handshake: the first chunk of a stream is #1, and both sides start from there
//! * Selective acknowledgement: the receiver buffers chunks that arrive out of order, and tells
//!   the sender about them so that only the actual holes are retransmitted
//! * The sender adapts the number of chunks in flight to what the path and the receiver sustain
//!   (see [adaptive_flow_control])
//! * Connections are abandoned after a configurable time without progress, so that a dead peer
//!   does not tie up resources forever
//! * Both byte stream and message semantics: bytes written to a stream can be read across chunk
//!   boundaries, or each chunk can be delivered as a message to a listener
//!
//! ## Elements
//!
//! All protocol elements live in the reserved namespace `RELIABLE`, and all other elements of a
//!  carrier message are left alone:
//!
//! ```ascii
//! name            MIME type                        content
//! <seq>           application/x-reliable-block     chunk payload
//! <seq>           application/x-reliable-close     empty - marks the end of the stream
//! RETRY           text/plain                       attempt number - attached to retransmissions
//! ACK             application/x-reliable-ack       see below
//! ```
//!
//! `<seq>` is the chunk's sequence number as a decimal string. The close marker is sequenced
//!  like a data chunk, so it is retransmitted and acknowledged the same way, and the receiver
//!  sees it only after all data.
//!
//! ## ACK
//!
//! All numbers in network byte order (BE):
//!
//! ```ascii
//! 0: cumulative ACK (u32) - highest chunk such that this chunk and all before it were consumed
//! 4: (repeated) selective ACK (u32) - a chunk received out of order and buffered
//! ```
//!
//! The receiver acknowledges when it consumes a chunk, when a duplicate arrives (so a lost ACK
//!  is repeated), and when a gap in the received sequence suggests that something is missing
//!  (rate limited). Each buffered chunk is selectively acknowledged only once unless it arrives
//!  again.
//!
//! The receiver buffers at most `max_queue_size` chunks and drops anything beyond that (sending
//!  an ACK so the sender learns about it), except for the next chunk in sequence. The sender
//!  counts the chunks it knows to be buffered at the receiver, i.e. selectively acknowledged but
//!  not yet covered by the cumulative ACK, to limit what it puts in flight.
//!
//! ## Retransmission
//!
//! The sender keeps every chunk until it is acknowledged. A background task retransmits chunks
//!  whose acknowledgement is overdue: after one retransmission timeout (RTO) for the first
//!  retransmission, two RTOs for further retransmissions. The RTO is derived from a smoothed
//!  RTT and doubles while ACKs stay away. Holes below the highest selective ACK are
//!  retransmitted right away ("fast retransmit").

pub mod ack;
pub mod adaptive_flow_control;
pub mod config;
pub mod error;
pub mod flow_control;
pub mod input_stream;
pub mod message;
pub mod outgoing;
pub mod output_stream;
pub mod rtt;
pub mod seq_num;
pub mod test_util;

pub use config::ReliableConfig;
pub use error::{TransportError, TransportResult};
pub use input_stream::{MessageListener, ReliableInputStream};
pub use message::{Message, MessageElement};
pub use outgoing::Outgoing;
pub use output_stream::ReliableOutputStream;
pub use seq_num::SeqNum;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
