//! Building blocks for peer-to-peer nodes:
//!
//! * [transport]: reliable, ordered byte and message streams on top of an unreliable message
//!   carrier, with selective acknowledgement, retransmission and adaptive flow control
//! * [storage]: an embedded paged B+tree store with a record-oriented key-value API
//!
//! The two are independent of each other; a typical node feeds messages received from a
//!  reliable stream into a [storage::Filer].

pub use storage;
pub use transport;
