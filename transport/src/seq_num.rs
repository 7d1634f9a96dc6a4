use std::fmt::{Display, Formatter};
use crate::error::{TransportError, TransportResult};

/// Sequence number of a chunk in one direction of a reliable stream. The first chunk of a
///  stream is #1, so [SeqNum::ZERO] means "nothing sent / consumed yet".
///
/// Sequence numbers do not wrap around: a stream that would need a number beyond `u32::MAX`
///  fails with [TransportError::SequenceExhausted] and has to be replaced by a fresh stream.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct SeqNum(u32);

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNum {
    pub const ZERO: SeqNum = SeqNum(0);

    pub fn from_raw(value: u32) -> SeqNum {
        SeqNum(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> TransportResult<SeqNum> {
        self.0.checked_add(1)
            .map(SeqNum)
            .ok_or(TransportError::SequenceExhausted)
    }

    /// Data elements carry their sequence number as the decimal string in the element name
    pub fn parse(element_name: &str) -> Option<SeqNum> {
        element_name.parse::<u32>().ok().map(SeqNum)
    }

    pub fn to_element_name(&self) -> String {
        self.0.to_string()
    }
}
