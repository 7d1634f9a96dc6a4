use std::mem::size_of;
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::message::{Message, MessageElement, ACK_ELEMENT_NAME, MIME_TYPE_ACK, RELIABLE_NAMESPACE};
use crate::seq_num::SeqNum;

/// Acknowledgement sent by the receiving side of a stream.
///
/// Wire format: a flat sequence of u32 BE values, the cumulative ACK followed by zero or more
///  selectively acknowledged sequence numbers.
///
/// ```ascii
/// 0: cumulative ACK - all chunks up to and including this one were consumed
/// 4: (repeated) selectively acknowledged chunk, i.e. received out of order and buffered
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckMessage {
    pub cumulative: SeqNum,
    /// strictly ascending, all greater than `cumulative`
    pub selective: Vec<SeqNum>,
}

impl AckMessage {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.cumulative.to_raw());
        for seq in &self.selective {
            buf.put_u32(seq.to_raw());
        }
    }

    /// Selective ACKs that are not above the cumulative ACK carry no information and are
    ///  dropped, and the list is normalized to ascending order.
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<AckMessage> {
        if buf.remaining() % size_of::<u32>() != 0 {
            bail!("ACK payload of {} bytes is not a sequence of u32 values", buf.remaining());
        }

        let cumulative = SeqNum::from_raw(buf.try_get_u32()?);

        let mut selective = Vec::with_capacity(buf.remaining() / size_of::<u32>());
        while buf.has_remaining() {
            selective.push(SeqNum::from_raw(buf.try_get_u32()?));
        }
        selective.sort();
        selective.dedup();
        selective.retain(|&seq| seq > cumulative);

        Ok(AckMessage { cumulative, selective })
    }

    pub fn to_message(&self) -> Message {
        let mut buf = BytesMut::with_capacity((1 + self.selective.len()) * size_of::<u32>());
        self.ser(&mut buf);
        Message::with_element(MessageElement::new(RELIABLE_NAMESPACE, ACK_ELEMENT_NAME, MIME_TYPE_ACK, buf.freeze()))
    }

    /// returns `None` if the message carries no ACK element at all
    pub fn from_message(message: &Message) -> Option<anyhow::Result<AckMessage>> {
        let element = message.get_element(RELIABLE_NAMESPACE, ACK_ELEMENT_NAME)?;
        if element.mime_type != MIME_TYPE_ACK {
            return Some(Err(anyhow::anyhow!("ACK element has unexpected MIME type {}", element.mime_type)));
        }
        let mut content: Bytes = element.content.clone();
        Some(Self::deser(&mut content))
    }
}
