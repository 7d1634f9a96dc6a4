//! The message model of the carrier that reliable streams run on: a message is an ordered list
//!  of named, typed elements. Reliable streams put their own elements into a reserved namespace
//!  and leave all other elements alone.
//!
//! The binary encoding (`ser` / `deser`) is not part of the reliability protocol. It stands in
//!  for whatever serialization the carrier uses and is handy for simulated wires in tests:
//!
//! ```ascii
//! number of elements (varint)
//! per element:
//!   namespace (varint length + UTF-8)
//!   name      (varint length + UTF-8)
//!   mime type (varint length + UTF-8)
//!   content   (varint length + bytes)
//! ```

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use crate::seq_num::SeqNum;

pub const RELIABLE_NAMESPACE: &str = "RELIABLE";

/// element name of the (single) ACK element in an acknowledgement message
pub const ACK_ELEMENT_NAME: &str = "ACK";
/// element name of the marker that is attached to retransmitted copies of a chunk
pub const RETRY_ELEMENT_NAME: &str = "RETRY";

pub const MIME_TYPE_BLOCK: &str = "application/x-reliable-block";
pub const MIME_TYPE_ACK: &str = "application/x-reliable-ack";
/// A sequenced, empty element marking the orderly end of a stream
pub const MIME_TYPE_CLOSE: &str = "application/x-reliable-close";
pub const MIME_TYPE_TEXT: &str = "text/plain";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageElement {
    pub namespace: String,
    pub name: String,
    pub mime_type: String,
    pub content: Bytes,
}

impl MessageElement {
    pub fn new(namespace: &str, name: &str, mime_type: &str, content: Bytes) -> MessageElement {
        MessageElement {
            namespace: namespace.to_string(),
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            content,
        }
    }

    pub fn block(seq: SeqNum, content: Bytes) -> MessageElement {
        Self::new(RELIABLE_NAMESPACE, &seq.to_element_name(), MIME_TYPE_BLOCK, content)
    }

    pub fn close(seq: SeqNum) -> MessageElement {
        Self::new(RELIABLE_NAMESPACE, &seq.to_element_name(), MIME_TYPE_CLOSE, Bytes::new())
    }

    /// `attempt` is the number of the retransmission, starting at 1
    pub fn retry_marker(attempt: u32) -> MessageElement {
        Self::new(RELIABLE_NAMESPACE, RETRY_ELEMENT_NAME, MIME_TYPE_TEXT, Bytes::from(attempt.to_string()))
    }

    fn ser(&self, buf: &mut BytesMut) {
        put_str(buf, &self.namespace);
        put_str(buf, &self.name);
        put_str(buf, &self.mime_type);
        buf.put_usize_varint(self.content.len());
        buf.put_slice(&self.content);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<MessageElement> {
        let namespace = try_get_str(buf)?;
        let name = try_get_str(buf)?;
        let mime_type = try_get_str(buf)?;
        let content = try_get_bytes(buf)?;
        Ok(MessageElement { namespace, name, mime_type, content })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    elements: Vec<MessageElement>,
}

impl Message {
    pub fn new() -> Message {
        Message::default()
    }

    pub fn with_element(element: MessageElement) -> Message {
        Message { elements: vec![element] }
    }

    pub fn add_element(&mut self, element: MessageElement) {
        self.elements.push(element);
    }

    pub fn elements(&self) -> &[MessageElement] {
        &self.elements
    }

    pub fn elements_in<'a>(&'a self, namespace: &'a str) -> impl Iterator<Item = &'a MessageElement> + 'a {
        self.elements.iter()
            .filter(move |e| e.namespace == namespace)
    }

    pub fn get_element(&self, namespace: &str, name: &str) -> Option<&MessageElement> {
        self.elements.iter()
            .find(|e| e.namespace == namespace && e.name == name)
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_usize_varint(self.elements.len());
        for element in &self.elements {
            element.ser(buf);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Message> {
        let num_elements = buf.try_get_usize_varint()?;
        // every element takes at least four bytes, so this bounds the pre-allocation
        if num_elements > buf.remaining() / 4 {
            bail!("message declares {} elements in {} bytes", num_elements, buf.remaining());
        }

        let mut elements = Vec::with_capacity(num_elements);
        for _ in 0..num_elements {
            elements.push(MessageElement::deser(buf)?);
        }
        Ok(Message { elements })
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

fn try_get_bytes(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = buf.try_get_usize_varint()?;
    if len > buf.remaining() {
        bail!("declared length {} exceeds the remaining {} bytes", len, buf.remaining());
    }
    Ok(buf.copy_to_bytes(len))
}

fn try_get_str(buf: &mut impl Buf) -> anyhow::Result<String> {
    let raw = try_get_bytes(buf)?;
    Ok(String::from_utf8(raw.to_vec())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_ser_deser() {
        let mut msg = Message::with_element(MessageElement::block(SeqNum::from_raw(7), Bytes::from_static(b"hello")));
        msg.add_element(MessageElement::retry_marker(2));
        msg.add_element(MessageElement::new("app", "payload", "application/octet-stream", Bytes::from(vec![0u8; 300])));

        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        let mut b: &[u8] = &buf;
        let deser = Message::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, msg);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::too_many_elements(vec![100, 1, 2, 3])]
    #[case::truncated_string(vec![1, 10, b'a'])]
    #[case::invalid_utf8(vec![1, 1, 0xff, 0, 0, 0])]
    fn test_deser_malformed(#[case] raw: Vec<u8>) {
        let mut b: &[u8] = &raw;
        assert!(Message::deser(&mut b).is_err());
    }

    #[test]
    fn test_element_lookup() {
        let mut msg = Message::new();
        msg.add_element(MessageElement::new("other", "1", MIME_TYPE_BLOCK, Bytes::new()));
        msg.add_element(MessageElement::block(SeqNum::from_raw(1), Bytes::from_static(b"x")));
        msg.add_element(MessageElement::close(SeqNum::from_raw(2)));

        assert_eq!(msg.elements_in(RELIABLE_NAMESPACE).count(), 2);
        assert_eq!(msg.get_element(RELIABLE_NAMESPACE, "1").unwrap().content, Bytes::from_static(b"x"));
        assert_eq!(msg.get_element(RELIABLE_NAMESPACE, "2").unwrap().mime_type, MIME_TYPE_CLOSE);
        assert!(msg.get_element(RELIABLE_NAMESPACE, "3").is_none());
    }
}
