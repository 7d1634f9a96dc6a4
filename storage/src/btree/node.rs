use bytes::{Buf, BufMut, BytesMut};
use crate::error::{StorageError, StorageResult};
use crate::page::PageStatus;

/// A node needs more than this many keys before it is split, so that both halves of a split
///  are non-trivial even with big keys.
pub const MIN_SPLIT_KEYS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// `keys[i]` points to `ptrs[i]`
    Leaf,
    /// `ptrs[i]` is the child with the keys in `[keys[i-1], keys[i])`, so there is one pointer
    ///  more than keys
    Branch,
}

impl NodeKind {
    pub fn page_status(&self) -> PageStatus {
        match self {
            NodeKind::Leaf => PageStatus::Leaf,
            NodeKind::Branch => PageStatus::Branch,
        }
    }

    pub fn from_page_status(status: PageStatus) -> Option<NodeKind> {
        match status {
            PageStatus::Leaf => Some(NodeKind::Leaf),
            PageStatus::Branch => Some(NodeKind::Branch),
            _ => None,
        }
    }
}

/// The in-memory projection of a tree page. The serialized form is stored as the page's value
///  (so it may continue in overflow pages). All numbers in network byte order (BE):
///
/// ```ascii
/// 0: number of keys (u32)
/// 4: (repeated) key length (u32), key bytes
/// *: (repeated) pointer (u64) - one per key in a leaf, one more in a branch
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub page_num: u64,
    pub kind: NodeKind,
    pub keys: Vec<Vec<u8>>,
    pub ptrs: Vec<u64>,
}

/// Pick the shortest key that is bigger than `left` and not bigger than `right`, i.e. the
///  shortest prefix of `right` that still separates the two. Requires `left < right`.
pub fn shortest_separator(left: &[u8], right: &[u8]) -> Vec<u8> {
    let common = left.iter()
        .zip(right.iter())
        .take_while(|(l, r)| l == r)
        .count();
    right[..(common + 1).min(right.len())].to_vec()
}

impl Node {
    pub fn new_leaf(page_num: u64) -> Node {
        Node {
            page_num,
            kind: NodeKind::Leaf,
            keys: Vec::new(),
            ptrs: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    /// index of the child whose key range contains the key
    pub fn child_index(&self, key: &[u8]) -> usize {
        self.keys.partition_point(|k| k.as_slice() <= key)
    }

    pub fn serialized_len(&self) -> usize {
        4 + self.keys.iter().map(|k| 4 + k.len()).sum::<usize>() + 8 * self.ptrs.len()
    }

    pub fn needs_split(&self, max_len: usize) -> bool {
        self.keys.len() > MIN_SPLIT_KEYS && self.serialized_len() > max_len
    }

    /// Split off the upper half of the node's entries, returning the separator key and the
    ///  upper half (with page number 0, it is assigned by the caller).
    pub fn split(&mut self) -> (Vec<u8>, Node) {
        let mid = self.keys.len() / 2;
        match self.kind {
            NodeKind::Leaf => {
                let right_keys = self.keys.split_off(mid);
                let right_ptrs = self.ptrs.split_off(mid);
                let separator = shortest_separator(&self.keys[mid - 1], &right_keys[0]);
                (separator, Node { page_num: 0, kind: NodeKind::Leaf, keys: right_keys, ptrs: right_ptrs })
            }
            NodeKind::Branch => {
                let right_keys = self.keys.split_off(mid + 1);
                let right_ptrs = self.ptrs.split_off(mid + 1);
                let separator = self.keys.pop().unwrap_or_default();
                (separator, Node { page_num: 0, kind: NodeKind::Branch, keys: right_keys, ptrs: right_ptrs })
            }
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.keys.len() as u32);
        for key in &self.keys {
            buf.put_u32(key.len() as u32);
            buf.put_slice(key);
        }
        for &ptr in &self.ptrs {
            buf.put_u64(ptr);
        }
    }

    pub fn deser(page_num: u64, kind: NodeKind, mut buf: &[u8]) -> StorageResult<Node> {
        let truncated = || StorageError::corrupt(format!("tree node in page {} is truncated", page_num));

        let num_keys = buf.try_get_u32().map_err(|_| truncated())? as usize;
        let mut keys = Vec::with_capacity(num_keys.min(buf.remaining() / 4));
        for _ in 0..num_keys {
            let len = buf.try_get_u32().map_err(|_| truncated())? as usize;
            if buf.remaining() < len {
                return Err(truncated());
            }
            keys.push(buf[..len].to_vec());
            buf.advance(len);
        }

        let num_ptrs = match kind {
            NodeKind::Leaf => num_keys,
            NodeKind::Branch => num_keys + 1,
        };
        let mut ptrs = Vec::with_capacity(num_ptrs.min(buf.remaining() / 8));
        for _ in 0..num_ptrs {
            ptrs.push(buf.try_get_u64().map_err(|_| truncated())?);
        }

        if keys.windows(2).any(|w| w[0] >= w[1]) {
            return Err(StorageError::corrupt(format!("keys in page {} are not sorted", page_num)));
        }

        Ok(Node { page_num, kind, keys, ptrs })
    }
}
