//! A simple-prefix B+tree mapping byte-string keys to `u64` pointers (typically page numbers),
//!  stored in the pages of a [Paged] file.
//!
//! Keys and pointers live in the leaves only. Branches hold separator keys, which are the
//!  shortest byte strings that separate the last key of a left sibling from the first key of
//!  its right sibling, so branches stay small when keys are long. Nodes are split when their
//!  serialized form no longer fits into a page; there is no merging or rebalancing on removal,
//!  space in half-empty nodes is reused by later inserts.
//!
//! The root of a tree stays in the same page for the tree's lifetime: when the root splits,
//!  its content moves into two new children. That allows storing a tree's root page as a
//!  pointer in another tree ("nested" trees sharing one file).
//!
//! Structural modification is not synchronized: there must be at most one writer per file at a
//!  time, which is what [crate::filer::BTreeFiler] guarantees.

pub mod node;
pub mod query;

use std::num::NonZeroUsize;
use std::sync::Arc;
use bytes::BytesMut;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};
use crate::error::{StorageError, StorageResult};
use crate::paged::Paged;
use node::{Node, NodeKind};
pub use query::IndexQuery;

/// Where a tree's root lives: either the file's primary tree, or a tree whose root page is
///  stored as a pointer under some key in a parent tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BTreeRootInfo {
    Root {
        page: u64,
    },
    Nested {
        page: u64,
        parent: Box<BTreeRootInfo>,
        key: Vec<u8>,
    },
}

impl BTreeRootInfo {
    pub fn page(&self) -> u64 {
        match self {
            BTreeRootInfo::Root { page } => *page,
            BTreeRootInfo::Nested { page, .. } => *page,
        }
    }

    pub fn parent(&self) -> Option<&BTreeRootInfo> {
        match self {
            BTreeRootInfo::Root { .. } => None,
            BTreeRootInfo::Nested { parent, .. } => Some(parent),
        }
    }

    /// number of ancestors, 0 for a primary tree
    pub fn nesting_level(&self) -> usize {
        match self.parent() {
            None => 0,
            Some(parent) => parent.nesting_level() + 1,
        }
    }
}

type SplitResult = Option<(Vec<u8>, u64)>;

pub struct BTree {
    paged: Arc<Paged>,
    root_info: BTreeRootInfo,
    node_cache: Mutex<LruCache<u64, Arc<Node>>>,
}

impl BTree {
    /// Create the primary tree of a file, registering its root in the file header
    pub fn create(paged: Arc<Paged>) -> StorageResult<BTree> {
        if paged.root_page().is_some() {
            return Err(StorageError::InvalidArgument(format!("{:?} already has a tree", paged.path())));
        }
        let page = BTree::create_root_page(&paged)?;
        paged.set_root_page(Some(page));
        debug!("created tree with root page {} in {:?}", page, paged.path());
        Ok(BTree::new(paged, BTreeRootInfo::Root { page }))
    }

    pub fn open(paged: Arc<Paged>) -> StorageResult<BTree> {
        let page = paged.root_page()
            .ok_or(StorageError::NotFound)?;
        Ok(BTree::new(paged, BTreeRootInfo::Root { page }))
    }

    pub fn open_or_create(paged: Arc<Paged>) -> StorageResult<BTree> {
        if paged.root_page().is_some() {
            BTree::open(paged)
        }
        else {
            BTree::create(paged)
        }
    }

    fn new(paged: Arc<Paged>, root_info: BTreeRootInfo) -> BTree {
        let capacity = NonZeroUsize::new(paged.config().node_cache_capacity)
            .unwrap_or(NonZeroUsize::MIN);
        BTree {
            paged,
            root_info,
            node_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn create_root_page(paged: &Paged) -> StorageResult<u64> {
        let page = paged.allocate_page(NodeKind::Leaf.page_status(), &[])?;
        let mut buf = BytesMut::new();
        Node::new_leaf(page).ser(&mut buf);
        paged.write_value(page, &buf)?;
        Ok(page)
    }

    pub fn root_info(&self) -> &BTreeRootInfo {
        &self.root_info
    }

    pub fn paged(&self) -> &Arc<Paged> {
        &self.paged
    }

    /// Create a new tree in the same file, with its root page stored under `key` in this tree
    pub fn create_nested_tree(&self, key: &[u8]) -> StorageResult<BTree> {
        self.check_key(key)?;
        if self.find_value(key)?.is_some() {
            return Err(StorageError::InvalidArgument(format!("key {:?} is already in use", key)));
        }

        let page = BTree::create_root_page(&self.paged)?;
        self.add_value(key, page)?;
        debug!("created nested tree with root page {}", page);
        Ok(BTree::new(self.paged.clone(), BTreeRootInfo::Nested {
            page,
            parent: Box::new(self.root_info.clone()),
            key: key.to_vec(),
        }))
    }

    pub fn open_nested_tree(&self, key: &[u8]) -> StorageResult<BTree> {
        let page = self.find_value(key)?
            .ok_or(StorageError::NotFound)?;
        Ok(BTree::new(self.paged.clone(), BTreeRootInfo::Nested {
            page,
            parent: Box::new(self.root_info.clone()),
            key: key.to_vec(),
        }))
    }

    fn check_key(&self, key: &[u8]) -> StorageResult<()> {
        let max = self.paged.max_key_size();
        if key.len() > max {
            return Err(StorageError::KeyTooLarge { len: key.len(), max });
        }
        Ok(())
    }

    fn load_node(&self, page_num: u64) -> StorageResult<Arc<Node>> {
        if let Some(node) = self.node_cache.lock().get(&page_num) {
            return Ok(node.clone());
        }

        let stored = self.paged.read_value(page_num)?;
        let kind = NodeKind::from_page_status(stored.status)
            .ok_or_else(|| StorageError::corrupt(format!("page {} with status {:?} is not a tree node", page_num, stored.status)))?;
        let node = Arc::new(Node::deser(page_num, kind, &stored.value)?);
        self.node_cache.lock().put(page_num, node.clone());
        Ok(node)
    }

    fn write_node(&self, node: Node) -> StorageResult<()> {
        let page_ref = self.paged.get_page(node.page_num)?;
        page_ref.lock().header.status = node.kind.page_status();
        self.paged.mark_dirty(node.page_num, &page_ref);

        let mut buf = BytesMut::with_capacity(node.serialized_len());
        node.ser(&mut buf);
        self.paged.write_value(node.page_num, &buf)?;

        self.node_cache.lock().put(node.page_num, Arc::new(node));
        Ok(())
    }

    fn allocate_node(&self, mut node: Node) -> StorageResult<u64> {
        let page_num = self.paged.allocate_page(node.kind.page_status(), &[])?;
        node.page_num = page_num;
        self.write_node(node)?;
        Ok(page_num)
    }

    fn max_node_len(&self) -> usize {
        self.paged.page_size() - crate::page::PAGE_HEADER_SIZE
    }

    pub fn find_value(&self, key: &[u8]) -> StorageResult<Option<u64>> {
        let mut node = self.load_node(self.root_info.page())?;
        loop {
            match node.kind {
                NodeKind::Leaf => {
                    return Ok(node.keys.binary_search_by(|k| k.as_slice().cmp(key))
                        .ok()
                        .map(|idx| node.ptrs[idx]));
                }
                NodeKind::Branch => {
                    let child = node.ptrs[node.child_index(key)];
                    node = self.load_node(child)?;
                }
            }
        }
    }

    /// Insert a key or replace its pointer, returning the previous pointer
    pub fn add_value(&self, key: &[u8], ptr: u64) -> StorageResult<Option<u64>> {
        self.check_key(key)?;
        let (old, split) = self.insert(self.root_info.page(), key, ptr)?;
        debug_assert!(split.is_none());
        Ok(old)
    }

    fn insert(&self, page_num: u64, key: &[u8], ptr: u64) -> StorageResult<(Option<u64>, SplitResult)> {
        let mut node = Node::clone(&*self.load_node(page_num)?);

        let old = match node.kind {
            NodeKind::Leaf => {
                match node.keys.binary_search_by(|k| k.as_slice().cmp(key)) {
                    Ok(idx) => {
                        let old = node.ptrs[idx];
                        if old != ptr {
                            node.ptrs[idx] = ptr;
                            self.write_node(node)?;
                        }
                        return Ok((Some(old), None));
                    }
                    Err(idx) => {
                        node.keys.insert(idx, key.to_vec());
                        node.ptrs.insert(idx, ptr);
                        None
                    }
                }
            }
            NodeKind::Branch => {
                let idx = node.child_index(key);
                let (old, split) = self.insert(node.ptrs[idx], key, ptr)?;
                match split {
                    None => return Ok((old, None)),
                    Some((separator, right)) => {
                        trace!("promoting separator {:?} into page {}", separator, page_num);
                        node.keys.insert(idx, separator);
                        node.ptrs.insert(idx + 1, right);
                    }
                }
                old
            }
        };

        if !node.needs_split(self.max_node_len()) {
            self.write_node(node)?;
            return Ok((old, None));
        }

        let (separator, right) = node.split();
        if page_num == self.root_info.page() {
            // the root keeps its page, its two halves move to new pages
            let left = Node { page_num: 0, kind: node.kind, keys: node.keys, ptrs: node.ptrs };
            let left_page = self.allocate_node(left)?;
            let right_page = self.allocate_node(right)?;
            debug!("split root {} into {} and {}", page_num, left_page, right_page);

            self.write_node(Node {
                page_num,
                kind: NodeKind::Branch,
                keys: vec![separator],
                ptrs: vec![left_page, right_page],
            })?;
            Ok((old, None))
        }
        else {
            let right_page = self.allocate_node(right)?;
            debug!("split page {}, new right sibling {}", page_num, right_page);
            self.write_node(node)?;
            Ok((old, Some((separator, right_page))))
        }
    }

    /// Remove a key, returning its pointer
    pub fn remove_value(&self, key: &[u8]) -> StorageResult<u64> {
        let mut node = self.load_node(self.root_info.page())?;
        while node.kind == NodeKind::Branch {
            let child = node.ptrs[node.child_index(key)];
            node = self.load_node(child)?;
        }

        let idx = node.keys.binary_search_by(|k| k.as_slice().cmp(key))
            .map_err(|_| StorageError::NotFound)?;
        let mut node = Node::clone(&node);
        node.keys.remove(idx);
        let ptr = node.ptrs.remove(idx);
        self.write_node(node)?;
        Ok(ptr)
    }

    /// Pass matching keys with their pointers to `callback` in key order, for as long as it
    ///  returns `true`. Without a query, all keys are visited.
    pub fn query<F>(&self, query: Option<&IndexQuery>, mut callback: F) -> StorageResult<()>
    where F: FnMut(&[u8], u64) -> bool
    {
        self.query_node(self.root_info.page(), query, &mut callback)?;
        Ok(())
    }

    fn query_node<F>(&self, page_num: u64, query: Option<&IndexQuery>, callback: &mut F) -> StorageResult<bool>
    where F: FnMut(&[u8], u64) -> bool
    {
        let node = self.load_node(page_num)?;
        match node.kind {
            NodeKind::Leaf => {
                for (key, &ptr) in node.keys.iter().zip(node.ptrs.iter()) {
                    if query.map_or(true, |q| q.matches(key)) && !callback(key.as_slice(), ptr) {
                        return Ok(false);
                    }
                }
            }
            NodeKind::Branch => {
                let range = match query {
                    Some(q) => q.child_range(&node.keys),
                    None => 0..=node.keys.len(),
                };
                for idx in range {
                    if !self.query_node(node.ptrs[idx], query, callback)? {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// number of levels, 1 for a tree that consists of its root leaf
    pub fn depth(&self) -> StorageResult<usize> {
        let mut depth = 1;
        let mut node = self.load_node(self.root_info.page())?;
        while node.kind == NodeKind::Branch {
            depth += 1;
            node = self.load_node(node.ptrs[0])?;
        }
        Ok(depth)
    }

    pub fn flush(&self) -> StorageResult<()> {
        self.paged.flush()
    }

    pub fn close(&self) -> StorageResult<()> {
        self.node_cache.lock().clear();
        self.paged.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rstest::rstest;
    use crate::config::PagedConfig;

    fn small_pages() -> PagedConfig {
        PagedConfig {
            page_size: 512,
            file_header_size: 128,
            max_key_size: 64,
            primary_page_count: 8,
            node_cache_capacity: 16,
            page_cache_capacity: 32,
            ..PagedConfig::default()
        }
    }

    fn new_tree() -> (tempfile::TempDir, BTree) {
        let dir = tempfile::tempdir().unwrap();
        let paged = Paged::create(&dir.path().join("tree.dat"), small_pages()).unwrap();
        let tree = BTree::create(Arc::new(paged)).unwrap();
        (dir, tree)
    }

    fn all_entries(tree: &BTree, query: Option<&IndexQuery>) -> Vec<(Vec<u8>, u64)> {
        let mut result = Vec::new();
        tree.query(query, |k, p| {
            result.push((k.to_vec(), p));
            true
        }).unwrap();
        result
    }

    fn key(i: u32) -> Vec<u8> {
        format!("key-{:06}", i).into_bytes()
    }

    #[test]
    fn test_add_find() {
        let (_dir, tree) = new_tree();
        assert_eq!(tree.find_value(b"a").unwrap(), None);

        assert_eq!(tree.add_value(b"a", 1).unwrap(), None);
        assert_eq!(tree.add_value(b"b", 2).unwrap(), None);
        assert_eq!(tree.find_value(b"a").unwrap(), Some(1));
        assert_eq!(tree.find_value(b"b").unwrap(), Some(2));

        assert_eq!(tree.add_value(b"a", 11).unwrap(), Some(1));
        assert_eq!(tree.find_value(b"a").unwrap(), Some(11));
    }

    #[test]
    fn test_remove() {
        let (_dir, tree) = new_tree();
        tree.add_value(b"a", 1).unwrap();
        tree.add_value(b"b", 2).unwrap();

        assert_eq!(tree.remove_value(b"a").unwrap(), 1);
        assert_eq!(tree.find_value(b"a").unwrap(), None);
        assert!(matches!(tree.remove_value(b"a"), Err(StorageError::NotFound)));
        assert_eq!(all_entries(&tree, None), vec![(b"b".to_vec(), 2)]);
    }

    #[test]
    fn test_key_too_large() {
        let (_dir, tree) = new_tree();
        let key = vec![b'x'; 65];
        assert!(matches!(tree.add_value(&key, 1), Err(StorageError::KeyTooLarge { len: 65, max: 64 })));
    }

    #[test]
    fn test_many_splits_match_reference() {
        let (_dir, tree) = new_tree();
        let root_page = tree.root_info().page();
        let mut reference = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..3000 {
            let i = rng.gen_range(0..2000);
            let ptr = rng.gen::<u32>() as u64;
            assert_eq!(tree.add_value(&key(i), ptr).unwrap(), reference.insert(key(i), ptr));
        }
        for _ in 0..500 {
            let i = rng.gen_range(0..2000);
            match reference.remove(&key(i)) {
                Some(ptr) => assert_eq!(tree.remove_value(&key(i)).unwrap(), ptr),
                None => assert!(matches!(tree.remove_value(&key(i)), Err(StorageError::NotFound))),
            }
        }

        assert!(tree.depth().unwrap() >= 3);
        assert_eq!(tree.root_info().page(), root_page);

        let expected = reference.into_iter().collect::<Vec<_>>();
        assert_eq!(all_entries(&tree, None), expected);
        for (k, p) in &expected {
            assert_eq!(tree.find_value(k).unwrap(), Some(*p));
        }
    }

    #[test]
    fn test_persistent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.dat");
        {
            let tree = BTree::create(Arc::new(Paged::create(&path, small_pages()).unwrap())).unwrap();
            for i in 0..500 {
                tree.add_value(&key(i), i as u64).unwrap();
            }
            tree.close().unwrap();
        }

        let tree = BTree::open(Arc::new(Paged::open(&path, small_pages()).unwrap())).unwrap();
        assert_eq!(all_entries(&tree, None).len(), 500);
        assert_eq!(tree.find_value(&key(123)).unwrap(), Some(123));
    }

    #[test]
    fn test_open_without_tree() {
        let dir = tempfile::tempdir().unwrap();
        let paged = Paged::create(&dir.path().join("tree.dat"), small_pages()).unwrap();
        assert!(matches!(BTree::open(Arc::new(paged)), Err(StorageError::NotFound)));
    }

    #[rstest]
    #[case::equals(IndexQuery::Equals(key(100)), vec![100])]
    #[case::less_than(IndexQuery::LessThan(key(3)), vec![0, 1, 2])]
    #[case::greater_or_equal(IndexQuery::GreaterOrEqual(key(297)), vec![297, 298, 299])]
    #[case::between(IndexQuery::Between(key(150), key(153)), vec![150, 151, 152, 153])]
    #[case::begins_with(IndexQuery::BeginsWith(b"key-00020".to_vec()), (200..210).collect())]
    #[case::is_in(IndexQuery::In(vec![key(250), key(5), b"nope".to_vec()]), vec![5, 250])]
    #[case::not_between(IndexQuery::NotBetween(key(2), key(297)), vec![0, 1, 298, 299])]
    fn test_query(#[case] query: IndexQuery, #[case] expected: Vec<u64>) {
        let (_dir, tree) = new_tree();
        for i in 0..300 {
            tree.add_value(&key(i), i as u64).unwrap();
        }
        assert!(tree.depth().unwrap() >= 2);

        let ptrs = all_entries(&tree, Some(&query)).into_iter()
            .map(|(_, p)| p)
            .collect::<Vec<_>>();
        assert_eq!(ptrs, expected);
    }

    #[test]
    fn test_query_stops_early() {
        let (_dir, tree) = new_tree();
        for i in 0..300 {
            tree.add_value(&key(i), i as u64).unwrap();
        }

        let mut visited = Vec::new();
        tree.query(None, |_, p| {
            visited.push(p);
            visited.len() < 5
        }).unwrap();
        assert_eq!(visited, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_nested_trees() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.dat");
        {
            let primary = BTree::create(Arc::new(Paged::create(&path, small_pages()).unwrap())).unwrap();
            primary.add_value(b"plain", 1).unwrap();

            let nested = primary.create_nested_tree(b"sub").unwrap();
            assert_eq!(nested.root_info().nesting_level(), 1);
            assert_eq!(nested.root_info().parent(), Some(primary.root_info()));
            for i in 0..200 {
                nested.add_value(&key(i), 1000 + i as u64).unwrap();
            }
            assert!(matches!(primary.create_nested_tree(b"sub"), Err(StorageError::InvalidArgument(_))));
            primary.close().unwrap();
        }

        let primary = BTree::open(Arc::new(Paged::open(&path, small_pages()).unwrap())).unwrap();
        assert_eq!(primary.find_value(b"plain").unwrap(), Some(1));
        assert_eq!(all_entries(&primary, None).len(), 2);

        let nested = primary.open_nested_tree(b"sub").unwrap();
        assert_eq!(nested.find_value(&key(42)).unwrap(), Some(1042));
        assert_eq!(all_entries(&nested, None).len(), 200);
        assert!(matches!(primary.open_nested_tree(b"missing"), Err(StorageError::NotFound)));
    }
}
