// Path: crates/state/src/node/mod.rs

//! Tree nodes in their three forms.
//!
//! A [`MemNode`] is a node built in memory by the mutation engine. A
//! [`NodePointer`] is the edge to a child: it may hold the in-memory node,
//! the persisted location, or both. A [`Node`] is the uniform read view
//! returned by resolving a pointer; persisted views keep their changeset
//! pinned for as long as they live.

/// Legacy node hashing.
pub mod hash;

use crate::changeset::PinGuard;
use crate::store::TreeStore;
use bytes::Bytes;
use iavlx_storage::{BranchLayout, LeafLayout, NodeId};
use iavlx_types::hash::Hash;
use iavlx_types::prelude::OptionExt;
use iavlx_types::{Result, StoreError, Version};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Identity assigned to a node when its version is hashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeMeta {
    /// The node's id.
    pub id: NodeId,
    /// The node's hash.
    pub hash: Hash,
}

/// A node built in memory.
pub struct MemNode {
    pub(crate) key: Bytes,
    pub(crate) value: Option<Bytes>,
    pub(crate) version: Version,
    pub(crate) height: u8,
    pub(crate) size: u64,
    pub(crate) left: Option<Arc<NodePointer>>,
    pub(crate) right: Option<Arc<NodePointer>>,
    meta: OnceLock<NodeMeta>,
    // Offset + 1 of the WAL-set record that logged this leaf; zero when none.
    wal_offset: AtomicU64,
}

impl MemNode {
    /// A leaf created at `version`.
    pub fn leaf(key: Bytes, value: Bytes, version: Version) -> Self {
        Self {
            key,
            value: Some(value),
            version,
            height: 0,
            size: 1,
            left: None,
            right: None,
            meta: OnceLock::new(),
            wal_offset: AtomicU64::new(0),
        }
    }

    /// A branch over two children. Height and size are supplied by the caller.
    pub(crate) fn branch(
        key: Bytes,
        version: Version,
        height: u8,
        size: u64,
        left: Arc<NodePointer>,
        right: Arc<NodePointer>,
    ) -> Self {
        Self {
            key,
            value: None,
            version,
            height,
            size,
            left: Some(left),
            right: Some(right),
            meta: OnceLock::new(),
            wal_offset: AtomicU64::new(0),
        }
    }

    /// Whether the node is a leaf.
    pub fn is_leaf(&self) -> bool {
        self.height == 0
    }

    /// The leaf key, or the smallest key of the right subtree for branches.
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// The value of a leaf.
    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    /// The version the node was created at.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Subtree height.
    pub fn height(&self) -> u8 {
        self.height
    }

    /// Number of leaves in the subtree.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The id assigned at hashing time.
    pub fn id(&self) -> Option<NodeId> {
        self.meta.get().map(|m| m.id)
    }

    /// The hash assigned at hashing time.
    pub fn hash(&self) -> Option<Hash> {
        self.meta.get().map(|m| m.hash)
    }

    pub(crate) fn meta(&self) -> Option<NodeMeta> {
        self.meta.get().copied()
    }

    pub(crate) fn assign(&self, meta: NodeMeta) -> Result<()> {
        let stored = self.meta.get_or_init(|| meta);
        if *stored != meta {
            return Err(StoreError::Invariant(format!(
                "node {} re-hashed as {}",
                stored.id, meta.id
            )));
        }
        Ok(())
    }

    pub(crate) fn wal_offset(&self) -> Option<u32> {
        match self.wal_offset.load(Ordering::Acquire) {
            0 => None,
            n => u32::try_from(n - 1).ok(),
        }
    }

    pub(crate) fn set_wal_offset(&self, offset: u32) {
        self.wal_offset
            .store(u64::from(offset) + 1, Ordering::Release);
    }

    pub(crate) fn left_ptr(&self) -> Result<&Arc<NodePointer>> {
        self.left
            .as_ref()
            .required(StoreError::Invariant("branch without left child".into()))
    }

    pub(crate) fn right_ptr(&self) -> Result<&Arc<NodePointer>> {
        self.right
            .as_ref()
            .required(StoreError::Invariant("branch without right child".into()))
    }

    /// Copies the node for mutation at `version`; children are shared.
    pub(crate) fn copy_at(&self, version: Version) -> Self {
        Self {
            key: self.key.clone(),
            value: self.value.clone(),
            version,
            height: self.height,
            size: self.size,
            left: self.left.clone(),
            right: self.right.clone(),
            meta: OnceLock::new(),
            wal_offset: AtomicU64::new(0),
        }
    }
}

impl fmt::Debug for MemNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemNode")
            .field("key", &hex::encode(&self.key))
            .field("version", &self.version)
            .field("height", &self.height)
            .field("size", &self.size)
            .field("id", &self.id())
            .finish()
    }
}

/// Where a persisted node lives: its id plus a 1-based position hint in
/// its changeset's node file (zero when unknown).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLoc {
    /// The node id.
    pub id: NodeId,
    /// 1-based file index hint; verified against `id` on use.
    pub file_idx: u64,
}

/// An edge to a child node.
pub struct NodePointer {
    mem: RwLock<Option<Arc<MemNode>>>,
    loc: RwLock<Option<NodeLoc>>,
}

impl NodePointer {
    /// A pointer owning a fresh in-memory node.
    pub fn from_mem(node: MemNode) -> Arc<Self> {
        Self::from_arc(Arc::new(node))
    }

    /// A pointer to a shared in-memory node.
    pub fn from_arc(node: Arc<MemNode>) -> Arc<Self> {
        Arc::new(Self {
            mem: RwLock::new(Some(node)),
            loc: RwLock::new(None),
        })
    }

    /// A pointer to a node that is only on disk.
    pub fn persisted(loc: NodeLoc) -> Arc<Self> {
        Arc::new(Self {
            mem: RwLock::new(None),
            loc: RwLock::new(Some(loc)),
        })
    }

    /// The in-memory node, if still attached.
    pub fn mem(&self) -> Option<Arc<MemNode>> {
        self.mem.read().clone()
    }

    /// The persisted location, once written.
    pub fn loc(&self) -> Option<NodeLoc> {
        *self.loc.read()
    }

    pub(crate) fn set_loc(&self, loc: NodeLoc) {
        *self.loc.write() = Some(loc);
    }

    /// The node id, from the location or the attached node.
    pub fn id(&self) -> Option<NodeId> {
        self.loc()
            .map(|l| l.id)
            .or_else(|| self.mem().and_then(|m| m.id()))
    }

    /// Drops the in-memory node if the pointer can be resolved from disk.
    pub(crate) fn evict(&self) -> bool {
        if self.loc.read().is_none() {
            return false;
        }
        self.mem.write().take().is_some()
    }

    /// Resolves the pointer into a node view.
    pub fn resolve(&self, store: &TreeStore) -> Result<Node> {
        if let Some(mem) = self.mem() {
            return Ok(Node::Mem(mem));
        }
        let loc = self
            .loc()
            .required(StoreError::Invariant("pointer with neither node nor location".into()))?;
        store.resolve(loc)
    }

    /// Consumes a uniquely owned pointer and returns its node if that node is
    /// still being built at `version` and nothing else references it. The
    /// pointer is handed back otherwise.
    pub(crate) fn take_staged(self, version: Version) -> std::result::Result<MemNode, NodePointer> {
        let NodePointer { mem, loc } = self;
        match mem.into_inner() {
            Some(arc) if arc.version == version && arc.meta.get().is_none() => {
                match Arc::try_unwrap(arc) {
                    Ok(node) => Ok(node),
                    Err(shared) => Err(NodePointer {
                        mem: RwLock::new(Some(shared)),
                        loc,
                    }),
                }
            }
            other => Err(NodePointer {
                mem: RwLock::new(other),
                loc,
            }),
        }
    }
}

impl fmt::Debug for NodePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodePointer")
            .field("in_memory", &self.mem.read().is_some())
            .field("loc", &self.loc())
            .finish()
    }
}

/// A persisted leaf, read from a pinned changeset.
pub struct LeafView {
    pub(crate) pin: PinGuard,
    pub(crate) layout: LeafLayout,
}

/// A persisted branch, read from a pinned changeset.
pub struct BranchView {
    pub(crate) pin: PinGuard,
    pub(crate) pos: u64,
    pub(crate) layout: BranchLayout,
}

/// A resolved node.
pub enum Node {
    /// A node still held in memory.
    Mem(Arc<MemNode>),
    /// A leaf read from disk.
    Leaf(LeafView),
    /// A branch read from disk.
    Branch(BranchView),
}

impl Node {
    /// Whether the node is a leaf.
    pub fn is_leaf(&self) -> bool {
        match self {
            Node::Mem(n) => n.is_leaf(),
            Node::Leaf(_) => true,
            Node::Branch(_) => false,
        }
    }

    /// Subtree height.
    pub fn height(&self) -> u8 {
        match self {
            Node::Mem(n) => n.height,
            Node::Leaf(_) => 0,
            Node::Branch(b) => b.layout.height,
        }
    }

    /// Number of leaves in the subtree.
    pub fn size(&self) -> u64 {
        match self {
            Node::Mem(n) => n.size,
            Node::Leaf(_) => 1,
            Node::Branch(b) => u64::from(b.layout.size),
        }
    }

    /// The version the node was created at.
    pub fn version(&self) -> Version {
        match self {
            Node::Mem(n) => n.version,
            Node::Leaf(l) => l.layout.id.version(),
            Node::Branch(b) => b.layout.id.version(),
        }
    }

    /// The node id; `None` for in-memory nodes not yet hashed.
    pub fn id(&self) -> Option<NodeId> {
        match self {
            Node::Mem(n) => n.id(),
            Node::Leaf(l) => Some(l.layout.id),
            Node::Branch(b) => Some(b.layout.id),
        }
    }

    /// The node hash. In-memory nodes must have been hashed.
    pub fn hash(&self) -> Result<Hash> {
        match self {
            Node::Mem(n) => n
                .hash()
                .required(StoreError::Invariant(format!("node {n:?} is not hashed"))),
            Node::Leaf(l) => Ok(l.layout.hash),
            Node::Branch(b) => Ok(b.layout.hash),
        }
    }

    /// The node key.
    pub fn key(&self) -> Result<Bytes> {
        match self {
            Node::Mem(n) => Ok(n.key.clone()),
            Node::Leaf(l) => l.pin.read_k(l.layout.key_offset),
            Node::Branch(b) => b.pin.read_k(b.layout.key_offset),
        }
    }

    /// Key and value of a leaf.
    pub fn key_value(&self) -> Result<(Bytes, Bytes)> {
        match self {
            Node::Mem(n) => {
                let value = n
                    .value
                    .clone()
                    .required(StoreError::Invariant("branch has no value".into()))?;
                Ok((n.key.clone(), value))
            }
            Node::Leaf(l) => l.pin.read_kv(l.layout.key_offset),
            Node::Branch(_) => Err(StoreError::Invariant("branch has no value".into())),
        }
    }

    /// Pointer to the left child of a branch.
    pub fn left(&self) -> Result<Arc<NodePointer>> {
        match self {
            Node::Mem(n) => n.left_ptr().cloned(),
            Node::Branch(b) => b.pin.child_pointer(&b.layout, b.pos, true),
            Node::Leaf(_) => Err(StoreError::Invariant("leaf has no children".into())),
        }
    }

    /// Pointer to the right child of a branch.
    pub fn right(&self) -> Result<Arc<NodePointer>> {
        match self {
            Node::Mem(n) => n.right_ptr().cloned(),
            Node::Branch(b) => b.pin.child_pointer(&b.layout, b.pos, false),
            Node::Leaf(_) => Err(StoreError::Invariant("leaf has no children".into())),
        }
    }

    /// Copies the node into a mutable in-memory node at `version`.
    pub(crate) fn to_mem(&self, version: Version) -> Result<MemNode> {
        match self {
            Node::Mem(n) => Ok(n.copy_at(version)),
            Node::Leaf(_) => {
                let (key, value) = self.key_value()?;
                Ok(MemNode::leaf(key, value, version))
            }
            Node::Branch(b) => Ok(MemNode::branch(
                self.key()?,
                version,
                b.layout.height,
                u64::from(b.layout.size),
                self.left()?,
                self.right()?,
            )),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Mem(n) => fmt::Debug::fmt(&**n, f),
            Node::Leaf(l) => write!(f, "Leaf({})", l.layout.id),
            Node::Branch(b) => write!(f, "Branch({})", b.layout.id),
        }
    }
}
