//! Core object model for revfs
//!
//! Node-revisions are content-addressed: their id is the SHA-256 of their
//! canonical encoding. Directory entries point at child node-revision ids, so
//! a revision's root id pins down the whole tree (a Merkle tree, like Git's
//! object model, but carrying SVN-style node ancestry).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::collections::btree_map;

use crate::error::{FsError, Result};
use crate::properties::PropertySet;

/// Revision number
pub type Revnum = u64;

/// Stable node identity shared by every node-revision of one lineage
pub type NodeId = u64;

/// Unique identifier for any stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    /// Create a new ObjectId from raw bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute ObjectId from data
    pub fn from_data(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(hash.into())
    }

    /// Build from a finished hasher
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self(hasher.finalize().into())
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string
    pub fn from_hex(hex_str: &str) -> std::result::Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Parse from a raw 32-byte slice (database column)
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| FsError::Corrupt(format!("object id of {} bytes", bytes.len())))?;
        Ok(Self(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First twelve hex digits, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Node type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Directory,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::File => f.write_str("file"),
            NodeKind::Directory => f.write_str("dir"),
        }
    }
}

/// Pointer to a file's stored content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRep {
    /// SHA-256 of the plain content; also the content object's key
    pub blob: ObjectId,
    /// SHA-1 of the plain content, hex encoded
    pub sha1: String,
    /// Plain content length
    pub size: u64,
}

/// Directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry type
    pub kind: NodeKind,
    /// Child node-revision
    pub id: ObjectId,
}

/// Directory listing: name → child node-revision
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    /// Sorted entries for deterministic hashing
    entries: BTreeMap<String, DirEntry>,
}

impl Directory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry; a name that is already present is rejected
    pub fn insert(&mut self, name: impl Into<String>, entry: DirEntry) -> Result<()> {
        match self.entries.entry(name.into()) {
            btree_map::Entry::Occupied(o) => Err(FsError::AlreadyExists(o.key().clone())),
            btree_map::Entry::Vacant(v) => {
                v.insert(entry);
                Ok(())
            }
        }
    }

    /// Remove an entry
    pub fn remove(&mut self, name: &str) -> Option<DirEntry> {
        self.entries.remove(name)
    }

    /// Get an entry
    pub fn get(&self, name: &str) -> Option<&DirEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over entries in name order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &DirEntry)> {
        self.entries.iter()
    }
}

impl IntoIterator for Directory {
    type Item = (String, DirEntry);
    type IntoIter = btree_map::IntoIter<String, DirEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Kind-specific payload of a node-revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeContent {
    /// File text; `None` is the empty file
    File(Option<TextRep>),
    Directory(Directory),
}

impl NodeContent {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeContent::File(_) => NodeKind::File,
            NodeContent::Directory(_) => NodeKind::Directory,
        }
    }
}

/// Source of a copy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CopyFrom {
    pub path: String,
    pub rev: Revnum,
}

/// One immutable version of a file or directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRevision {
    pub node_id: NodeId,
    pub content: NodeContent,
    pub props: PropertySet,
    /// Revision that committed this node-revision
    pub created_rev: Revnum,
    /// Path at which this node-revision was committed
    pub created_path: String,
    /// Node-revision this one was derived from, by edit or copy
    pub predecessor: Option<ObjectId>,
    /// Set when this node-revision was produced by a copy
    pub copy_from: Option<CopyFrom>,
}

impl NodeRevision {
    pub fn kind(&self) -> NodeKind {
        self.content.kind()
    }

    /// Compute the node-revision id
    pub fn id(&self) -> Result<ObjectId> {
        Ok(ObjectId::from_data(&self.to_bytes()?))
    }

    /// Serialize to binary format
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from binary format
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    /// Directory entries, or `NotADirectory`
    pub fn entries(&self) -> Result<&Directory> {
        match &self.content {
            NodeContent::Directory(dir) => Ok(dir),
            NodeContent::File(_) => Err(FsError::NotADirectory(self.created_path.clone())),
        }
    }

    /// File text, or `NotAFile`
    pub fn text(&self) -> Result<Option<&TextRep>> {
        match &self.content {
            NodeContent::File(text) => Ok(text.as_ref()),
            NodeContent::Directory(_) => Err(FsError::NotAFile(self.created_path.clone())),
        }
    }
}

/// What a revision did to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeAction {
    Add,
    Modify,
    Delete,
    /// Deleted and added again in the same revision
    Replace,
}

impl ChangeAction {
    /// One-letter code as used by `svn log -v`
    pub fn code(&self) -> char {
        match self {
            ChangeAction::Add => 'A',
            ChangeAction::Modify => 'M',
            ChangeAction::Delete => 'D',
            ChangeAction::Replace => 'R',
        }
    }

    pub fn from_code(code: &str) -> Result<Self> {
        match code {
            "A" => Ok(ChangeAction::Add),
            "M" => Ok(ChangeAction::Modify),
            "D" => Ok(ChangeAction::Delete),
            "R" => Ok(ChangeAction::Replace),
            other => Err(FsError::Corrupt(format!("unknown change action '{}'", other))),
        }
    }
}

/// A path changed by a revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedPath {
    pub path: String,
    pub action: ChangeAction,
    pub kind: NodeKind,
    pub text_mod: bool,
    pub prop_mod: bool,
    pub copy_from: Option<CopyFrom>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_node(path: &str, rev: Revnum) -> NodeRevision {
        NodeRevision {
            node_id: 1,
            content: NodeContent::File(None),
            props: PropertySet::new(),
            created_rev: rev,
            created_path: path.to_string(),
            predecessor: None,
            copy_from: None,
        }
    }

    #[test]
    fn test_object_id_roundtrip() {
        let id = ObjectId::new([42u8; 32]);
        let id2 = ObjectId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, id2);
        assert_eq!(ObjectId::from_slice(id.as_bytes()).unwrap(), id);
        assert!(ObjectId::from_slice(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_directory_rejects_duplicate_names() {
        let mut dir = Directory::new();
        let entry = DirEntry {
            kind: NodeKind::File,
            id: ObjectId::new([0u8; 32]),
        };
        dir.insert("a.txt", entry).unwrap();
        let err = dir.insert("a.txt", entry).unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists(name) if name == "a.txt"));
        assert_eq!(dir.len(), 1);
        assert!(dir.remove("a.txt").is_some());
        assert!(dir.is_empty());
    }

    #[test]
    fn test_node_id_depends_on_path_and_rev() {
        let a = file_node("/a", 1);
        let b = file_node("/b", 1);
        let c = file_node("/a", 2);
        assert_ne!(a.id().unwrap(), b.id().unwrap());
        assert_ne!(a.id().unwrap(), c.id().unwrap());
        assert_eq!(a.id().unwrap(), file_node("/a", 1).id().unwrap());
    }

    #[test]
    fn test_node_serialization() {
        let mut node = file_node("/f", 3);
        node.props.set("svn:eol-style".into(), "native".into());
        node.copy_from = Some(CopyFrom {
            path: "/g".into(),
            rev: 2,
        });
        let back = NodeRevision::from_bytes(&node.to_bytes().unwrap()).unwrap();
        assert_eq!(back, node);
        assert!(back.entries().is_err());
        assert_eq!(back.text().unwrap(), None);
    }

    #[test]
    fn test_change_action_codes() {
        for action in [
            ChangeAction::Add,
            ChangeAction::Modify,
            ChangeAction::Delete,
            ChangeAction::Replace,
        ] {
            let code = action.code().to_string();
            assert_eq!(ChangeAction::from_code(&code).unwrap(), action);
        }
        assert!(ChangeAction::from_code("X").is_err());
    }
}
