//! Core object model for dsvn clients
//!
//! Content-addressed file text (ObjectId), node kinds and traversal depths.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Content checksum of a file text (SHA-256)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Checksum of `data`
    pub fn from_data(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Hex checksum of `data`, the form carried on the edit protocol.
pub fn checksum(data: &[u8]) -> String {
    ObjectId::from_data(data).to_hex()
}

/// Kind of a versioned node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum NodeKind {
    #[default]
    None,
    File,
    Dir,
    Unknown,
}

impl NodeKind {
    pub fn is_dir(self) -> bool {
        self == NodeKind::Dir
    }

    pub fn is_file(self) -> bool {
        self == NodeKind::File
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeKind::None => "none",
            NodeKind::File => "file",
            NodeKind::Dir => "dir",
            NodeKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// How far below a target a working-copy walk descends
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Depth {
    /// Only the target itself
    Empty,
    /// The target and its file children
    Files,
    /// The target and all its immediate children
    Immediates,
    /// The whole subtree
    Infinity,
}

impl Depth {
    /// Depth applied to the children of a directory walked at this depth.
    /// `None` means the children are not visited.
    pub fn for_children(self) -> Option<Depth> {
        match self {
            Depth::Empty => None,
            Depth::Files | Depth::Immediates => Some(Depth::Empty),
            Depth::Infinity => Some(Depth::Infinity),
        }
    }

    /// Whether a child of the given kind is visited at this depth.
    pub fn includes(self, kind: NodeKind) -> bool {
        match self {
            Depth::Empty => false,
            Depth::Files => kind != NodeKind::Dir,
            Depth::Immediates | Depth::Infinity => true,
        }
    }

    pub fn from_recursive(recursive: bool) -> Self {
        if recursive { Depth::Infinity } else { Depth::Files }
    }
}
