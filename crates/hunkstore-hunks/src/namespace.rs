//! Minimal namespace of map nodes, tables, files and hunk storages
//!
//! Paths look like `//tmp/t`; `/` is the root map node. Only map nodes and
//! tables carry `hunk_erasure_codec`. A new table takes the codec of its
//! nearest ancestor map node that sets one, `none` otherwise.

use hunkstore_common::{Error, ErasureCodecId, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const ROOT_PATH: &str = "/";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    MapNode,
    Table,
    File,
    HunkStorage,
}

#[derive(Clone, Debug)]
struct NamespaceNode {
    kind: NodeKind,
    hunk_erasure_codec: Option<ErasureCodecId>,
}

fn parent_of(path: &str) -> Result<&str> {
    if !path.starts_with("//") || path.len() <= 2 || path.ends_with('/') {
        return Err(Error::invalid_argument(format!("malformed path {path:?}")));
    }
    match path.rfind('/') {
        Some(1) => Ok(ROOT_PATH),
        Some(index) => Ok(&path[..index]),
        None => Err(Error::invalid_argument(format!("malformed path {path:?}"))),
    }
}

/// Tree of named nodes
#[derive(Debug)]
pub struct Namespace {
    nodes: RwLock<BTreeMap<String, NamespaceNode>>,
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

impl Namespace {
    #[must_use]
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT_PATH.to_owned(),
            NamespaceNode {
                kind: NodeKind::MapNode,
                hunk_erasure_codec: None,
            },
        );
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    /// Create a node under an existing map node
    pub fn create(&self, path: &str, kind: NodeKind) -> Result<()> {
        let parent = parent_of(path)?;
        let mut nodes = self.nodes.write();
        if nodes.contains_key(path) {
            return Err(Error::invalid_argument(format!("node {path} already exists")));
        }
        match nodes.get(parent) {
            Some(node) if node.kind == NodeKind::MapNode => {}
            Some(_) => {
                return Err(Error::invalid_argument(format!(
                    "parent {parent} is not a map node"
                )));
            }
            None => return Err(Error::NoSuchNode(parent.to_owned())),
        }

        let hunk_erasure_codec = match kind {
            NodeKind::Table => Some(Self::inherited_codec(&nodes, parent)),
            NodeKind::MapNode | NodeKind::File | NodeKind::HunkStorage => None,
        };
        nodes.insert(
            path.to_owned(),
            NamespaceNode {
                kind,
                hunk_erasure_codec,
            },
        );
        Ok(())
    }

    fn inherited_codec(nodes: &BTreeMap<String, NamespaceNode>, mut path: &str) -> ErasureCodecId {
        loop {
            if let Some(codec) = nodes.get(path).and_then(|node| node.hunk_erasure_codec) {
                return codec;
            }
            if path == ROOT_PATH {
                return ErasureCodecId::None;
            }
            match parent_of(path) {
                Ok(parent) => path = parent,
                Err(_) => return ErasureCodecId::None,
            }
        }
    }

    #[must_use]
    pub fn kind(&self, path: &str) -> Option<NodeKind> {
        self.nodes.read().get(path).map(|node| node.kind)
    }

    /// Set `hunk_erasure_codec` on a map node or table
    pub fn set_hunk_erasure_codec(&self, path: &str, codec: ErasureCodecId) -> Result<()> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(path)
            .ok_or_else(|| Error::NoSuchNode(path.to_owned()))?;
        match node.kind {
            NodeKind::MapNode | NodeKind::Table => {
                node.hunk_erasure_codec = Some(codec);
                Ok(())
            }
            NodeKind::File | NodeKind::HunkStorage => Err(Error::invalid_argument(format!(
                "hunk_erasure_codec is not applicable to {:?} {path}",
                node.kind
            ))),
        }
    }

    /// `hunk_erasure_codec` of a map node (`None` when unset) or table
    pub fn hunk_erasure_codec(&self, path: &str) -> Result<Option<ErasureCodecId>> {
        let nodes = self.nodes.read();
        let node = nodes
            .get(path)
            .ok_or_else(|| Error::NoSuchNode(path.to_owned()))?;
        match node.kind {
            NodeKind::MapNode | NodeKind::Table => Ok(node.hunk_erasure_codec),
            NodeKind::File | NodeKind::HunkStorage => Err(Error::invalid_argument(format!(
                "hunk_erasure_codec is not applicable to {:?} {path}",
                node.kind
            ))),
        }
    }

    /// Remove a node without children
    pub fn remove(&self, path: &str) -> Result<()> {
        if path == ROOT_PATH {
            return Err(Error::invalid_argument("cannot remove the root"));
        }
        let mut nodes = self.nodes.write();
        if !nodes.contains_key(path) {
            return Err(Error::NoSuchNode(path.to_owned()));
        }
        let prefix = format!("{path}/");
        if nodes.keys().any(|key| key.starts_with(&prefix)) {
            return Err(Error::invalid_argument(format!("node {path} has children")));
        }
        nodes.remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rs63() -> ErasureCodecId {
        "reed_solomon_6_3".parse().unwrap()
    }

    #[test]
    fn test_table_inherits_nearest_codec() {
        let ns = Namespace::new();
        ns.create("//tmp", NodeKind::MapNode).unwrap();
        ns.create("//tmp/a", NodeKind::MapNode).unwrap();
        ns.create("//tmp/t0", NodeKind::Table).unwrap();
        assert_eq!(ns.hunk_erasure_codec("//tmp/t0").unwrap(), Some(ErasureCodecId::None));

        ns.set_hunk_erasure_codec("//tmp", rs63()).unwrap();
        ns.create("//tmp/a/t1", NodeKind::Table).unwrap();
        assert_eq!(ns.hunk_erasure_codec("//tmp/a/t1").unwrap(), Some(rs63()));

        let lrc: ErasureCodecId = "lrc_12_2_2".parse().unwrap();
        ns.set_hunk_erasure_codec("//tmp/a", lrc).unwrap();
        ns.create("//tmp/a/t2", NodeKind::Table).unwrap();
        assert_eq!(ns.hunk_erasure_codec("//tmp/a/t2").unwrap(), Some(lrc));

        assert_eq!(ns.hunk_erasure_codec("//tmp/t0").unwrap(), Some(ErasureCodecId::None));
        assert_eq!(ns.hunk_erasure_codec("//tmp/a/t1").unwrap(), Some(rs63()));
    }

    #[test]
    fn test_codec_rejected_for_files_and_hunk_storages() {
        let ns = Namespace::new();
        ns.create("//f", NodeKind::File).unwrap();
        ns.create("//h", NodeKind::HunkStorage).unwrap();
        assert!(matches!(
            ns.set_hunk_erasure_codec("//f", rs63()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            ns.set_hunk_erasure_codec("//h", rs63()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(ns.hunk_erasure_codec("//f").is_err());
    }

    #[test]
    fn test_create_and_remove() {
        let ns = Namespace::new();
        assert!(matches!(
            ns.create("//missing/t", NodeKind::Table),
            Err(Error::NoSuchNode(_))
        ));
        assert!(ns.create("tmp", NodeKind::Table).is_err());
        ns.create("//tmp", NodeKind::MapNode).unwrap();
        ns.create("//tmp/t", NodeKind::Table).unwrap();
        assert!(ns.create("//tmp/t", NodeKind::Table).is_err());
        assert!(ns.create("//tmp/t/x", NodeKind::Table).is_err());

        assert!(ns.remove("//tmp").is_err());
        ns.remove("//tmp/t").unwrap();
        ns.remove("//tmp").unwrap();
        assert_eq!(ns.kind("//tmp"), None);
        assert_eq!(ns.kind(ROOT_PATH), Some(NodeKind::MapNode));
    }
}
