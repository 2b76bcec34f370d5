//! Overlay resolution.
//!
//! The value visible at a path is the last confirmed server snapshot with
//! every visible pending write composed on top, oldest first, so the newest
//! local write wins.
//!
//! # Algorithm
//!
//! 1. Start from the server snapshot at the path
//! 2. Walk pending writes in ascending id order, skipping invisible and
//!    disconnect writes
//! 3. A write at or above the path replaces the view with its own subtree
//! 4. A write below the path is grafted into the view
//! 5. A merge acts as one overwrite per named child

use crate::{Children, Node, Path, WritePayload, WriteStore};
use serde::{Deserialize, Serialize};

/// Last confirmed server state, plus where it is known.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCache {
    root: Node,
    /// Paths whose complete server value has been received
    complete: Vec<Path>,
}

impl ServerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a cache from persisted parts.
    pub fn from_parts(root: Node, complete: Vec<Path>) -> Self {
        let mut cache = Self {
            root,
            complete: Vec::new(),
        };
        for path in complete {
            cache.mark_complete(&path);
        }
        cache
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn complete_paths(&self) -> &[Path] {
        &self.complete
    }

    pub fn node_at(&self, path: &Path) -> Node {
        self.root.child_at(path)
    }

    /// True when the server value at `path` is fully known.
    pub fn is_complete(&self, path: &Path) -> bool {
        self.complete.iter().any(|known| known.contains(path))
    }

    /// The server replaced the subtree at `path`.
    pub fn apply_overwrite(&mut self, path: &Path, node: Node) {
        self.root = self.root.update_at(path, node);
        self.mark_complete(path);
    }

    /// The server replaced named children at `path`.
    pub fn apply_merge(&mut self, path: &Path, children: &Children) {
        self.root = self.root.update_children_at(path, children);
        for key in children.keys() {
            self.mark_complete(&path.child(key));
        }
    }

    /// Apply a write payload the server has confirmed.
    pub fn apply_payload(&mut self, path: &Path, payload: &WritePayload) {
        match payload {
            WritePayload::Node(node) => self.apply_overwrite(path, node.clone()),
            WritePayload::Children(children) => self.apply_merge(path, children),
            WritePayload::None => {}
        }
    }

    fn mark_complete(&mut self, path: &Path) {
        if self.is_complete(path) {
            return;
        }
        self.complete.retain(|known| !path.contains(known));
        self.complete.push(path.clone());
    }
}

/// The resolved value at a path.
#[derive(Debug, Clone, PartialEq)]
pub struct View {
    pub node: Node,
    /// Whether `node` is the full value rather than a partial one
    pub complete: bool,
}

/// Compose visible pending writes over the server snapshot at `path`.
pub fn resolve(server: &ServerCache, writes: &WriteStore, path: &Path) -> View {
    let mut view = View {
        node: server.node_at(path),
        complete: server.is_complete(path),
    };

    for record in writes.iter() {
        if !record.contributes_locally() {
            continue;
        }
        if !record.path.is_related(path) {
            continue;
        }
        match &record.payload {
            WritePayload::Node(node) => overlay(&mut view, path, &record.path, node),
            WritePayload::Children(children) => {
                for (key, child) in children {
                    overlay(&mut view, path, &record.path.child(key), child);
                }
            }
            WritePayload::None => {}
        }
    }

    view
}

/// Overwrite of `value` at `write_path`, seen from `path`.
fn overlay(view: &mut View, path: &Path, write_path: &Path, value: &Node) {
    if let Some(rel) = write_path.relative(path) {
        view.node = value.child_at(&rel);
        view.complete = true;
    } else if let Some(rel) = path.relative(write_path) {
        view.node = view.node.update_at(&rel, value.clone());
    }
}
