//! Shared, incrementally rendered tree with change notifications

use super::{Document, NodeId, NodeSpec};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock, RwLockReadGuard};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Emitted after every mutation; `node` is the node that changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeChange {
    pub node: NodeId,
}

/// The live host tree. Cloning shares the same document.
#[derive(Debug, Clone)]
pub struct LiveTree {
    doc: Arc<RwLock<Document>>,
    changes: broadcast::Sender<TreeChange>,
}

impl LiveTree {
    pub fn new(doc: Document) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            doc: Arc::new(RwLock::new(doc)),
            changes,
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, Document> {
        self.doc.read().await
    }

    /// Subscribe to change notifications for the whole tree.
    pub fn subscribe(&self) -> broadcast::Receiver<TreeChange> {
        self.changes.subscribe()
    }

    pub async fn append_child(&self, parent: NodeId, spec: NodeSpec) -> Option<NodeId> {
        let id = self.doc.write().await.append(parent, &spec)?;
        self.notify(id);
        Some(id)
    }

    pub async fn set_text(&self, node: NodeId, text: &str) -> bool {
        let changed = self.doc.write().await.set_text(node, text);
        if changed {
            self.notify(node);
        }
        changed
    }

    pub async fn set_attr(&self, node: NodeId, name: &str, value: &str) -> bool {
        let changed = self.doc.write().await.set_attr(node, name, value);
        if changed {
            self.notify(node);
        }
        changed
    }

    pub async fn remove_children(&self, node: NodeId) -> bool {
        let changed = self.doc.write().await.remove_children(node);
        if changed {
            self.notify(node);
        }
        changed
    }

    /// Swap in a whole new document (host navigated or re-rendered).
    pub async fn replace(&self, doc: Document) {
        let root = doc.root();
        *self.doc.write().await = doc;
        self.notify(root);
    }

    fn notify(&self, node: NodeId) {
        // No subscribers is fine
        let _ = self.changes.send(TreeChange { node });
    }
}
