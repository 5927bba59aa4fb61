//! Watches one answer node until it carries a complete thread-map payload

use crate::markup::MarkupNormalizer;
use crate::thread_map::ThreadMap;
use crate::tree::{LiveTree, NodeId};
use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Subscribed, waiting for a parseable payload
    Listening,
    /// Payload delivered; subscription torn down
    Delivered,
    /// Torn down before any delivery
    Cancelled,
}

struct ActiveWatch {
    target: NodeId,
    cancel: CancellationToken,
    state: Arc<Mutex<WatchState>>,
    task: Option<JoinHandle<()>>,
}

/// At most one active subscription at a time. Arming a new target tears
/// the previous one down.
pub struct ResponseWatcher {
    tree: LiveTree,
    fence_tags: Arc<Vec<String>>,
    normalizer: Arc<MarkupNormalizer>,
    active: Mutex<Option<ActiveWatch>>,
}

impl ResponseWatcher {
    pub fn new(tree: LiveTree, fence_tags: Vec<String>, normalizer: Arc<MarkupNormalizer>) -> Self {
        Self {
            tree,
            fence_tags: Arc::new(fence_tags),
            normalizer,
            active: Mutex::new(None),
        }
    }

    /// Start listening on `target`. The receiver resolves at most once, with
    /// the first payload that parses. It closes without a value if the watch
    /// is cancelled or replaced.
    pub fn arm(&self, target: NodeId) -> oneshot::Receiver<ThreadMap> {
        let mut active = self.lock_active();
        // The previous watch is gone before the new one can deliver
        if let Some(previous) = active.take() {
            debug!("Replacing watch on {} with {}", previous.target, target);
            previous.cancel.cancel();
            if let Some(task) = previous.task {
                task.abort();
            }
            if let Ok(mut s) = previous.state.lock() {
                if *s == WatchState::Listening {
                    *s = WatchState::Cancelled;
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let state = Arc::new(Mutex::new(WatchState::Listening));

        // Subscribe before spawning so no change between arm and first poll is lost
        let changes = BroadcastStream::new(self.tree.subscribe());
        let task = tokio::spawn(watch_loop(
            self.tree.clone(),
            target,
            self.fence_tags.clone(),
            self.normalizer.clone(),
            changes,
            cancel.clone(),
            state.clone(),
            tx,
        ));
        *active = Some(ActiveWatch {
            target,
            cancel,
            state,
            task: Some(task),
        });
        info!("Watching {} for a thread map", target);
        rx
    }

    /// Tear down the active subscription, if any.
    pub fn cancel(&self) {
        if let Some(active) = self.lock_active().as_ref() {
            active.cancel.cancel();
        }
    }

    /// State of the most recently armed watch.
    pub fn state(&self) -> Option<WatchState> {
        let active = self.lock_active();
        let active = active.as_ref()?;
        let state = active.state.lock().map(|s| *s).ok()?;
        Some(state)
    }

    pub fn target(&self) -> Option<NodeId> {
        self.lock_active().as_ref().map(|a| a.target)
    }

    /// Wait for the active watch task to exit.
    pub async fn join(&self) {
        let task = self.lock_active().as_mut().and_then(|a| a.task.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveWatch>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ResponseWatcher {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn watch_loop(
    tree: LiveTree,
    target: NodeId,
    fence_tags: Arc<Vec<String>>,
    normalizer: Arc<MarkupNormalizer>,
    mut changes: BroadcastStream<crate::tree::TreeChange>,
    cancel: CancellationToken,
    state: Arc<Mutex<WatchState>>,
    tx: oneshot::Sender<ThreadMap>,
) {
    let set_state = |next: WatchState| {
        if let Ok(mut s) = state.lock() {
            *s = next;
        }
    };

    // The payload may already be there when armed
    if let Some(map) = try_extract(&tree, target, &fence_tags, &normalizer).await {
        if cancel.is_cancelled() {
            set_state(WatchState::Cancelled);
            return;
        }
        deliver(tx, map, target);
        set_state(WatchState::Delivered);
        return;
    }

    loop {
        let change = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Watch on {} cancelled", target);
                set_state(WatchState::Cancelled);
                return;
            }
            change = changes.next() => change,
        };

        let relevant = match change {
            None => {
                debug!("Change stream closed, stopping watch on {}", target);
                set_state(WatchState::Cancelled);
                return;
            }
            Some(Ok(change)) => {
                let doc = tree.read().await;
                change.node == doc.root() || doc.is_within(change.node, target)
            }
            // Missed notifications may have touched the target
            Some(Err(BroadcastStreamRecvError::Lagged(n))) => {
                debug!("Watch on {} lagged by {} notifications", target, n);
                true
            }
        };
        if !relevant {
            continue;
        }

        if let Some(map) = try_extract(&tree, target, &fence_tags, &normalizer).await {
            if cancel.is_cancelled() {
                debug!("Watch on {} cancelled before delivery", target);
                set_state(WatchState::Cancelled);
                return;
            }
            deliver(tx, map, target);
            set_state(WatchState::Delivered);
            return;
        }
    }
}

fn deliver(tx: oneshot::Sender<ThreadMap>, map: ThreadMap, target: NodeId) {
    info!("Thread map with {} entries found in {}", map.len(), target);
    if tx.send(map).is_err() {
        debug!("Thread map receiver for {} already dropped", target);
    }
}

async fn try_extract(
    tree: &LiveTree,
    target: NodeId,
    fence_tags: &[String],
    normalizer: &MarkupNormalizer,
) -> Option<ThreadMap> {
    let markup = {
        let doc = tree.read().await;
        if !doc.is_attached(target) {
            return None;
        }
        doc.inner_markup(target)
    };
    let text = normalizer.normalize(&markup);
    let payload = last_fenced_block(&text, fence_tags)?;
    match ThreadMap::parse(&payload) {
        Ok(map) => Some(map),
        Err(e) => {
            warn!("Fenced payload in {} is not a thread map yet: {}", target, e);
            None
        }
    }
}

/// Body of the last closed fenced block whose info string is one of `tags`.
pub fn last_fenced_block(text: &str, tags: &[String]) -> Option<String> {
    let mut found = None;
    let mut current: Option<(String, std::ops::Range<usize>)> = None;

    for (event, range) in Parser::new_ext(text, Options::empty()).into_offset_iter() {
        match event {
            Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(info))) => {
                let tag = info.split_whitespace().next().unwrap_or("").to_lowercase();
                if tags.iter().any(|t| t.eq_ignore_ascii_case(&tag)) {
                    current = Some((String::new(), range));
                }
            }
            Event::Text(body) => {
                if let Some((buf, _)) = current.as_mut() {
                    buf.push_str(&body);
                }
            }
            Event::End(TagEnd::CodeBlock) => {
                if let Some((body, span)) = current.take() {
                    // An unterminated fence runs to end of input; skip it
                    if is_closed_fence(&text[span]) {
                        found = Some(body);
                    }
                }
            }
            _ => {}
        }
    }
    found
}

fn is_closed_fence(block: &str) -> bool {
    let trimmed = block.trim_end();
    let mut lines = trimmed.lines();
    let Some(opening) = lines.next() else {
        return false;
    };
    let Some(closing) = lines.last() else {
        return false;
    };
    let fence = |line: &str, ch: char| line.trim_start().chars().take_while(|c| *c == ch).count();
    let (open_ch, open_len) = if fence(opening, '`') >= 3 {
        ('`', fence(opening, '`'))
    } else {
        ('~', fence(opening, '~'))
    };
    let closing = closing.trim();
    open_len >= 3
        && fence(closing, open_ch) >= open_len
        && closing.chars().all(|c| c == open_ch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Document, NodeSpec};
    use std::time::Duration;

    fn tags() -> Vec<String> {
        vec!["thread-map".to_string(), "json".to_string()]
    }

    #[test]
    fn test_last_closed_fence_wins() {
        let text = "intro\n\n```json\n{\"1\": \"A\"}\n```\n\n```thread-map\n{\"1\": \"B\"}\n```\n";
        assert_eq!(
            last_fenced_block(text, &tags()).as_deref(),
            Some("{\"1\": \"B\"}\n")
        );
    }

    #[test]
    fn test_unclosed_or_untagged_fences_are_ignored() {
        let open = "```thread-map\n{\"1\": \"A\"";
        assert_eq!(last_fenced_block(open, &tags()), None);
        let other = "```rust\nfn main() {}\n```\n";
        assert_eq!(last_fenced_block(other, &tags()), None);
    }

    fn answer_tree() -> (LiveTree, NodeId) {
        let doc = Document::from_specs([NodeSpec::new("div").id("answer")]);
        let target = doc.children(doc.root())[0];
        (LiveTree::new(doc), target)
    }

    fn code_block(body: &str) -> NodeSpec {
        NodeSpec::new("pre").child(
            NodeSpec::new("code")
                .class("language-thread-map")
                .text(body),
        )
    }

    #[tokio::test]
    async fn test_partial_then_complete_delivers_once() {
        let (tree, target) = answer_tree();
        let watcher = ResponseWatcher::new(tree.clone(), tags(), Arc::new(MarkupNormalizer::new()));
        let mut rx = watcher.arm(target);

        let pre = tree
            .append_child(target, code_block("{\"1\": \"Al"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(watcher.state(), Some(WatchState::Listening));

        tree.remove_children(pre).await;
        let code = tree
            .append_child(pre, NodeSpec::new("code").class("language-thread-map"))
            .await
            .unwrap();
        tree.set_text(code, "{\"1\": \"Alpha\"}").await;

        let map = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(map.get("1"), Some("Alpha"));
        watcher.join().await;
        assert_eq!(watcher.state(), Some(WatchState::Delivered));
    }

    #[tokio::test]
    async fn test_payload_present_when_armed() {
        let (tree, target) = answer_tree();
        tree.append_child(target, code_block("{\"2\": \"Beta\"}")).await;
        let watcher = ResponseWatcher::new(tree, tags(), Arc::new(MarkupNormalizer::new()));
        let map = watcher.arm(target).await.unwrap();
        assert_eq!(map.get("2"), Some("Beta"));
    }

    #[tokio::test]
    async fn test_rearm_cancels_previous_watch() {
        let (tree, target) = answer_tree();
        let watcher = ResponseWatcher::new(tree.clone(), tags(), Arc::new(MarkupNormalizer::new()));
        let first = watcher.arm(target);
        let _second = watcher.arm(target);
        assert!(first.await.is_err());

        watcher.cancel();
        watcher.join().await;
        assert_eq!(watcher.state(), Some(WatchState::Cancelled));
    }

    #[tokio::test]
    async fn test_replaced_watch_never_delivers() {
        let doc = Document::from_specs([
            NodeSpec::new("div")
                .id("old")
                .child(code_block("{\"1\": \"Stale\"}")),
            NodeSpec::new("div").id("new"),
        ]);
        let old = doc.children(doc.root())[0];
        let new = doc.children(doc.root())[1];
        let tree = LiveTree::new(doc);
        let watcher = ResponseWatcher::new(tree.clone(), tags(), Arc::new(MarkupNormalizer::new()));

        // The old target already holds a payload; re-arm before its task runs
        let first = watcher.arm(old);
        let second = watcher.arm(new);
        assert_eq!(watcher.target(), Some(new));
        assert!(first.await.is_err());

        tree.append_child(new, code_block("{\"1\": \"Fresh\"}")).await;
        let map = tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(map.get("1"), Some("Fresh"));
    }
}
