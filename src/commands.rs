//! Host command surface
//!
//! The host sends one JSON command per line (`{"action": "get-chat-info"}`)
//! and gets one JSON reply back. Long work (the climb, the response watch)
//! runs in background tasks and reports through [`HostEvent`]s.

use crate::analysis;
use crate::climber::{ClimbState, HistoryClimber};
use crate::location::ChatId;
use crate::markup::MarkupNormalizer;
use crate::progress::{HostEvent, ProgressPhase, ProgressReporter, RunContext};
use crate::store::{self, ChatStore};
use crate::tree::{Document, LiveTree, NodeId, NodeSpec};
use crate::watcher::ResponseWatcher;
use crate::{ClimbConfig, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A request from the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Command {
    GetChatInfo,
    ScrollToBottom,
    AnalyzeAndPrepare,
    LoadAnalysis,
    LoadAnalysisWithAlerts,
    OpenThreadInNewChat {
        #[serde(default)]
        thread_name: Option<String>,
    },
    GoToBranch {
        #[serde(default)]
        thread_name: Option<String>,
    },
    CancelAnalysis,
    SetLocation {
        location: String,
    },
    WatchResponse {
        node_id: String,
    },
    /// Append a subtree under `parentId`, or under the root when absent.
    AppendNode {
        #[serde(default)]
        parent_id: Option<String>,
        node: NodeSpec,
    },
    SetText {
        node_id: String,
        text: String,
    },
    SetAttr {
        node_id: String,
        name: String,
        value: String,
    },
    RemoveChildren {
        node_id: String,
    },
    /// Swap in a whole snapshot, one node or an array of nodes.
    ReplaceTree {
        snapshot: Value,
    },
}

impl Command {
    pub fn parse(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::GetChatInfo => "get-chat-info",
            Command::ScrollToBottom => "scroll-to-bottom",
            Command::AnalyzeAndPrepare => "analyze-and-prepare",
            Command::LoadAnalysis => "load-analysis",
            Command::LoadAnalysisWithAlerts => "load-analysis-with-alerts",
            Command::OpenThreadInNewChat { .. } => "open-thread-in-new-chat",
            Command::GoToBranch { .. } => "go-to-branch",
            Command::CancelAnalysis => "cancel-analysis",
            Command::SetLocation { .. } => "set-location",
            Command::WatchResponse { .. } => "watch-response",
            Command::AppendNode { .. } => "append-node",
            Command::SetText { .. } => "set-text",
            Command::SetAttr { .. } => "set-attr",
            Command::RemoveChildren { .. } => "remove-children",
            Command::ReplaceTree { .. } => "replace-tree",
        }
    }
}

/// Reply to `get-chat-info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatInfo {
    pub chat_id: Option<String>,
    pub has_analysis: bool,
    pub timestamp: Option<String>,
    pub is_new_chat: bool,
}

struct ActiveRun {
    ctx: RunContext,
    task: Option<JoinHandle<()>>,
}

/// Routes host commands to the climber, store, and watcher.
pub struct Dispatcher {
    tree: LiveTree,
    climber: Arc<HistoryClimber>,
    store: Arc<ChatStore>,
    location: Arc<RwLock<String>>,
    events: Option<mpsc::Sender<HostEvent>>,
    reporter: ProgressReporter,
    watcher: ResponseWatcher,
    run: Mutex<Option<ActiveRun>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        tree: LiveTree,
        config: &ClimbConfig,
        store: ChatStore,
        events: Option<mpsc::Sender<HostEvent>>,
    ) -> Result<Self> {
        let climber = HistoryClimber::new(tree.clone(), config)?;
        let watcher = ResponseWatcher::new(
            tree.clone(),
            config.fence_tags.clone(),
            Arc::new(MarkupNormalizer::new()),
        );
        Ok(Self {
            tree,
            climber: Arc::new(climber),
            store: Arc::new(store),
            location: Arc::new(RwLock::new(String::new())),
            reporter: ProgressReporter::new(events.clone()),
            events,
            watcher,
            run: Mutex::new(None),
            watch_task: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &ChatStore {
        &self.store
    }

    pub async fn set_location(&self, location: &str) {
        *self.location.write().await = location.to_string();
    }

    pub async fn chat_id(&self) -> Option<ChatId> {
        let location = self.location.read().await;
        self.climber.resolver().resolve(&location)
    }

    /// Handle one command and produce its reply.
    pub async fn handle(&self, command: Command) -> Value {
        debug!("Handling {}", command.name());
        match command {
            Command::GetChatInfo => match serde_json::to_value(self.chat_info().await) {
                Ok(info) => info,
                Err(e) => error_reply(&e.to_string()),
            },
            Command::ScrollToBottom => {
                if self.chat_id().await.is_some() {
                    self.reporter.emit(HostEvent::ScrollToBottom);
                } else {
                    debug!("No conversation open, not scrolling");
                }
                ok_reply()
            }
            Command::AnalyzeAndPrepare => self.start_analysis().await,
            Command::LoadAnalysis => self.load_analysis(false).await,
            Command::LoadAnalysisWithAlerts => self.load_analysis(true).await,
            Command::OpenThreadInNewChat { thread_name } => match thread_name {
                Some(name) => self.open_thread(&name).await,
                None => ignored("open-thread-in-new-chat"),
            },
            Command::GoToBranch { thread_name } => match thread_name {
                Some(name) => self.go_to_branch(&name).await,
                None => ignored("go-to-branch"),
            },
            Command::CancelAnalysis => {
                if let Some(run) = self.lock_run().as_ref() {
                    run.ctx.cancel();
                    info!("Cancellation requested for the running analysis");
                }
                json!({"status": "cancelled"})
            }
            Command::SetLocation { location } => {
                self.set_location(&location).await;
                let chat_id = self.chat_id().await;
                json!({"status": "ok", "chatId": chat_id})
            }
            Command::WatchResponse { node_id } => self.watch_response(&node_id).await,
            Command::AppendNode { parent_id, node } => {
                let parent = match &parent_id {
                    Some(id) => self.find_node(id).await,
                    None => Some(self.tree.read().await.root()),
                };
                let Some(parent) = parent else {
                    return not_found(parent_id.as_deref().unwrap_or_default());
                };
                match self.tree.append_child(parent, node).await {
                    Some(id) => {
                        let node_id = self.tree.read().await.stable_id(id);
                        json!({"status": "ok", "nodeId": node_id})
                    }
                    None => not_found(parent_id.as_deref().unwrap_or_default()),
                }
            }
            Command::SetText { node_id, text } => {
                let Some(id) = self.find_node(&node_id).await else {
                    return not_found(&node_id);
                };
                changed_reply(&node_id, self.tree.set_text(id, &text).await)
            }
            Command::SetAttr {
                node_id,
                name,
                value,
            } => {
                let Some(id) = self.find_node(&node_id).await else {
                    return not_found(&node_id);
                };
                changed_reply(&node_id, self.tree.set_attr(id, &name, &value).await)
            }
            Command::RemoveChildren { node_id } => {
                let Some(id) = self.find_node(&node_id).await else {
                    return not_found(&node_id);
                };
                changed_reply(&node_id, self.tree.remove_children(id).await)
            }
            Command::ReplaceTree { snapshot } => match Document::from_value(snapshot) {
                Ok(doc) => {
                    let nodes = doc.len();
                    self.tree.replace(doc).await;
                    info!("Tree replaced with {} nodes", nodes);
                    json!({"status": "ok", "nodes": nodes})
                }
                Err(e) => error_reply(&format!("bad snapshot: {}", e)),
            },
        }
    }

    /// Parse and handle one raw input line.
    pub async fn handle_line(&self, line: &str) -> Value {
        match Command::parse(line) {
            Ok(command) => self.handle(command).await,
            Err(e) => {
                warn!("Unrecognized command {:?}: {}", line, e);
                error_reply(&format!("unrecognized command: {}", e))
            }
        }
    }

    pub async fn chat_info(&self) -> ChatInfo {
        let Some(chat_id) = self.chat_id().await else {
            return ChatInfo {
                chat_id: None,
                has_analysis: false,
                timestamp: None,
                is_new_chat: true,
            };
        };
        let id = chat_id.as_str();
        let has_analysis = match self.store.load_thread_map(id).await {
            Ok(map) => map.is_some(),
            Err(e) => {
                warn!("Failed to read thread map for {}: {}", id, e);
                false
            }
        };
        let timestamp = match self.store.created_at(id).await {
            Ok(created) => created.map(|t| t.to_rfc3339()),
            Err(e) => {
                warn!("Failed to read creation time for {}: {}", id, e);
                None
            }
        };
        ChatInfo {
            chat_id: Some(id.to_string()),
            has_analysis,
            is_new_chat: !self.store.contains(&store::chat_history_key(id)),
            timestamp,
        }
    }

    async fn start_analysis(&self) -> Value {
        let mut run = self.lock_run();
        if run
            .as_ref()
            .and_then(|r| r.task.as_ref())
            .is_some_and(|t| !t.is_finished())
        {
            debug!("Analysis already running");
            return json!({"status": "busy"});
        }

        let ctx = RunContext::new(self.events.clone());
        let task = tokio::spawn(run_analysis(
            self.climber.clone(),
            self.store.clone(),
            self.location.clone(),
            ctx.clone(),
        ));
        *run = Some(ActiveRun {
            ctx,
            task: Some(task),
        });
        ok_reply()
    }

    /// Wait for the background analysis, if one was started.
    pub async fn wait_for_analysis(&self) {
        let task = self.lock_run().as_mut().and_then(|r| r.task.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Wait for the response watch started by `watch-response`, if any.
    pub async fn wait_for_watch(&self) {
        let task = self
            .watch_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Cancel background work and wait for it to stop.
    pub async fn shutdown(&self) {
        if let Some(run) = self.lock_run().as_ref() {
            run.ctx.cancel();
        }
        self.watcher.cancel();
        self.wait_for_analysis().await;
        self.wait_for_watch().await;
    }

    async fn load_analysis(&self, alerts: bool) -> Value {
        let Some(chat_id) = self.chat_id().await else {
            return self.failure("No conversation is open.", alerts);
        };
        match self.store.load_thread_map(chat_id.as_str()).await {
            Ok(Some(map)) => json!({
                "status": "ok",
                "chatId": chat_id,
                "threads": map.threads(),
                "threadMap": map,
            }),
            Ok(None) => {
                self.failure("No analysis found for this conversation yet.", alerts)
            }
            Err(e) => {
                warn!("Failed to load analysis for {}: {}", chat_id, e);
                self.failure("The stored analysis could not be read.", alerts)
            }
        }
    }

    async fn open_thread(&self, thread: &str) -> Value {
        let (transcript, ids) = match self.thread_turns(thread).await {
            Ok(found) => found,
            Err(message) => return error_reply(&message),
        };
        let turns: Vec<_> = transcript.iter().filter(|t| ids.contains(&t.id)).collect();
        let prompt = analysis::build_thread_prompt(thread, &turns);
        self.reporter.emit(HostEvent::OpenNewChat { prompt });
        json!({"status": "ok", "turns": turns.len()})
    }

    async fn go_to_branch(&self, thread: &str) -> Value {
        let ids = match self.thread_turns(thread).await {
            Ok((_, ids)) => ids,
            Err(message) => return error_reply(&message),
        };
        let Some(first) = ids.into_iter().next() else {
            return error_reply(&format!("thread '{}' has no turns", thread));
        };
        self.reporter.emit(HostEvent::ScrollTo {
            node_id: first.clone(),
        });
        json!({"status": "ok", "nodeId": first})
    }

    /// Stored transcript and the ids of the turns assigned to `thread`.
    async fn thread_turns(
        &self,
        thread: &str,
    ) -> std::result::Result<(crate::Transcript, Vec<String>), String> {
        let chat_id = self
            .chat_id()
            .await
            .ok_or_else(|| "no conversation is open".to_string())?;
        let id = chat_id.as_str();
        let transcript = self
            .store
            .load_history(id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("no stored history for {}", id))?;
        let map = self
            .store
            .load_thread_map(id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("no thread map for {}", id))?;
        let ids = map.turn_ids_for(thread, &transcript);
        if ids.is_empty() {
            return Err(format!("thread '{}' has no turns", thread));
        }
        Ok((transcript, ids))
    }

    async fn watch_response(&self, node_id: &str) -> Value {
        let Some(chat_id) = self.chat_id().await else {
            warn!("watch-response without a conversation id");
            return json!({"status": "ignored"});
        };
        let Some(target) = self.find_node(node_id).await else {
            warn!("watch-response target {} not found", node_id);
            return not_found(node_id);
        };

        if let Some(previous) = self.watcher.target() {
            debug!("Dropping response watch on {}", previous);
        }
        let rx = self.watcher.arm(target);
        let store = self.store.clone();
        let reporter = self.reporter.clone();
        let task = tokio::spawn(async move {
            let Ok(map) = rx.await else {
                debug!("Watch for {} ended without a thread map", chat_id);
                return;
            };
            if let Err(e) = store.save_thread_map(chat_id.as_str(), &map).await {
                warn!("Failed to save thread map for {}: {}", chat_id, e);
                return;
            }
            reporter.emit(HostEvent::ThreadMapReady {
                chat_id: chat_id.to_string(),
                threads: map.threads().len(),
            });
        });
        *self.watch_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        json!({"status": "ok", "nodeId": node_id})
    }

    /// Node whose stable id is `node_id`; the root answers to its own id too.
    async fn find_node(&self, node_id: &str) -> Option<NodeId> {
        let doc = self.tree.read().await;
        let root = doc.root();
        std::iter::once(root)
            .chain(doc.descendants(root))
            .find(|id| doc.stable_id(*id) == node_id)
    }

    fn failure(&self, message: &str, alerts: bool) -> Value {
        if alerts {
            self.reporter.emit(HostEvent::Alert {
                message: message.to_string(),
            });
        }
        error_reply(message)
    }

    fn lock_run(&self) -> std::sync::MutexGuard<'_, Option<ActiveRun>> {
        self.run.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Background body of `analyze-and-prepare`.
async fn run_analysis(
    climber: Arc<HistoryClimber>,
    store: Arc<ChatStore>,
    location: Arc<RwLock<String>>,
    ctx: RunContext,
) {
    ctx.progress().report(0, 1, ProgressPhase::Preparing);
    let location = location.read().await.clone();
    let report = climber.climb(&location, &ctx).await;

    if report.state == ClimbState::Cancelled {
        info!(
            "Analysis cancelled with {} turns collected, nothing saved",
            report.transcript.len()
        );
        return;
    }

    let chat_id = report.chat_id.as_ref().map(|id| id.to_string());
    let turns = report.transcript.len();
    if let (Some(id), false) = (&chat_id, report.transcript.is_empty()) {
        ctx.progress().report(0, 1, ProgressPhase::Saving);
        if let Err(e) = store.save_history(id, &report.transcript).await {
            warn!("Failed to save history for {}: {}", id, e);
        }
        ctx.progress().report(1, 1, ProgressPhase::Saving);
    }
    ctx.progress().report(1, 1, ProgressPhase::Complete);
    ctx.progress()
        .emit(HostEvent::AnalysisComplete { chat_id, turns });

    if turns > 0 {
        ctx.progress().emit(HostEvent::SubmitPrompt {
            prompt: analysis::build_prompt(&report.transcript),
        });
    }
}

fn ok_reply() -> Value {
    json!({"status": "ok"})
}

fn error_reply(message: &str) -> Value {
    json!({"status": "error", "message": message})
}

fn changed_reply(node_id: &str, changed: bool) -> Value {
    if changed {
        json!({"status": "ok", "nodeId": node_id})
    } else {
        not_found(node_id)
    }
}

fn not_found(node_id: &str) -> Value {
    error_reply(&format!("node {} not found", node_id))
}

fn ignored(action: &str) -> Value {
    warn!("{} requires threadName, ignoring", action);
    json!({"status": "ignored"})
}
