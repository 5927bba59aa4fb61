//! Integration tests for Chatclimb

use chatclimb::progress::HostEvent;
use chatclimb::store;
use chatclimb::{
    ChatStore, ClimbConfig, ClimbState, Command, Dispatcher, Document, HistoryClimber, LiveTree,
    MarkupNormalizer, NodeSpec, ResponseWatcher, Role, RunContext, ThreadMap, WatchState,
};
use serde_json::json;
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

const LOCATION: &str = "https://chat.example.com/app/7d1e2f3a4b5c?hl=en";
const CHAT_ID: &str = "7d1e2f3a4b5c";

fn message(id: &str, role: &str, text: &str) -> NodeSpec {
    NodeSpec::new("div")
        .id(id)
        .class("conversation-turn")
        .attr("data-role", role)
        .child(
            NodeSpec::new("div")
                .class("markdown")
                .child(NodeSpec::new("p").text(text)),
        )
}

fn thinking(id: &str) -> NodeSpec {
    NodeSpec::new("div").id(id).class("conversation-turn").child(
        NodeSpec::new("div")
            .class("thoughts-container")
            .child(NodeSpec::new("p").text("Considering the greeting")),
    )
}

fn conversation(turns: Vec<NodeSpec>) -> Document {
    Document::from_specs([NodeSpec::new("main").children(turns)])
}

fn conversation_spec() -> NodeSpec {
    NodeSpec::new("main").children([message("a", "user", "hi"), message("c", "model", "hello")])
}

fn config() -> ClimbConfig {
    ClimbConfig::default()
        .with_wait_timeout(Duration::from_millis(500))
        .with_poll_interval(Duration::from_millis(10))
        .with_step_delay(Duration::from_millis(20))
}

fn texts(turns: &[chatclimb::Turn]) -> Vec<(Role, &str)> {
    turns
        .iter()
        .map(|t| (t.role, t.text_content.as_str()))
        .collect()
}

/// A thinking-only turn is dropped and never takes a position
#[tokio::test(start_paused = true)]
async fn test_three_node_scenario() {
    let tree = LiveTree::new(conversation(vec![
        message("a", "user", "hi"),
        thinking("b"),
        message("c", "model", "hello"),
    ]));
    let climber = HistoryClimber::new(tree, &config()).unwrap();
    let report = climber.climb(LOCATION, &RunContext::detached()).await;

    assert_eq!(report.state, ClimbState::Done);
    assert_eq!(report.chat_id.as_ref().map(|c| c.as_str()), Some(CHAT_ID));
    assert_eq!(report.visited, 3);
    assert_eq!(
        texts(&report.transcript),
        vec![(Role::User, "hi"), (Role::Model, "hello")]
    );
    assert!(report.transcript.iter().all(|t| !t.is_thinking_only));
}

#[tokio::test(start_paused = true)]
async fn test_climb_is_deterministic() {
    let tree = LiveTree::new(conversation(vec![
        message("a", "user", "What is a borrow checker?"),
        message("b", "model", "It enforces ownership rules."),
        message("c", "user", "Thanks"),
    ]));
    let climber = HistoryClimber::new(tree, &config()).unwrap();
    let first = climber.climb(LOCATION, &RunContext::detached()).await;
    let second = climber.climb(LOCATION, &RunContext::detached()).await;
    assert_eq!(first.transcript, second.transcript);
    assert_eq!(first.transcript.len(), 3);
}

/// Length bounded by the node count, oldest first, ids unique
#[tokio::test(start_paused = true)]
async fn test_transcript_is_ordered_and_unique() {
    let turns = vec![
        message("a", "user", "one"),
        thinking("t1"),
        message("b", "model", "two"),
        message("b", "model", "two again"),
        NodeSpec::new("div").id("empty").class("conversation-turn"),
        message("c", "user", "three"),
    ];
    let node_count = turns.len();
    let tree = LiveTree::new(conversation(turns));
    let climber = HistoryClimber::new(tree, &config()).unwrap();
    let report = climber.climb(LOCATION, &RunContext::detached()).await;

    assert!(report.transcript.len() <= node_count);
    let ids: Vec<&str> = report.transcript.iter().map(|t| t.id.as_str()).collect();
    let unique: HashSet<&str> = ids.iter().copied().collect();
    assert_eq!(unique.len(), ids.len());
    // Climbing backwards meets the later duplicate first, so it wins
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert_eq!(report.transcript[1].text_content, "two again");
}

/// Cancelling after k processed nodes keeps exactly those k turns
#[tokio::test(start_paused = true)]
async fn test_cancel_after_k_nodes() {
    let tree = LiveTree::new(conversation(vec![
        message("a", "user", "one"),
        message("b", "model", "two"),
        message("c", "user", "three"),
        message("d", "model", "four"),
        message("e", "user", "five"),
    ]));
    let climber = HistoryClimber::new(tree, &config()).unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    let ctx = RunContext::new(Some(tx));

    let canceller = async {
        while let Some(event) = rx.recv().await {
            if event == (HostEvent::UpdateProgress { count: 2 }) {
                ctx.cancel();
                break;
            }
        }
    };
    let (report, _) = tokio::join!(climber.climb(LOCATION, &ctx), canceller);

    assert_eq!(report.state, ClimbState::Cancelled);
    let ids: Vec<&str> = report.transcript.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["d", "e"]);
    assert!(ctx.state().cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_attachment_with_upload_time() {
    let tree = LiveTree::new(conversation(vec![NodeSpec::new("div")
        .id("a")
        .class("conversation-turn")
        .attr("data-role", "user")
        .children([
            NodeSpec::new("div")
                .class("file-reference")
                .child(NodeSpec::new("span").class("file-name").text("report.pdf")),
            NodeSpec::new("span").text("uploaded at 14:05"),
        ])]));
    let climber = HistoryClimber::new(tree, &config()).unwrap();
    let report = climber.climb(LOCATION, &RunContext::detached()).await;

    assert_eq!(report.transcript.len(), 1);
    let attachments = &report.transcript[0].attachments;
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0].name, "report.pdf");
    assert_eq!(attachments[0].kind, "pdf");
    assert!(attachments[0]
        .timestamp
        .as_deref()
        .is_some_and(|t| t.contains("14:05")));
}

/// Partial payload first, then a complete one: delivered exactly once
#[tokio::test]
async fn test_watcher_delivers_once() {
    let doc = Document::from_specs([NodeSpec::new("div").id("answer").child(
        NodeSpec::new("pre").child(NodeSpec::new("code").class("language-thread-map")),
    )]);
    let answer = doc.children(doc.root())[0];
    let code = doc.descendants(answer)[1];
    let tree = LiveTree::new(doc);
    let watcher = ResponseWatcher::new(
        tree.clone(),
        vec!["thread-map".to_string()],
        Arc::new(MarkupNormalizer::new()),
    );
    let rx = watcher.arm(answer);

    tree.set_text(code, "{\"1\": \"Al").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(watcher.state(), Some(WatchState::Listening));

    tree.set_text(code, "{\"1\": \"Alpha\"}").await;
    let map = tokio::time::timeout(Duration::from_secs(1), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(map.iter().collect::<Vec<_>>(), vec![("1", "Alpha")]);

    watcher.join().await;
    tree.set_text(code, "{\"1\": \"Beta\"}").await;
    assert_eq!(watcher.state(), Some(WatchState::Delivered));
}

/// Full host flow: analyze, persist, watch the answer, navigate threads
#[tokio::test]
async fn test_dispatcher_end_to_end() {
    let dir = TempDir::new().unwrap();
    let tree = LiveTree::new(conversation(vec![
        message("a", "user", "hi"),
        thinking("b"),
        message("c", "model", "hello"),
    ]));
    let store = ChatStore::new(dir.path()).await.unwrap();
    let (tx, mut rx) = mpsc::channel(256);
    let dispatcher = Dispatcher::new(tree.clone(), &config(), store, Some(tx)).unwrap();

    let reply = dispatcher
        .handle(Command::SetLocation {
            location: LOCATION.to_string(),
        })
        .await;
    assert_eq!(reply["chatId"], CHAT_ID);

    let info = dispatcher.handle(Command::GetChatInfo).await;
    assert_eq!(info["isNewChat"], true);
    assert_eq!(info["hasAnalysis"], false);

    assert_eq!(
        dispatcher.handle(Command::AnalyzeAndPrepare).await["status"],
        "ok"
    );
    dispatcher.wait_for_analysis().await;

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(events.contains(&HostEvent::AnalysisComplete {
        chat_id: Some(CHAT_ID.to_string()),
        turns: 2,
    }));
    let prompt = events
        .iter()
        .find_map(|e| match e {
            HostEvent::SubmitPrompt { prompt } => Some(prompt.clone()),
            _ => None,
        })
        .unwrap();
    assert!(prompt.contains("--- 1 (User) ---\nhi"));
    assert!(prompt.contains("--- 2 (Model) ---\nhello"));

    let history = dispatcher.store().load_history(CHAT_ID).await.unwrap().unwrap();
    assert_eq!(history.len(), 2);
    assert!(dispatcher.store().contains(&store::data_created_key(CHAT_ID)));

    let info = dispatcher.handle(Command::GetChatInfo).await;
    assert_eq!(info["isNewChat"], false);
    assert!(info["timestamp"].is_string());

    // The model answers the analysis prompt
    let root = tree.read().await.root();
    let answer = tree
        .append_child(root, NodeSpec::new("div").id("answer"))
        .await
        .unwrap();
    let reply = dispatcher
        .handle(Command::WatchResponse {
            node_id: "answer".to_string(),
        })
        .await;
    assert_eq!(reply["status"], "ok");
    tree.append_child(
        answer,
        NodeSpec::new("pre").child(
            NodeSpec::new("code")
                .class("language-thread-map")
                .text("{\"1\": \"Greetings\", \"2\": \"Replies\"}"),
        ),
    )
    .await;
    dispatcher.wait_for_watch().await;

    assert!(dispatcher.store().contains(&store::thread_map_key(CHAT_ID)));
    assert!(dispatcher.store().contains(store::LEGACY_THREAD_MAP));
    let info = dispatcher.handle(Command::GetChatInfo).await;
    assert_eq!(info["hasAnalysis"], true);

    let loaded = dispatcher.handle(Command::LoadAnalysis).await;
    assert_eq!(loaded["threads"], serde_json::json!(["Greetings", "Replies"]));

    let reply = dispatcher
        .handle(Command::GoToBranch {
            thread_name: Some("Replies".to_string()),
        })
        .await;
    assert_eq!(reply["nodeId"], "c");

    let reply = dispatcher
        .handle(Command::OpenThreadInNewChat {
            thread_name: Some("Greetings".to_string()),
        })
        .await;
    assert_eq!(reply["turns"], 1);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(events.contains(&HostEvent::ThreadMapReady {
        chat_id: CHAT_ID.to_string(),
        threads: 2,
    }));
    assert!(events.contains(&HostEvent::ScrollTo {
        node_id: "c".to_string()
    }));
    assert!(events.iter().any(|e| matches!(
        e,
        HostEvent::OpenNewChat { prompt } if prompt.contains("\"Greetings\"") && prompt.contains("hi")
    )));

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_dispatcher_without_chat_is_neutral() {
    let dir = TempDir::new().unwrap();
    let store = ChatStore::new(dir.path()).await.unwrap();
    let dispatcher =
        Dispatcher::new(LiveTree::new(Document::new()), &config(), store, None).unwrap();
    dispatcher.set_location("https://chat.example.com/app").await;

    let info = dispatcher.handle(Command::GetChatInfo).await;
    assert_eq!(info["chatId"], serde_json::Value::Null);

    dispatcher.handle(Command::AnalyzeAndPrepare).await;
    dispatcher.wait_for_analysis().await;
    assert!(dispatcher.store().keys().await.unwrap().is_empty());

    let reply = dispatcher.handle_line("{\"action\": \"cancel-analysis\"}").await;
    assert_eq!(reply["status"], "cancelled");
    let reply = dispatcher.handle_line("not json").await;
    assert_eq!(reply["status"], "error");
}

/// The host renders the conversation and streams the answer purely
/// through tree commands on the wire.
#[tokio::test]
async fn test_host_streams_answer_through_commands() {
    let dir = TempDir::new().unwrap();
    let store = ChatStore::new(dir.path()).await.unwrap();
    let (tx, mut rx) = mpsc::channel(256);
    let dispatcher =
        Dispatcher::new(LiveTree::new(Document::new()), &config(), store, Some(tx)).unwrap();

    let snapshot = serde_json::to_value(vec![conversation_spec()]).unwrap();
    let reply = dispatcher
        .handle_line(&json!({"action": "replace-tree", "snapshot": snapshot}).to_string())
        .await;
    assert_eq!(reply["status"], "ok");
    dispatcher
        .handle_line(&json!({"action": "set-location", "location": LOCATION}).to_string())
        .await;
    dispatcher
        .handle_line(r#"{"action": "analyze-and-prepare"}"#)
        .await;
    dispatcher.wait_for_analysis().await;
    assert_eq!(
        dispatcher.store().load_history(CHAT_ID).await.unwrap().unwrap().len(),
        2
    );

    let reply = dispatcher
        .handle_line(r#"{"action": "append-node", "node": {"tag": "div", "id": "answer"}}"#)
        .await;
    assert_eq!(reply, json!({"status": "ok", "nodeId": "answer"}));
    let reply = dispatcher
        .handle_line(r#"{"action": "watch-response", "nodeId": "answer"}"#)
        .await;
    assert_eq!(reply["status"], "ok");

    let partial = json!({
        "action": "append-node",
        "parentId": "answer",
        "node": {
            "tag": "pre",
            "children": [{
                "tag": "code",
                "id": "payload",
                "class": "language-thread-map",
                "text": "{\"1\": \"Gree"
            }]
        }
    });
    assert_eq!(dispatcher.handle_line(&partial.to_string()).await["status"], "ok");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!dispatcher.store().contains(&store::thread_map_key(CHAT_ID)));

    let complete = json!({
        "action": "set-text",
        "nodeId": "payload",
        "text": "{\"1\": \"Greetings\", \"2\": \"Replies\"}"
    });
    assert_eq!(dispatcher.handle_line(&complete.to_string()).await["status"], "ok");
    dispatcher.wait_for_watch().await;

    let info = dispatcher.handle(Command::GetChatInfo).await;
    assert_eq!(info["hasAnalysis"], true);
    let mut ready = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, HostEvent::ThreadMapReady { threads: 2, .. }) {
            ready += 1;
        }
    }
    assert_eq!(ready, 1);

    let reply = dispatcher
        .handle_line(r#"{"action": "remove-children", "nodeId": "missing"}"#)
        .await;
    assert_eq!(reply["status"], "error");
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_second_chat_does_not_inherit_first_analysis() {
    let dir = TempDir::new().unwrap();
    let tree = LiveTree::new(conversation(vec![
        message("a", "user", "hi"),
        message("c", "model", "hello"),
    ]));
    let store = ChatStore::new(dir.path()).await.unwrap();
    let dispatcher = Dispatcher::new(tree, &config(), store, None).unwrap();

    dispatcher.set_location(LOCATION).await;
    dispatcher.handle(Command::AnalyzeAndPrepare).await;
    dispatcher.wait_for_analysis().await;
    let map = ThreadMap::parse(r#"{"1": "Greetings"}"#).unwrap();
    dispatcher.store().save_thread_map(CHAT_ID, &map).await.unwrap();
    assert_eq!(dispatcher.handle(Command::GetChatInfo).await["hasAnalysis"], true);

    dispatcher
        .set_location("https://chat.example.com/app/99aa88bb77cc")
        .await;
    dispatcher.handle(Command::AnalyzeAndPrepare).await;
    dispatcher.wait_for_analysis().await;

    let info = dispatcher.handle(Command::GetChatInfo).await;
    assert_eq!(info["chatId"], "99aa88bb77cc");
    assert_eq!(info["isNewChat"], false);
    assert_eq!(info["hasAnalysis"], false);
    assert_eq!(dispatcher.handle(Command::LoadAnalysis).await["status"], "error");

    dispatcher.set_location(LOCATION).await;
    assert_eq!(dispatcher.handle(Command::GetChatInfo).await["hasAnalysis"], true);
}
