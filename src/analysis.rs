//! Prompts injected into the conversation

use crate::climber::Turn;

/// First line of every injected analysis prompt
pub const PROMPT_MARKER: &str = "[chatclimb:analysis]";

/// Fence tag the analysis prompt asks the model to answer with
pub const THREAD_MAP_FENCE: &str = "thread-map";

const MAX_TURN_CHARS: usize = 2000;

pub const ANALYSIS_INSTRUCTIONS: &str = r#"Group the numbered messages below into thematic threads.
Reply with exactly one fenced code block tagged `thread-map` containing a JSON object that maps every message number to a short thread name, for example:

```thread-map
{"1": "Project setup", "2": "Project setup", "3": "Testing"}
```"#;

/// Whether a label is one of our own injected prompts.
pub fn looks_like_analysis_prompt(text: &str) -> bool {
    let text = text.trim_start();
    text.starts_with(PROMPT_MARKER) || text.contains(&format!("```{}", THREAD_MAP_FENCE))
}

/// Prompt asking the model to assign every turn to a thread.
pub fn build_prompt(transcript: &[Turn]) -> String {
    let mut prompt = format!("{}\n{}\n", PROMPT_MARKER, ANALYSIS_INSTRUCTIONS);
    for (i, turn) in transcript.iter().enumerate() {
        prompt.push('\n');
        prompt.push_str(&format_turn(i + 1, turn));
    }
    prompt
}

/// Prompt that carries one thread's turns into a new conversation.
pub fn build_thread_prompt(thread: &str, turns: &[&Turn]) -> String {
    let mut prompt = format!(
        "Let's continue the thread \"{}\" from an earlier conversation. Its messages so far:\n",
        thread
    );
    for (i, turn) in turns.iter().enumerate() {
        prompt.push('\n');
        prompt.push_str(&format_turn(i + 1, turn));
    }
    prompt
}

fn format_turn(number: usize, turn: &Turn) -> String {
    let body = if turn.rich_content.trim().is_empty() {
        turn.text_content.trim()
    } else {
        turn.rich_content.trim()
    };
    let mut text: String = body.chars().take(MAX_TURN_CHARS).collect();
    if body.chars().count() > MAX_TURN_CHARS {
        text.push_str(" [...]");
    }
    let mut block = format!("--- {} ({}) ---\n{}\n", number, turn.role, text);
    if !turn.attachments.is_empty() {
        let names: Vec<&str> = turn.attachments.iter().map(|a| a.name.as_str()).collect();
        block.push_str(&format!("Attachments: {}\n", names.join(", ")));
    }
    block
}
