//! Run-scoped progress reporting and cooperative cancellation
//!
//! Each extraction run gets its own [`RunContext`]; nothing here is global,
//! so a new run starts with a fresh cancellation flag and progress record.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Named stage of a run; each maps to a sub-range of 0..=100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressPhase {
    Preparing,
    Climbing,
    Saving,
    Complete,
}

impl ProgressPhase {
    pub fn range(&self) -> (u8, u8) {
        match self {
            ProgressPhase::Preparing => (0, 15),
            ProgressPhase::Climbing => (15, 65),
            ProgressPhase::Saving => (65, 95),
            ProgressPhase::Complete => (100, 100),
        }
    }

    /// Overall percentage for `current` out of `total` within this phase.
    pub fn percent(&self, current: usize, total: usize) -> u8 {
        let (start, end) = self.range();
        if total == 0 {
            return start;
        }
        let span = (end - start) as usize;
        let done = current.min(total);
        start + (span * done / total) as u8
    }
}

/// Events pushed to whatever host listener is attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HostEvent {
    UpdateProgress {
        count: usize,
    },
    UpdateScrollProgress {
        current: usize,
        total: usize,
        phase: ProgressPhase,
        percent: u8,
    },
    AnalysisComplete {
        chat_id: Option<String>,
        turns: usize,
    },
    SubmitPrompt {
        prompt: String,
    },
    ThreadMapReady {
        chat_id: String,
        threads: usize,
    },
    ScrollTo {
        node_id: String,
    },
    ScrollToBottom,
    OpenNewChat {
        prompt: String,
    },
    Alert {
        message: String,
    },
}

/// Last reported position of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressState {
    pub phase: ProgressPhase,
    pub current: usize,
    pub total: usize,
    pub cancelled: bool,
}

/// Best-effort event forwarding. Without a listener every call is a no-op.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    sink: Option<mpsc::Sender<HostEvent>>,
    state: Arc<Mutex<(ProgressPhase, usize, usize)>>,
}

impl ProgressReporter {
    pub fn new(sink: Option<mpsc::Sender<HostEvent>>) -> Self {
        Self {
            sink,
            state: Arc::new(Mutex::new((ProgressPhase::Preparing, 0, 0))),
        }
    }

    pub fn report(&self, current: usize, total: usize, phase: ProgressPhase) {
        if let Ok(mut state) = self.state.lock() {
            *state = (phase, current, total);
        }
        self.emit(HostEvent::UpdateScrollProgress {
            current,
            total,
            phase,
            percent: phase.percent(current, total),
        });
    }

    /// Number of turns collected so far.
    pub fn count(&self, count: usize) {
        self.emit(HostEvent::UpdateProgress { count });
    }

    pub fn emit(&self, event: HostEvent) {
        let Some(sink) = &self.sink else {
            return;
        };
        if let Err(e) = sink.try_send(event) {
            debug!("Dropping host event: {}", e);
        }
    }

    fn position(&self) -> (ProgressPhase, usize, usize) {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or((ProgressPhase::Preparing, 0, 0))
    }
}

/// Everything one extraction run shares with its caller.
#[derive(Debug, Clone)]
pub struct RunContext {
    cancel: CancellationToken,
    progress: ProgressReporter,
}

impl RunContext {
    pub fn new(sink: Option<mpsc::Sender<HostEvent>>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            progress: ProgressReporter::new(sink),
        }
    }

    /// A context with no listener attached.
    pub fn detached() -> Self {
        Self::new(None)
    }

    /// Request a stop. Observed at the next loop boundary only.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Handle the host command layer can keep to cancel this run later.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    pub fn state(&self) -> ProgressState {
        let (phase, current, total) = self.progress.position();
        ProgressState {
            phase,
            current,
            total,
            cancelled: self.is_cancelled(),
        }
    }
}
