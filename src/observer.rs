use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::message::Completion;
use crate::philosopher::PhilosopherState;

/// 状態遷移の通知先. コアは書き込むだけで読み返さない
pub trait TraceSink: Send + Sync {
    fn emit(&self, philosopher: usize, state: PhilosopherState, at: Duration);
}

/// 食事を終えた通知の送り先
pub trait CompletionSink {
    fn notify(&self, philosopher: usize);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEvent {
    pub philosopher: usize,
    pub state: PhilosopherState,
    pub at: Duration,
}

/// ログに流すだけのトレース
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTrace;

impl TraceSink for LogTrace {
    fn emit(&self, philosopher: usize, state: PhilosopherState, at: Duration) {
        debug!(
            philosopher,
            state = %state,
            symbol = %state.symbol(),
            at_ms = at.as_millis() as u64,
            "state changed"
        );
    }
}

/// 受け取った順にイベントを溜めておくトレース
#[derive(Debug, Default)]
pub struct RecordingTrace {
    events: Mutex<Vec<TraceEvent>>,
}

impl RecordingTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // 1人分の状態の並び
    pub fn history(&self, philosopher: usize) -> Vec<PhilosopherState> {
        self.events()
            .into_iter()
            .filter(|e| e.philosopher == philosopher)
            .map(|e| e.state)
            .collect()
    }
}

impl TraceSink for RecordingTrace {
    fn emit(&self, philosopher: usize, state: PhilosopherState, at: Duration) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(TraceEvent {
                philosopher,
                state,
                at,
            });
    }
}

/// 完了通知を数える. N 個そろえば終わり
#[derive(Debug)]
pub struct CompletionWatcher {
    names: Vec<String>,
    completed: Vec<usize>,
}

impl CompletionWatcher {
    pub fn new(names: Vec<String>) -> Self {
        CompletionWatcher {
            names,
            completed: Vec::new(),
        }
    }

    pub fn record(&mut self, completion: Completion) -> Result<()> {
        let philosopher = completion.philosopher;
        if philosopher >= self.names.len() || self.completed.contains(&philosopher) {
            return Err(Error::UnexpectedCompletion { philosopher });
        }
        self.completed.push(philosopher);
        info!(philosopher, "{}: done", self.names[philosopher]);
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.completed.len() == self.names.len()
    }

    pub fn completed(&self) -> &[usize] {
        &self.completed
    }

    pub fn into_order(self) -> Vec<usize> {
        self.completed
    }
}

/// 1回の実行の結果
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub completion_order: Vec<usize>,
    pub elapsed: Duration,
}
