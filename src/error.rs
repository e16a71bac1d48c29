use std::time::Duration;

use crate::philosopher::PhilosopherState;

/// 実行中に起こりうるエラー
///
/// フォークが使用中 (`Busy`) なのは競合であってエラーではない
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // プロトコル違反は論理的な欠陥なので回復しない
    #[error("protocol violation on fork {fork} (philosopher {philosopher:?}): {detail}")]
    ProtocolViolation {
        fork: usize,
        philosopher: Option<usize>,
        detail: String,
    },

    #[error("philosopher {philosopher} got {reply} while {state}")]
    UnexpectedReply {
        philosopher: usize,
        state: PhilosopherState,
        reply: &'static str,
    },

    #[error("philosopher {philosopher} got a pause timeout while {state}")]
    UnexpectedEvent {
        philosopher: usize,
        state: PhilosopherState,
    },

    // 完了通知は1人1回だけ
    #[error("unexpected completion notice from philosopher {philosopher}")]
    UnexpectedCompletion { philosopher: usize },

    #[error("mailbox of {owner} closed before the run finished")]
    MailboxClosed { owner: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("simulation stalled after {steps} steps at {elapsed:?}: {done} of {total} philosophers done")]
    Stalled {
        steps: u64,
        elapsed: Duration,
        done: usize,
        total: usize,
    },

    #[error("task failed: {0}")]
    TaskFailed(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::TaskFailed(e.to_string())
    }
}
