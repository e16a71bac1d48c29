use std::collections::VecDeque;

use tracing::trace;

use crate::error::{Error, Result};
use crate::message::{ForkMessage, Reply};

/// 分散型フォークの状態. `Taken` は誰が持っているかを覚えておく
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkState {
    Free,
    Taken { by: usize },
}

/// 使用中のフォークに要求が来たときのふるまい
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkKind {
    // すぐに Denied を返す
    NonBlocking,
    // 待ち行列に入れて、解放されるまで返事をしない (ダイクストラ方式)
    Queued,
}

/// 自分の状態を自分で管理するフォーク
///
/// `A` は返信先のアドレス. 返信はメッセージ処理の戻り値として呼び出し側に返す
#[derive(Debug)]
pub struct Fork<A> {
    index: usize,
    kind: ForkKind,
    state: ForkState,
    wait_queue: VecDeque<(A, usize)>,
}

impl<A> Fork<A> {
    pub fn new(index: usize, kind: ForkKind) -> Self {
        Fork {
            index,
            kind,
            state: ForkState::Free,
            wait_queue: VecDeque::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> ForkKind {
        self.kind
    }

    pub fn state(&self) -> ForkState {
        self.state
    }

    // 待ち行列に並んでいる哲学者の番号
    pub fn waiting(&self) -> impl Iterator<Item = usize> + '_ {
        self.wait_queue.iter().map(|(_, p)| *p)
    }

    /// メッセージを1つ処理し、返信が必要なら (宛先, 返信) を返す
    pub fn handle(&mut self, message: ForkMessage<A>) -> Result<Option<(A, Reply)>> {
        match message {
            ForkMessage::Request {
                reply_to,
                philosopher,
            } => Ok(self.on_request(reply_to, philosopher)),
            ForkMessage::Release => self.on_release(),
        }
    }

    fn on_request(&mut self, reply_to: A, philosopher: usize) -> Option<(A, Reply)> {
        match (self.state, self.kind) {
            (ForkState::Free, _) => {
                self.state = ForkState::Taken { by: philosopher };
                trace!(fork = self.index, philosopher, "fork taken");
                Some((reply_to, Reply::Granted))
            }
            (ForkState::Taken { by }, ForkKind::NonBlocking) => {
                trace!(fork = self.index, philosopher, holder = by, "fork busy");
                Some((reply_to, Reply::Denied))
            }
            (ForkState::Taken { by }, ForkKind::Queued) => {
                // 返事をしないことが、要求した側をブロックさせる
                self.wait_queue.push_back((reply_to, philosopher));
                trace!(
                    fork = self.index,
                    philosopher,
                    holder = by,
                    queued = self.wait_queue.len(),
                    "fork busy, request queued"
                );
                None
            }
        }
    }

    fn on_release(&mut self) -> Result<Option<(A, Reply)>> {
        let ForkState::Taken { by } = self.state else {
            return Err(Error::ProtocolViolation {
                fork: self.index,
                philosopher: None,
                detail: "release of a free fork".to_string(),
            });
        };

        match self.wait_queue.pop_front() {
            None => {
                self.state = ForkState::Free;
                trace!(fork = self.index, released_by = by, "fork free");
                Ok(None)
            }
            Some((reply_to, philosopher)) => {
                // 空きにせず、そのまま次の哲学者に渡す
                self.state = ForkState::Taken { by: philosopher };
                trace!(
                    fork = self.index,
                    released_by = by,
                    philosopher,
                    "fork handed over"
                );
                Ok(Some((reply_to, Reply::Granted)))
            }
        }
    }
}
