use std::fmt;

use crate::error::{Error, Result};
use crate::message::Reply;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingKind {
    Normal,
    // フォークが取れなかった後の、短めの思索
    Hungry,
}

/// 哲学者の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhilosopherState {
    Thinking(ThinkingKind),
    WaitingLeft,
    WaitingRight,
    Eating,
    Done,
}

impl PhilosopherState {
    // トレース用の1文字
    pub fn symbol(self) -> char {
        match self {
            PhilosopherState::Thinking(ThinkingKind::Normal) => 't',
            PhilosopherState::Thinking(ThinkingKind::Hungry) => '.',
            PhilosopherState::WaitingLeft => 'L',
            PhilosopherState::WaitingRight => 'R',
            PhilosopherState::Eating => 'E',
            PhilosopherState::Done => 'q',
        }
    }
}

impl fmt::Display for PhilosopherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PhilosopherState::Thinking(ThinkingKind::Normal) => "thinking",
            PhilosopherState::Thinking(ThinkingKind::Hungry) => "hungry",
            PhilosopherState::WaitingLeft => "wait_left",
            PhilosopherState::WaitingRight => "wait_right",
            PhilosopherState::Eating => "eating",
            PhilosopherState::Done => "done",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pause {
    Think(ThinkingKind),
    Eat,
}

/// 状態遷移に伴って実行側がやるべきこと. 並んだ順に実行する
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Request(Side),
    Release(Side),
    // 指定の種類の休止が終わったら on_pause_elapsed を呼ぶ
    Pause(Pause),
    Complete,
}

/// 哲学者の状態機械
///
/// 入力は「休止が終わった」か「フォークから返信が来た」の2つだけで、
/// それぞれ新しい状態と実行すべき Action の列を返す. 待つこと自体は実行側の仕事
#[derive(Debug, Clone)]
pub struct Philosopher {
    index: usize,
    meals_target: u32,
    meals_eaten: u32,
    state: PhilosopherState,
}

impl Philosopher {
    pub fn new(index: usize, meals_target: u32) -> Self {
        Philosopher {
            index,
            meals_target,
            meals_eaten: 0,
            state: PhilosopherState::Thinking(ThinkingKind::Normal),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> PhilosopherState {
        self.state
    }

    pub fn meals_eaten(&self) -> u32 {
        self.meals_eaten
    }

    pub fn is_done(&self) -> bool {
        self.state == PhilosopherState::Done
    }

    pub fn start(&mut self) -> Vec<Action> {
        if self.meals_eaten >= self.meals_target {
            return self.finish();
        }
        self.think(ThinkingKind::Normal)
    }

    pub fn on_pause_elapsed(&mut self) -> Result<Vec<Action>> {
        match self.state {
            PhilosopherState::Thinking(_) => {
                self.state = PhilosopherState::WaitingLeft;
                Ok(vec![Action::Request(Side::Left)])
            }
            PhilosopherState::Eating => {
                self.meals_eaten += 1;
                let mut actions = vec![Action::Release(Side::Right), Action::Release(Side::Left)];
                if self.meals_eaten >= self.meals_target {
                    actions.extend(self.finish());
                } else {
                    actions.extend(self.think(ThinkingKind::Normal));
                }
                Ok(actions)
            }
            state => Err(Error::UnexpectedEvent {
                philosopher: self.index,
                state,
            }),
        }
    }

    pub fn on_reply(&mut self, reply: Reply) -> Result<Vec<Action>> {
        match (self.state, reply) {
            (PhilosopherState::WaitingLeft, Reply::Granted) => {
                self.state = PhilosopherState::WaitingRight;
                Ok(vec![Action::Request(Side::Right)])
            }
            (PhilosopherState::WaitingLeft, Reply::Denied) => Ok(self.think(ThinkingKind::Hungry)),
            (PhilosopherState::WaitingRight, Reply::Granted) => {
                self.state = PhilosopherState::Eating;
                Ok(vec![Action::Pause(Pause::Eat)])
            }
            (PhilosopherState::WaitingRight, Reply::Denied) => {
                // 左だけ持ち続けることはしない
                let mut actions = vec![Action::Release(Side::Left)];
                actions.extend(self.think(ThinkingKind::Hungry));
                Ok(actions)
            }
            (state, reply) => Err(Error::UnexpectedReply {
                philosopher: self.index,
                state,
                reply: reply.name(),
            }),
        }
    }

    fn think(&mut self, kind: ThinkingKind) -> Vec<Action> {
        self.state = PhilosopherState::Thinking(kind);
        vec![Action::Pause(Pause::Think(kind))]
    }

    fn finish(&mut self) -> Vec<Action> {
        self.state = PhilosopherState::Done;
        vec![Action::Complete]
    }
}
