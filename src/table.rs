use std::time::Duration;

use crate::error::{Error, Result};
use crate::fork::{Fork, ForkKind};
use crate::pause::{FixedPauses, PauseSource, RandomPauses};
use crate::philosopher::Side;
use crate::waiter::Waiter;

/// フォークの割り当て方
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Policy {
    // 各フォークが使用中なら即座に断る
    Simple,
    // 各フォークが待ち行列を持ち、1人だけ取る順番を逆にする
    Dijkstra,
    // ウェイターが待ち行列の順で許可する
    WaiterQueue,
    // ウェイターが長く待たされている方を優先する
    WaiterTimestamps,
}

impl Policy {
    pub fn uses_waiter(self) -> bool {
        matches!(self, Policy::WaiterQueue | Policy::WaiterTimestamps)
    }

    pub fn fork_kind(self) -> Option<ForkKind> {
        match self {
            Policy::Simple => Some(ForkKind::NonBlocking),
            Policy::Dijkstra => Some(ForkKind::Queued),
            Policy::WaiterQueue | Policy::WaiterTimestamps => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum PauseProfile {
    // シードと番号から決まる乱数
    Random,
    Fixed(FixedPauses),
}

/// 哲学者の席. どのフォークを左右として扱うか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seat {
    pub philosopher: usize,
    pub left: usize,
    pub right: usize,
}

impl Seat {
    pub fn fork(&self, side: Side) -> usize {
        match side {
            Side::Left => self.left,
            Side::Right => self.right,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TableConfig {
    pub philosophers: usize,
    pub meals: u32,
    pub policy: Policy,
    // この時間以上待たされている失敗だけを優先度に反映する
    pub failure_threshold: Duration,
    pub seed: u64,
    // 左右を逆に取る哲学者
    pub reversed: Option<usize>,
    pub pauses: PauseProfile,
    pub mailbox_capacity: usize,
    // シミュレーションで処理するイベント数の上限
    pub max_steps: u64,
    pub names: Vec<String>,
}

impl TableConfig {
    pub fn new(philosophers: usize, meals: u32, policy: Policy) -> Self {
        let reversed = match policy {
            Policy::Dijkstra => philosophers.checked_sub(1),
            _ => None,
        };
        TableConfig {
            philosophers,
            meals,
            policy,
            failure_threshold: Duration::from_millis(50),
            seed: 0,
            reversed,
            pauses: PauseProfile::Random,
            mailbox_capacity: 64,
            max_steps: 1_000_000,
            names: Vec::new(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: Duration) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_reversed(mut self, reversed: Option<usize>) -> Self {
        self.reversed = reversed;
        self
    }

    pub fn with_pauses(mut self, pauses: PauseProfile) -> Self {
        self.pauses = pauses;
        self
    }

    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_names(mut self, names: Vec<String>) -> Self {
        self.names = names;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.philosophers < 2 {
            return Err(Error::InvalidConfig(format!(
                "at least 2 philosophers are required, got {}",
                self.philosophers
            )));
        }
        if self.meals == 0 {
            return Err(Error::InvalidConfig("meals must be at least 1".to_string()));
        }
        if self.mailbox_capacity == 0 {
            return Err(Error::InvalidConfig(
                "mailbox capacity must be at least 1".to_string(),
            ));
        }
        if let Some(r) = self.reversed {
            if r >= self.philosophers {
                return Err(Error::InvalidConfig(format!(
                    "reversed philosopher {} is out of range 0..{}",
                    r, self.philosophers
                )));
            }
            // ウェイターは「左フォークの番号 == 哲学者の番号」を前提にしている
            if self.policy.uses_waiter() {
                return Err(Error::InvalidConfig(
                    "a reversed philosopher cannot be used with a waiter".to_string(),
                ));
            }
        }
        Ok(())
    }

    // i 番目の哲学者の左は i 番目、右は (i + 1) % N 番目のフォーク
    pub fn seats(&self) -> Vec<Seat> {
        let n = self.philosophers;
        (0..n)
            .map(|i| {
                let (left, right) = if self.reversed == Some(i) {
                    ((i + 1) % n, i)
                } else {
                    (i, (i + 1) % n)
                };
                Seat {
                    philosopher: i,
                    left,
                    right,
                }
            })
            .collect()
    }

    pub fn pauses_for(&self, philosopher: usize) -> Box<dyn PauseSource> {
        match self.pauses {
            PauseProfile::Random => Box::new(RandomPauses::new(self.seed, philosopher)),
            PauseProfile::Fixed(fixed) => Box::new(fixed),
        }
    }

    pub fn build_forks<A>(&self) -> Option<Vec<Fork<A>>> {
        let kind = self.policy.fork_kind()?;
        Some((0..self.philosophers).map(|i| Fork::new(i, kind)).collect())
    }

    pub fn build_waiter(&self) -> Option<Waiter> {
        match self.policy {
            Policy::WaiterQueue => Some(Waiter::with_queue(self.philosophers)),
            Policy::WaiterTimestamps => Some(Waiter::with_aging(
                self.philosophers,
                self.failure_threshold,
            )),
            Policy::Simple | Policy::Dijkstra => None,
        }
    }

    pub fn name(&self, philosopher: usize) -> String {
        self.names
            .get(philosopher)
            .cloned()
            .unwrap_or_else(|| format!("philosopher-{}", philosopher))
    }
}
