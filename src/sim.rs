// 1スレッドで全員を順番に動かすイベント駆動のシミュレーション.
// 時刻は仮想時間で、メッセージの配送は時間を消費しない.
// 同じ (送信者, 受信者) の間では送った順に届くが、それ以外の配送順と
// 同時刻のタイマーとの順序はシード付きの乱数で決める

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::fork::{Fork, ForkState};
use crate::message::{Completion, ForkEnvelope, Reply, WaiterRequest};
use crate::observer::{CompletionWatcher, RecordingTrace, TraceEvent, TraceSink};
use crate::pause::PauseSource;
use crate::philosopher::{Action, Philosopher};
use crate::table::{Seat, TableConfig};
use crate::waiter::Waiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Endpoint {
    Philosopher(usize),
    Fork(usize),
    Waiter,
}

#[derive(Debug)]
enum Payload {
    // 宛先のフォーク(またはウェイター)は arbiter の種類で決まる
    ToArbiter(ForkEnvelope<usize>),
    ToPhilosopher { philosopher: usize, reply: Reply },
}

#[derive(Debug)]
struct Envelope {
    from: Endpoint,
    to: Endpoint,
    payload: Payload,
}

enum Arbiter {
    Forks(Vec<Fork<usize>>),
    Waiter(Waiter),
}

impl Arbiter {
    fn all_free(&self) -> bool {
        match self {
            Arbiter::Forks(forks) => forks.iter().all(|f| f.state() == ForkState::Free),
            Arbiter::Waiter(waiter) => waiter.all_free(),
        }
    }
}

enum Event {
    Deliver(Envelope),
    PauseElapsed(usize),
}

/// シミュレーションの結果
#[derive(Debug, Clone)]
pub struct SimReport {
    pub steps: u64,
    pub elapsed: Duration,
    pub completion_order: Vec<usize>,
    pub forks_free: bool,
    pub trace: Vec<TraceEvent>,
}

pub struct Simulation {
    seats: Vec<Seat>,
    philosophers: Vec<Philosopher>,
    pauses: Vec<Box<dyn PauseSource>>,
    arbiter: Arbiter,
    in_flight: VecDeque<Envelope>,
    // (期限, 登録順, 哲学者)
    timers: BinaryHeap<Reverse<(Duration, u64, usize)>>,
    timer_seq: u64,
    now: Duration,
    steps: u64,
    max_steps: u64,
    rng: StdRng,
    // レポート用の記録と、呼び出し側から渡されたトレース
    recording: RecordingTrace,
    trace: Arc<dyn TraceSink>,
    watcher: CompletionWatcher,
}

impl Simulation {
    pub fn new(config: &TableConfig, trace: Arc<dyn TraceSink>) -> Result<Self> {
        config.validate()?;

        let arbiter = match config.build_waiter() {
            Some(waiter) => Arbiter::Waiter(waiter),
            None => match config.build_forks() {
                Some(forks) => Arbiter::Forks(forks),
                None => {
                    return Err(Error::InvalidConfig(format!(
                        "policy {:?} has no arbiter",
                        config.policy
                    )))
                }
            },
        };

        let n = config.philosophers;
        Ok(Simulation {
            seats: config.seats(),
            philosophers: (0..n).map(|i| Philosopher::new(i, config.meals)).collect(),
            pauses: (0..n).map(|i| config.pauses_for(i)).collect(),
            arbiter,
            in_flight: VecDeque::new(),
            timers: BinaryHeap::new(),
            timer_seq: 0,
            now: Duration::ZERO,
            steps: 0,
            max_steps: config.max_steps,
            rng: StdRng::seed_from_u64(config.seed),
            recording: RecordingTrace::new(),
            trace,
            watcher: CompletionWatcher::new((0..n).map(|i| config.name(i)).collect()),
        })
    }

    pub fn run(mut self) -> Result<SimReport> {
        for i in 0..self.philosophers.len() {
            let actions = self.philosophers[i].start();
            self.emit(i);
            self.perform(i, actions)?;
        }

        // 全員が終わっても、解放メッセージが届くまでは続ける
        while !(self.watcher.is_finished() && self.in_flight.is_empty()) {
            if self.steps >= self.max_steps {
                return Err(self.stalled());
            }
            self.steps += 1;

            match self.next_event() {
                Some(Event::Deliver(envelope)) => self.deliver(envelope)?,
                Some(Event::PauseElapsed(p)) => {
                    let actions = self.philosophers[p].on_pause_elapsed()?;
                    self.emit(p);
                    self.perform(p, actions)?;
                }
                None => {
                    // もう何も起きないのに終わっていない = デッドロック
                    let err = self.stalled();
                    warn!(%err, "no more events");
                    return Err(err);
                }
            }
        }

        debug!(steps = self.steps, elapsed = ?self.now, "simulation finished");
        Ok(SimReport {
            steps: self.steps,
            elapsed: self.now,
            forks_free: self.arbiter.all_free(),
            completion_order: self.watcher.into_order(),
            trace: self.recording.events(),
        })
    }

    fn next_event(&mut self) -> Option<Event> {
        // 各 (送信者, 受信者) の先頭のメッセージだけが配送の候補
        let mut seen = HashSet::new();
        let heads: Vec<usize> = self
            .in_flight
            .iter()
            .enumerate()
            .filter(|(_, e)| seen.insert((e.from, e.to)))
            .map(|(pos, _)| pos)
            .collect();

        let timer_due = matches!(self.timers.peek(), Some(Reverse((due, _, _))) if *due <= self.now);

        if heads.is_empty() {
            let Reverse((due, _, p)) = self.timers.pop()?;
            self.now = self.now.max(due);
            return Some(Event::PauseElapsed(p));
        }

        let pick = self.rng.gen_range(0..heads.len() + usize::from(timer_due));
        if pick == heads.len() {
            let Reverse((_, _, p)) = self.timers.pop()?;
            Some(Event::PauseElapsed(p))
        } else {
            self.in_flight.remove(heads[pick]).map(Event::Deliver)
        }
    }

    fn deliver(&mut self, envelope: Envelope) -> Result<()> {
        let Envelope { to, payload, .. } = envelope;
        let message = match payload {
            Payload::ToPhilosopher { philosopher, reply } => {
                let actions = self.philosophers[philosopher].on_reply(reply)?;
                self.emit(philosopher);
                return self.perform(philosopher, actions);
            }
            Payload::ToArbiter(message) => message,
        };

        let reply = match &mut self.arbiter {
            Arbiter::Forks(forks) => {
                let fork = message.fork;
                let Some(target) = forks.get_mut(fork) else {
                    return Err(Error::ProtocolViolation {
                        fork,
                        philosopher: None,
                        detail: "message for an unknown fork".to_string(),
                    });
                };
                target.handle(message.message)?
            }
            Arbiter::Waiter(waiter) => waiter.handle(WaiterRequest::from(message), self.now)?,
        };

        if let Some((philosopher, reply)) = reply {
            self.in_flight.push_back(Envelope {
                from: to,
                to: Endpoint::Philosopher(philosopher),
                payload: Payload::ToPhilosopher { philosopher, reply },
            });
        }
        Ok(())
    }

    fn perform(&mut self, p: usize, actions: Vec<Action>) -> Result<()> {
        let seat = self.seats[p];
        for action in actions {
            match action {
                Action::Request(side) => {
                    let fork = seat.fork(side);
                    self.send_to_fork(p, ForkEnvelope::request(fork, p, p));
                }
                Action::Release(side) => {
                    let fork = seat.fork(side);
                    self.send_to_fork(p, ForkEnvelope::release(fork));
                }
                Action::Pause(pause) => {
                    let due = self.now + self.pauses[p].pause(pause);
                    self.timer_seq += 1;
                    self.timers.push(Reverse((due, self.timer_seq, p)));
                }
                Action::Complete => self.watcher.record(Completion { philosopher: p })?,
            }
        }
        Ok(())
    }

    fn send_to_fork(&mut self, p: usize, envelope: ForkEnvelope<usize>) {
        let to = match self.arbiter {
            Arbiter::Forks(_) => Endpoint::Fork(envelope.fork),
            Arbiter::Waiter(_) => Endpoint::Waiter,
        };
        self.in_flight.push_back(Envelope {
            from: Endpoint::Philosopher(p),
            to,
            payload: Payload::ToArbiter(envelope),
        });
    }

    fn emit(&self, p: usize) {
        let state = self.philosophers[p].state();
        self.recording.emit(p, state, self.now);
        self.trace.emit(p, state, self.now);
    }

    fn stalled(&self) -> Error {
        Error::Stalled {
            steps: self.steps,
            elapsed: self.now,
            done: self.watcher.completed().len(),
            total: self.philosophers.len(),
        }
    }
}

/// 設定どおりに1回シミュレーションを走らせる
pub fn simulate(config: &TableConfig, trace: Arc<dyn TraceSink>) -> Result<SimReport> {
    Simulation::new(config, trace)?.run()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::observer::LogTrace;
    use crate::pause::FixedPauses;
    use crate::philosopher::PhilosopherState;
    use crate::table::{PauseProfile, Policy};

    fn fixed(ms: u64) -> PauseProfile {
        PauseProfile::Fixed(FixedPauses {
            think: Duration::from_millis(ms),
            hungry: Duration::from_millis(ms),
            eat: Duration::from_millis(ms),
        })
    }

    #[test]
    fn test_simulation_starts_everyone_thinking() {
        let config = TableConfig::new(3, 1, Policy::WaiterQueue);
        let mut sim = Simulation::new(&config, Arc::new(LogTrace)).unwrap();
        for i in 0..3 {
            let actions = sim.philosophers[i].start();
            sim.emit(i);
            sim.perform(i, actions).unwrap();
        }
        assert_eq!(sim.timers.len(), 3);
        assert!(sim.in_flight.is_empty());
        assert!(matches!(&sim.arbiter, Arbiter::Waiter(w) if w.all_free()));
    }

    #[test]
    fn test_single_meal_waiter_queue() {
        let config = TableConfig::new(5, 1, Policy::WaiterQueue).with_seed(9);
        let report = simulate(&config, Arc::new(LogTrace)).unwrap();

        let mut order = report.completion_order.clone();
        order.sort();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert!(report.forks_free);
        assert!(report
            .trace
            .iter()
            .filter(|e| e.state == PhilosopherState::Done)
            .count()
            == 5);
    }

    #[test]
    fn test_unreversed_queued_forks_can_deadlock() {
        // 全員同時に左を取ると、右を待ったまま誰も進めなくなる
        let stalled = (0..64).any(|seed| {
            let config = TableConfig::new(2, 3, Policy::Dijkstra)
                .with_reversed(None)
                .with_pauses(fixed(10))
                .with_seed(seed);
            matches!(simulate(&config, Arc::new(LogTrace)), Err(Error::Stalled { .. }))
        });
        assert!(stalled);
    }

    #[test]
    fn test_reversed_queued_forks_never_deadlock() {
        for seed in 0..64 {
            let config = TableConfig::new(2, 3, Policy::Dijkstra)
                .with_pauses(fixed(10))
                .with_seed(seed)
                .with_max_steps(10_000);
            let report = simulate(&config, Arc::new(LogTrace)).unwrap();
            assert_eq!(report.completion_order.len(), 2);
            assert!(report.forks_free);
        }
    }

    #[test]
    fn test_step_budget_is_enforced() {
        let config = TableConfig::new(5, 3, Policy::Simple).with_max_steps(10);
        assert!(matches!(
            simulate(&config, Arc::new(LogTrace)),
            Err(Error::Stalled { steps: 10, .. })
        ));
    }

    #[test]
    fn test_trace_sink_sees_every_transition() {
        let config = TableConfig::new(4, 2, Policy::WaiterTimestamps).with_seed(5);
        let sink = Arc::new(RecordingTrace::new());
        let report = simulate(&config, sink.clone()).unwrap();
        assert_eq!(sink.events(), report.trace);
    }

    #[test]
    fn test_message_for_unknown_fork_is_violation() {
        let config = TableConfig::new(3, 1, Policy::Simple);
        let mut sim = Simulation::new(&config, Arc::new(LogTrace)).unwrap();
        let err = sim
            .deliver(Envelope {
                from: Endpoint::Philosopher(0),
                to: Endpoint::Fork(7),
                payload: Payload::ToArbiter(ForkEnvelope::release(7)),
            })
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation { fork: 7, .. }));
    }
}
