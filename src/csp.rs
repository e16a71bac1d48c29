// 1人(1本)につき1スレッドで動かす実装.
// メールボックスは channel モジュールのブロッキングチャネル

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::channel::{channel, Receiver, Sender};
use crate::error::{Error, Result};
use crate::fork::Fork;
use crate::message::{Completion, ForkEnvelope, Reply, WaiterRequest};
use crate::observer::{CompletionSink, CompletionWatcher, RunSummary, TraceSink};
use crate::pause::PauseSource;
use crate::philosopher::{Action, Philosopher};
use crate::table::{Seat, TableConfig};
use crate::waiter::Waiter;

type ReplyTo = Sender<Reply>;
type ForkMailbox = Sender<ForkEnvelope<ReplyTo>>;

// 実行を見張るスレッドへの通知
enum Notice {
    Done(Completion),
    Failed(Error),
}

#[derive(Clone)]
struct Control(Sender<Notice>);

impl Control {
    fn fail(&self, err: Error) {
        error!(%err, "entity failed");
        // 見張り役がもう聞いていないなら何もしない
        let _ = self.0.send(Notice::Failed(err));
    }
}

impl CompletionSink for Control {
    fn notify(&self, philosopher: usize) {
        if self.0.send(Notice::Done(Completion { philosopher })).is_err() {
            warn!(philosopher, "completion notice dropped");
        }
    }
}

// パニックで抜けたスレッドの代わりに見張り役へ失敗を知らせる
struct PanicGuard {
    control: Control,
    who: String,
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.control
                .fail(Error::TaskFailed(format!("{} panicked", self.who)));
        }
    }
}

/// 哲学者からフォークへの経路.
/// フォークごとのメールボックスか、ウェイター1つ
#[derive(Clone)]
enum Route {
    Forks(Vec<ForkMailbox>),
    Waiter(ForkMailbox),
}

impl Route {
    fn send(&self, envelope: ForkEnvelope<ReplyTo>) -> Result<()> {
        let fork = envelope.fork;
        let tx = match self {
            Route::Forks(txs) => txs.get(fork),
            Route::Waiter(tx) => Some(tx),
        };
        let closed = || Error::MailboxClosed {
            owner: format!("fork {}", fork),
        };
        tx.ok_or_else(closed)?.send(envelope).map_err(|_| closed())
    }

    fn close(&self) {
        match self {
            Route::Forks(txs) => txs.iter().for_each(Sender::close),
            Route::Waiter(tx) => tx.close(),
        }
    }
}

fn fork_process(mut fork: Fork<ReplyTo>, rx: Receiver<ForkEnvelope<ReplyTo>>, control: Control) {
    let _guard = PanicGuard {
        control: control.clone(),
        who: format!("fork {}", fork.index()),
    };
    while let Some(envelope) = rx.recv() {
        match fork.handle(envelope.message) {
            Ok(Some((reply_to, reply))) => {
                if reply_to.send(reply).is_err() {
                    debug!(fork = fork.index(), "reply to a closed mailbox");
                }
            }
            Ok(None) => (),
            Err(err) => return control.fail(err),
        }
    }
}

fn waiter_process(
    mut waiter: Waiter,
    rx: Receiver<ForkEnvelope<ReplyTo>>,
    control: Control,
    start: Instant,
) {
    let _guard = PanicGuard {
        control: control.clone(),
        who: "waiter".to_string(),
    };
    while let Some(envelope) = rx.recv() {
        match waiter.handle(WaiterRequest::from(envelope), start.elapsed()) {
            Ok(Some((reply_to, reply))) => {
                if reply_to.send(reply).is_err() {
                    debug!("reply to a closed mailbox");
                }
            }
            Ok(None) => (),
            Err(err) => return control.fail(err),
        }
    }
}

struct Diner {
    machine: Philosopher,
    seat: Seat,
    pauses: Box<dyn PauseSource>,
    mailbox: Receiver<Reply>,
    reply_to: ReplyTo,
    route: Route,
    trace: Arc<dyn TraceSink>,
    control: Control,
    start: Instant,
}

impl Diner {
    fn run(mut self) {
        let _guard = PanicGuard {
            control: self.control.clone(),
            who: format!("philosopher {}", self.machine.index()),
        };
        if let Err(err) = self.dine() {
            self.control.fail(err);
        }
    }

    fn dine(&mut self) -> Result<()> {
        let mut actions = self.machine.start();
        loop {
            self.emit();
            let paused = self.perform(actions)?;
            if self.machine.is_done() {
                return Ok(());
            }

            actions = if paused {
                self.machine.on_pause_elapsed()?
            } else {
                // 要求を出したので返信を待つ
                let reply = self.mailbox.recv().ok_or_else(|| Error::MailboxClosed {
                    owner: format!("philosopher {}", self.machine.index()),
                })?;
                self.machine.on_reply(reply)?
            };
        }
    }

    // 休止したら true
    fn perform(&mut self, actions: Vec<Action>) -> Result<bool> {
        let p = self.machine.index();
        let mut paused = false;
        for action in actions {
            match action {
                Action::Request(side) => self.route.send(ForkEnvelope::request(
                    self.seat.fork(side),
                    self.reply_to.clone(),
                    p,
                ))?,
                Action::Release(side) => self
                    .route
                    .send(ForkEnvelope::release(self.seat.fork(side)))?,
                Action::Pause(pause) => {
                    thread::sleep(self.pauses.pause(pause));
                    paused = true;
                }
                Action::Complete => self.control.notify(p),
            }
        }
        Ok(paused)
    }

    fn emit(&self) {
        self.trace.emit(
            self.machine.index(),
            self.machine.state(),
            self.start.elapsed(),
        );
    }
}

/// 全員が規定回数食べ終わるまで動かす
///
/// 終了時は全員の完了を待ってから哲学者のスレッドを join し、
/// その後でフォークのメールボックスを閉じる(残っているメッセージは捨てる)
pub fn run(config: &TableConfig, trace: Arc<dyn TraceSink>) -> Result<RunSummary> {
    config.validate()?;
    let start = Instant::now();
    let n = config.philosophers;
    let cap = config.mailbox_capacity;

    // 哲学者は完了と失敗を1回ずつ、フォークとウェイターは失敗を1回だけ送る
    let (control_tx, control_rx) = channel::<Notice>((3 * n + 1 + cap) as isize);

    let mut arbiters = Vec::new();
    let route = match config.build_waiter() {
        Some(waiter) => {
            // 1人あたり解放2つと要求1つまで
            let (tx, rx) = channel(cap.max(3 * n) as isize);
            let control = Control(control_tx.clone());
            arbiters.push(thread::spawn(move || {
                waiter_process(waiter, rx, control, start)
            }));
            Route::Waiter(tx)
        }
        None => {
            let forks = config.build_forks::<ReplyTo>().ok_or_else(|| {
                Error::InvalidConfig(format!("policy {:?} has no arbiter", config.policy))
            })?;
            let mut txs = Vec::with_capacity(n);
            for fork in forks {
                // 両隣から解放と要求が1つずつ
                let (tx, rx) = channel(cap.max(4) as isize);
                let control = Control(control_tx.clone());
                arbiters.push(thread::spawn(move || fork_process(fork, rx, control)));
                txs.push(tx);
            }
            Route::Forks(txs)
        }
    };

    let mut mailboxes = Vec::with_capacity(n);
    let mut diners: Vec<JoinHandle<()>> = Vec::with_capacity(n);
    for seat in config.seats() {
        let i = seat.philosopher;
        let (reply_to, mailbox) = channel(cap as isize);
        mailboxes.push(reply_to.clone());
        let diner = Diner {
            machine: Philosopher::new(i, config.meals),
            seat,
            pauses: config.pauses_for(i),
            mailbox,
            reply_to,
            route: route.clone(),
            trace: trace.clone(),
            control: Control(control_tx.clone()),
            start,
        };
        diners.push(thread::spawn(move || diner.run()));
    }

    // 以降の送信側はスレッドが持っているものだけ
    drop(control_tx);

    let mut watcher = CompletionWatcher::new((0..n).map(|i| config.name(i)).collect());
    let mut failure = None;
    while !watcher.is_finished() {
        let result = match control_rx.recv() {
            Some(Notice::Done(completion)) => watcher.record(completion),
            Some(Notice::Failed(err)) => Err(err),
            None => Err(Error::MailboxClosed {
                owner: "control".to_string(),
            }),
        };
        if let Err(err) = result {
            failure = Some(err);
            break;
        }
    }
    control_rx.close();

    if failure.is_some() {
        // 待っている哲学者を起こして終わらせる
        mailboxes.iter().for_each(Sender::close);
        route.close();
    }

    for handle in diners {
        if handle.join().is_err() && failure.is_none() {
            failure = Some(Error::TaskFailed("philosopher thread panicked".to_string()));
        }
    }

    route.close();
    for handle in arbiters {
        if handle.join().is_err() && failure.is_none() {
            failure = Some(Error::TaskFailed("fork thread panicked".to_string()));
        }
    }

    match failure {
        Some(err) => Err(err),
        None => Ok(RunSummary {
            completion_order: watcher.into_order(),
            elapsed: start.elapsed(),
        }),
    }
}
