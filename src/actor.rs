// 1人(1本)につき1つの tokio タスクで動かす実装

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::fork::Fork;
use crate::message::{Completion, ForkEnvelope, Reply, WaiterRequest};
use crate::observer::{CompletionSink, CompletionWatcher, RunSummary, TraceSink};
use crate::pause::PauseSource;
use crate::philosopher::{Action, Philosopher};
use crate::table::{Seat, TableConfig};
use crate::waiter::Waiter;

type ReplyTo = UnboundedSender<Reply>;
type ForkMailbox = UnboundedSender<ForkEnvelope<ReplyTo>>;

enum Notice {
    Done(Completion),
    Failed(Error),
}

#[derive(Clone)]
struct Control(UnboundedSender<Notice>);

impl Control {
    fn fail(&self, err: Error) {
        error!(%err, "task failed");
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

// パニックで終わったタスクの代わりに失敗を知らせる
struct PanicGuard {
    control: Control,
    who: String,
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.control
                .fail(Error::TaskFailed(format!("{} panicked", self.who)));
        }
    }
}

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
}

// 送信側がすべてなくなったら終わる
async fn fork_task(
    mut fork: Fork<ReplyTo>,
    mut rx: UnboundedReceiver<ForkEnvelope<ReplyTo>>,
    control: Control,
) {
    let _guard = PanicGuard {
        control: control.clone(),
        who: format!("fork {}", fork.index()),
    };
    while let Some(envelope) = rx.recv().await {
        match fork.handle(envelope.message) {
            Ok(Some((reply_to, reply))) => {
                if reply_to.send(reply).is_err() {
                    debug!(fork = fork.index(), "reply to a finished philosopher");
                }
            }
            Ok(None) => (),
            Err(err) => return control.fail(err),
        }
    }
}

async fn waiter_task(
    mut waiter: Waiter,
    mut rx: UnboundedReceiver<ForkEnvelope<ReplyTo>>,
    control: Control,
    start: Instant,
) {
    let _guard = PanicGuard {
        control: control.clone(),
        who: "waiter".to_string(),
    };
    while let Some(envelope) = rx.recv().await {
        match waiter.handle(WaiterRequest::from(envelope), start.elapsed()) {
            Ok(Some((reply_to, reply))) => {
                if reply_to.send(reply).is_err() {
                    debug!("reply to a finished philosopher");
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
    mailbox: UnboundedReceiver<Reply>,
    reply_to: ReplyTo,
    route: Route,
    trace: Arc<dyn TraceSink>,
    control: Control,
    start: Instant,
}

impl Diner {
    async fn run(mut self) {
        let _guard = PanicGuard {
            control: self.control.clone(),
            who: format!("philosopher {}", self.machine.index()),
        };
        if let Err(err) = self.dine().await {
            self.control.fail(err);
        }
    }

    async fn dine(&mut self) -> Result<()> {
        let mut actions = self.machine.start();
        loop {
            self.emit();
            let paused = self.perform(actions).await?;
            if self.machine.is_done() {
                return Ok(());
            }

            actions = if paused {
                self.machine.on_pause_elapsed()?
            } else {
                let reply = self.mailbox.recv().await.ok_or_else(|| Error::MailboxClosed {
                    owner: format!("philosopher {}", self.machine.index()),
                })?;
                self.machine.on_reply(reply)?
            };
        }
    }

    async fn perform(&mut self, actions: Vec<Action>) -> Result<bool> {
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
                    tokio::time::sleep(self.pauses.pause(pause)).await;
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
/// どこかのタスクが失敗したら残りのタスクを止めて最初のエラーを返す.
/// 成功したときはフォークのタスクが残りの解放を処理し終えるのを待つ
pub async fn run(config: &TableConfig, trace: Arc<dyn TraceSink>) -> Result<RunSummary> {
    config.validate()?;
    let start = Instant::now();
    let n = config.philosophers;
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    let control = Control(control_tx);

    let mut arbiters: Vec<JoinHandle<()>> = Vec::new();
    let route = match config.build_waiter() {
        Some(waiter) => {
            let (tx, rx) = mpsc::unbounded_channel();
            arbiters.push(tokio::spawn(waiter_task(waiter, rx, control.clone(), start)));
            Route::Waiter(tx)
        }
        None => {
            let forks = config.build_forks::<ReplyTo>().ok_or_else(|| {
                Error::InvalidConfig(format!("policy {:?} has no arbiter", config.policy))
            })?;
            let mut txs = Vec::with_capacity(n);
            for fork in forks {
                let (tx, rx) = mpsc::unbounded_channel();
                arbiters.push(tokio::spawn(fork_task(fork, rx, control.clone())));
                txs.push(tx);
            }
            Route::Forks(txs)
        }
    };

    let mut diners: Vec<JoinHandle<()>> = Vec::with_capacity(n);
    for seat in config.seats() {
        let i = seat.philosopher;
        let (reply_to, mailbox) = mpsc::unbounded_channel();
        let diner = Diner {
            machine: Philosopher::new(i, config.meals),
            seat,
            pauses: config.pauses_for(i),
            mailbox,
            reply_to,
            route: route.clone(),
            trace: trace.clone(),
            control: control.clone(),
            start,
        };
        diners.push(tokio::spawn(diner.run()));
    }
    // 以降の送信側はタスクが持っているものだけ
    drop(route);
    drop(control);

    let mut watcher = CompletionWatcher::new((0..n).map(|i| config.name(i)).collect());
    let mut failure = None;
    while !watcher.is_finished() {
        let result = match control_rx.recv().await {
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

    if failure.is_some() {
        diners.iter().chain(arbiters.iter()).for_each(JoinHandle::abort);
    }

    for joined in join_all(diners.into_iter().chain(arbiters)).await {
        if let Err(err) = joined {
            if !err.is_cancelled() && failure.is_none() {
                failure = Some(err.into());
            }
        }
    }

    // フォークやウェイターが最後の解放で失敗していないか
    if failure.is_none() {
        if let Ok(Notice::Failed(err)) = control_rx.try_recv() {
            failure = Some(err);
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
