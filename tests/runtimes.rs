//! 実際のスレッドとタスクで短く動かす

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dining_philosophers::pause::FixedPauses;
use dining_philosophers::table::PauseProfile;
use dining_philosophers::{
    actor, csp, Error, PhilosopherState, Policy, RecordingTrace, TableConfig, TraceSink,
};

const POLICIES: [Policy; 4] = [
    Policy::Simple,
    Policy::Dijkstra,
    Policy::WaiterQueue,
    Policy::WaiterTimestamps,
];

fn quick(n: usize, meals: u32, policy: Policy) -> TableConfig {
    TableConfig::new(n, meals, policy).with_pauses(PauseProfile::Fixed(FixedPauses {
        think: Duration::from_millis(1),
        hungry: Duration::from_millis(1),
        eat: Duration::from_millis(1),
    }))
}

// 食べ終わった通知は解放より前に記録されるので、トレースの順で排他を確かめられる
fn assert_neighbors_never_eat_together(n: usize, trace: &RecordingTrace) {
    let mut eating = vec![false; n];
    for event in trace.events() {
        let p = event.philosopher;
        if event.state == PhilosopherState::Eating {
            assert!(!eating[(p + n - 1) % n] && !eating[(p + 1) % n]);
        }
        eating[p] = event.state == PhilosopherState::Eating;
    }
}

// 哲学者 0 が最初に食べ始めたところで一度だけパニックするトレース
#[derive(Default)]
struct FailingTrace {
    fired: AtomicBool,
}

impl TraceSink for FailingTrace {
    fn emit(&self, philosopher: usize, state: PhilosopherState, _at: Duration) {
        if philosopher == 0
            && state == PhilosopherState::Eating
            && !self.fired.swap(true, Ordering::SeqCst)
        {
            panic!("trace sink failed");
        }
    }
}

#[test]
fn test_csp_runs_every_policy() {
    for policy in POLICIES {
        let trace = Arc::new(RecordingTrace::new());
        let summary = csp::run(&quick(5, 3, policy).with_seed(1), trace.clone()).unwrap();
        assert_eq!(summary.completion_order.len(), 5, "{:?}", policy);
        assert_neighbors_never_eat_together(5, &trace);
    }
}

#[test]
fn test_csp_with_tiny_mailboxes() {
    let trace = Arc::new(RecordingTrace::new());
    let config = quick(3, 3, Policy::Dijkstra).with_mailbox_capacity(1);
    let summary = csp::run(&config, trace).unwrap();
    assert_eq!(summary.completion_order.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_actor_runs_every_policy() {
    for policy in POLICIES {
        let trace = Arc::new(RecordingTrace::new());
        let summary = actor::run(&quick(7, 3, policy).with_seed(2), trace.clone())
            .await
            .unwrap();
        assert_eq!(summary.completion_order.len(), 7, "{:?}", policy);
        assert_neighbors_never_eat_together(7, &trace);
    }
}

#[tokio::test]
async fn test_actor_with_random_pauses() {
    let trace = Arc::new(RecordingTrace::new());
    let config = TableConfig::new(5, 1, Policy::WaiterTimestamps)
        .with_failure_threshold(Duration::from_millis(20));
    let summary = actor::run(&config, trace.clone()).await.unwrap();

    let mut order = summary.completion_order;
    order.sort();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);
    for p in 0..5 {
        assert_eq!(trace.history(p).last(), Some(&PhilosopherState::Done));
    }
}

#[test]
fn test_csp_reports_a_panicking_philosopher() {
    for policy in POLICIES {
        let result = csp::run(&quick(3, 3, policy), Arc::new(FailingTrace::default()));
        assert!(matches!(result, Err(Error::TaskFailed(_))), "{:?}", policy);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_actor_reports_a_panicking_philosopher() {
    for policy in POLICIES {
        let result = actor::run(&quick(3, 3, policy), Arc::new(FailingTrace::default())).await;
        assert!(matches!(result, Err(Error::TaskFailed(_))), "{:?}", policy);
    }
}
