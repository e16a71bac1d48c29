use std::time::Duration;

use tracing::trace;

use crate::error::{Error, Result};
use crate::message::{Reply, WaiterRequest};

/// ウェイターが管理するフォークの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Taken { by: usize },
    // 左フォークを渡した瞬間に、同じ哲学者のために右フォークを確保しておく
    Reserved { for_philosopher: usize },
}

/// 哲学者ごとの連続した失敗の記録
///
/// `counter` が 0 のとき `first_at` には意味がない
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureInfo {
    counter: u32,
    first_at: Duration,
}

impl FailureInfo {
    pub fn is_actual(&self) -> bool {
        self.counter != 0
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    // 連続した失敗のうち最初のものの時刻
    pub fn first_at(&self) -> Option<Duration> {
        self.is_actual().then_some(self.first_at)
    }

    pub fn increment(&mut self, now: Duration) {
        if !self.is_actual() {
            self.first_at = now;
        }
        self.counter += 1;
    }

    pub fn clear(&mut self) {
        self.counter = 0;
    }

    /// `a` が `b` より優先されるなら true
    ///
    /// 両方とも失敗していれば、先に失敗し始めた方が優先
    pub fn has_greater_priority(a: &FailureInfo, b: &FailureInfo) -> bool {
        if a.is_actual() && b.is_actual() {
            a.first_at < b.first_at
        } else {
            a.is_actual()
        }
    }
}

/// 両隣と競合したときにどちらを優先するか
#[derive(Debug, Clone)]
pub enum Fairness {
    // 待ち行列で先に並んでいる方が勝つ
    Queue { wait_queue: Vec<usize> },
    // 長く待たされている方が勝つ
    Aging {
        threshold: Duration,
        failures: Vec<FailureInfo>,
    },
}

/// 全フォークの状態を1か所で管理する調停役
///
/// メッセージは1つずつ処理されることを前提にしている. 時刻は呼び出し側が渡す
#[derive(Debug, Clone)]
pub struct Waiter {
    forks: Vec<SlotState>,
    fairness: Fairness,
}

impl Waiter {
    pub fn with_queue(count: usize) -> Self {
        Waiter {
            forks: vec![SlotState::Free; count],
            fairness: Fairness::Queue {
                wait_queue: Vec::new(),
            },
        }
    }

    pub fn with_aging(count: usize, threshold: Duration) -> Self {
        Waiter {
            forks: vec![SlotState::Free; count],
            fairness: Fairness::Aging {
                threshold,
                failures: vec![FailureInfo::default(); count],
            },
        }
    }

    pub fn forks(&self) -> &[SlotState] {
        &self.forks
    }

    pub fn all_free(&self) -> bool {
        self.forks.iter().all(|s| *s == SlotState::Free)
    }

    pub fn wait_queue(&self) -> Option<&[usize]> {
        match &self.fairness {
            Fairness::Queue { wait_queue } => Some(wait_queue),
            Fairness::Aging { .. } => None,
        }
    }

    pub fn failure_info(&self, philosopher: usize) -> Option<&FailureInfo> {
        match &self.fairness {
            Fairness::Queue { .. } => None,
            Fairness::Aging { failures, .. } => failures.get(philosopher),
        }
    }

    /// 変換済みの要求を1つ処理し、返信が必要なら (宛先, 返信) を返す
    pub fn handle<A>(
        &mut self,
        request: WaiterRequest<A>,
        now: Duration,
    ) -> Result<Option<(A, Reply)>> {
        match request {
            WaiterRequest::Request {
                reply_to,
                philosopher,
                fork,
            } => {
                let reply = self.on_request(philosopher, fork, now)?;
                Ok(Some((reply_to, reply)))
            }
            WaiterRequest::Release { fork } => {
                self.on_release(fork)?;
                Ok(None)
            }
        }
    }

    pub fn on_request(&mut self, philosopher: usize, fork: usize, now: Duration) -> Result<Reply> {
        self.check_index(fork, Some(philosopher))?;
        if philosopher >= self.forks.len() {
            return Err(self.violation(fork, Some(philosopher), "unknown philosopher"));
        }

        // 左フォークの番号は哲学者の番号と同じ
        if fork == philosopher {
            Ok(self.take_left(philosopher, now))
        } else {
            self.take_right(philosopher, fork)?;
            Ok(Reply::Granted)
        }
    }

    pub fn on_release(&mut self, fork: usize) -> Result<()> {
        self.check_index(fork, None)?;
        match self.forks[fork] {
            SlotState::Taken { by } => {
                self.forks[fork] = SlotState::Free;
                trace!(fork, released_by = by, "fork free");
                Ok(())
            }
            // 確保は必ず消費されなければならない
            SlotState::Reserved { for_philosopher } => Err(self.violation(
                fork,
                Some(for_philosopher),
                "release of a reserved fork",
            )),
            SlotState::Free => Err(self.violation(fork, None, "release of a free fork")),
        }
    }

    fn take_left(&mut self, philosopher: usize, now: Duration) -> Reply {
        let count = self.forks.len();
        let left = philosopher;
        let right = (philosopher + 1) % count;
        let left_neighbor = (count + philosopher - 1) % count;
        let right_neighbor = right;

        // 両方空いていなければ食べられない
        let mut can_eat = self.forks[left] == SlotState::Free && self.forks[right] == SlotState::Free;

        if can_eat {
            can_eat = match &mut self.fairness {
                Fairness::Queue { wait_queue } => {
                    queue_allows(wait_queue, philosopher, left_neighbor, right_neighbor)
                }
                Fairness::Aging {
                    threshold,
                    failures,
                } => {
                    has_priority_over(failures, *threshold, philosopher, left_neighbor, now)
                        && has_priority_over(failures, *threshold, philosopher, right_neighbor, now)
                }
            };
        }

        if can_eat {
            if let Fairness::Aging { failures, .. } = &mut self.fairness {
                // 成功したので、これまでの失敗の記録はもう要らない
                failures[philosopher].clear();
            }
            self.forks[left] = SlotState::Taken { by: philosopher };
            self.forks[right] = SlotState::Reserved {
                for_philosopher: philosopher,
            };
            trace!(philosopher, left, right, "left fork taken, right fork reserved");
            Reply::Granted
        } else {
            match &mut self.fairness {
                Fairness::Queue { wait_queue } => {
                    if !wait_queue.contains(&philosopher) {
                        wait_queue.push(philosopher);
                    }
                }
                Fairness::Aging { failures, .. } => failures[philosopher].increment(now),
            }
            trace!(philosopher, left, right, "left fork denied");
            Reply::Denied
        }
    }

    fn take_right(&mut self, philosopher: usize, fork: usize) -> Result<()> {
        match self.forks[fork] {
            SlotState::Reserved { for_philosopher } if for_philosopher == philosopher => {
                self.forks[fork] = SlotState::Taken { by: philosopher };
                trace!(philosopher, fork, "reserved right fork taken");
                Ok(())
            }
            other => Err(self.violation(
                fork,
                Some(philosopher),
                &format!("unexpected state for right fork: {:?}", other),
            )),
        }
    }

    fn check_index(&self, fork: usize, philosopher: Option<usize>) -> Result<()> {
        if fork < self.forks.len() {
            Ok(())
        } else {
            Err(self.violation(fork, philosopher, "unknown fork"))
        }
    }

    fn violation(&self, fork: usize, philosopher: Option<usize>, detail: &str) -> Error {
        Error::ProtocolViolation {
            fork,
            philosopher,
            detail: detail.to_string(),
        }
    }
}

// 待ち行列を先頭から見ていき、両隣より先に自分が見つかれば食べてよい.
// 自分が見つかった場合は行列から外す. どちらも見つからなければ許可する
fn queue_allows(
    wait_queue: &mut Vec<usize>,
    philosopher: usize,
    left_neighbor: usize,
    right_neighbor: usize,
) -> bool {
    for (pos, &p) in wait_queue.iter().enumerate() {
        if p == philosopher {
            wait_queue.remove(pos);
            return true;
        }
        if p == left_neighbor || p == right_neighbor {
            return false;
        }
    }
    true
}

// 失敗してから threshold 以上たっている記録だけを考慮する
fn is_considered(info: &FailureInfo, threshold: Duration, now: Duration) -> bool {
    info.is_actual()
        && info
            .first_at
            .checked_add(threshold)
            .map_or(false, |since| since < now)
}

// requester が neighbor より優先されるなら true
fn has_priority_over(
    failures: &[FailureInfo],
    threshold: Duration,
    requester: usize,
    neighbor: usize,
    now: Duration,
) -> bool {
    let neighbor_info = &failures[neighbor];
    if !is_considered(neighbor_info, threshold, now) {
        return true;
    }

    let requester_info = &failures[requester];
    if is_considered(requester_info, threshold, now) {
        FailureInfo::has_greater_priority(requester_info, neighbor_info)
    } else {
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_left_grant_reserves_right() {
        let mut waiter = Waiter::with_queue(5);

        assert_eq!(waiter.on_request(1, 1, ms(0)).unwrap(), Reply::Granted);
        assert_eq!(waiter.forks()[1], SlotState::Taken { by: 1 });
        assert_eq!(
            waiter.forks()[2],
            SlotState::Reserved { for_philosopher: 1 }
        );

        assert_eq!(waiter.on_request(1, 2, ms(0)).unwrap(), Reply::Granted);
        assert_eq!(waiter.forks()[2], SlotState::Taken { by: 1 });

        waiter.on_release(2).unwrap();
        waiter.on_release(1).unwrap();
        assert!(waiter.all_free());
    }

    #[test]
    fn test_last_philosopher_wraps_around() {
        let mut waiter = Waiter::with_queue(3);
        assert_eq!(waiter.on_request(2, 2, ms(0)).unwrap(), Reply::Granted);
        assert_eq!(
            waiter.forks()[0],
            SlotState::Reserved { for_philosopher: 2 }
        );
        assert_eq!(waiter.on_request(2, 0, ms(0)).unwrap(), Reply::Granted);
    }

    #[test]
    fn test_right_request_without_reservation_is_violation() {
        let mut waiter = Waiter::with_queue(5);
        let err = waiter.on_request(1, 2, ms(0)).unwrap_err();
        assert!(matches!(
            err,
            Error::ProtocolViolation {
                fork: 2,
                philosopher: Some(1),
                ..
            }
        ));
    }

    #[test]
    fn test_reservation_belongs_to_one_philosopher() {
        let mut waiter = Waiter::with_queue(5);
        waiter.on_request(1, 1, ms(0)).unwrap();
        // 2 の左フォークは 1 のために確保されている
        assert_eq!(waiter.on_request(2, 2, ms(0)).unwrap(), Reply::Denied);
        // 他の哲学者がその確保を使うことはできない
        assert!(waiter.on_request(3, 2, ms(0)).is_err());
    }

    #[test]
    fn test_reserved_fork_cannot_be_released() {
        let mut waiter = Waiter::with_queue(5);
        waiter.on_request(0, 0, ms(0)).unwrap();
        assert!(waiter.on_release(1).is_err());
        assert!(waiter.on_release(3).is_err());
    }

    #[test]
    fn test_denied_philosopher_is_queued_once() {
        let mut waiter = Waiter::with_queue(5);
        waiter.on_request(0, 0, ms(0)).unwrap();

        assert_eq!(waiter.on_request(1, 1, ms(0)).unwrap(), Reply::Denied);
        assert_eq!(waiter.on_request(1, 1, ms(0)).unwrap(), Reply::Denied);
        assert_eq!(waiter.wait_queue().unwrap(), &[1]);
    }

    #[test]
    fn test_queue_earlier_neighbor_wins() {
        let mut waiter = Waiter::with_queue(5);
        // 0 が食べている間に 1 が並ぶ
        waiter.on_request(0, 0, ms(0)).unwrap();
        waiter.on_request(0, 1, ms(0)).unwrap();
        assert_eq!(waiter.on_request(1, 1, ms(0)).unwrap(), Reply::Denied);

        // 3 が食べている間に 2 が並ぶ
        waiter.on_request(3, 3, ms(0)).unwrap();
        waiter.on_request(3, 4, ms(0)).unwrap();
        assert_eq!(waiter.on_request(2, 2, ms(0)).unwrap(), Reply::Denied);
        assert_eq!(waiter.wait_queue().unwrap(), &[1, 2]);

        waiter.on_release(1).unwrap();
        waiter.on_release(0).unwrap();
        waiter.on_release(4).unwrap();
        waiter.on_release(3).unwrap();

        // フォークは全部空いているが、1 の方が先に並んだので 2 は待たされる
        assert_eq!(waiter.on_request(2, 2, ms(0)).unwrap(), Reply::Denied);
        assert_eq!(waiter.on_request(1, 1, ms(0)).unwrap(), Reply::Granted);
        assert_eq!(waiter.wait_queue().unwrap(), &[2]);
    }

    #[test]
    fn test_queue_self_behind_neighbor_stays_queued() {
        // 自分より前にいる隣人が見つかったら、自分は行列から外れず重複もしない
        let mut waiter = Waiter::with_queue(5);
        waiter.on_request(3, 3, ms(0)).unwrap();
        waiter.on_request(3, 4, ms(0)).unwrap();
        assert_eq!(waiter.on_request(2, 2, ms(0)).unwrap(), Reply::Denied);
        waiter.on_request(0, 0, ms(0)).unwrap();
        waiter.on_request(0, 1, ms(0)).unwrap();
        assert_eq!(waiter.on_request(1, 1, ms(0)).unwrap(), Reply::Denied);
        assert_eq!(waiter.wait_queue().unwrap(), &[2, 1]);

        waiter.on_release(1).unwrap();
        waiter.on_release(0).unwrap();
        waiter.on_release(4).unwrap();
        waiter.on_release(3).unwrap();

        // 2 が先にいるので 1 は待つ. 1 は2回並ばない
        assert_eq!(waiter.on_request(1, 1, ms(0)).unwrap(), Reply::Denied);
        assert_eq!(waiter.wait_queue().unwrap(), &[2, 1]);
        assert_eq!(waiter.on_request(2, 2, ms(0)).unwrap(), Reply::Granted);
        assert_eq!(waiter.wait_queue().unwrap(), &[1]);
    }

    #[test]
    fn test_failure_info_keeps_first_timestamp() {
        let mut info = FailureInfo::default();
        assert_eq!(info.first_at(), None);

        info.increment(ms(10));
        info.increment(ms(30));
        assert_eq!(info.counter(), 2);
        assert_eq!(info.first_at(), Some(ms(10)));

        info.clear();
        assert!(!info.is_actual());
        info.increment(ms(50));
        assert_eq!(info.first_at(), Some(ms(50)));
    }

    #[test]
    fn test_has_greater_priority() {
        let mut a = FailureInfo::default();
        let mut b = FailureInfo::default();
        assert!(!FailureInfo::has_greater_priority(&a, &b));

        a.increment(ms(5));
        assert!(FailureInfo::has_greater_priority(&a, &b));
        assert!(!FailureInfo::has_greater_priority(&b, &a));

        b.increment(ms(3));
        assert!(!FailureInfo::has_greater_priority(&a, &b));
        assert!(FailureInfo::has_greater_priority(&b, &a));
    }

    #[test]
    fn test_aging_records_and_clears_failures() {
        let mut waiter = Waiter::with_aging(5, ms(50));
        waiter.on_request(0, 0, ms(0)).unwrap();
        waiter.on_request(0, 1, ms(0)).unwrap();

        assert_eq!(waiter.on_request(1, 1, ms(10)).unwrap(), Reply::Denied);
        assert_eq!(waiter.on_request(1, 1, ms(20)).unwrap(), Reply::Denied);
        let info = waiter.failure_info(1).unwrap();
        assert_eq!(info.counter(), 2);
        assert_eq!(info.first_at(), Some(ms(10)));

        waiter.on_release(1).unwrap();
        waiter.on_release(0).unwrap();
        assert_eq!(waiter.on_request(1, 1, ms(30)).unwrap(), Reply::Granted);
        assert!(!waiter.failure_info(1).unwrap().is_actual());
    }

    #[test]
    fn test_aging_ignores_recent_failures() {
        let mut waiter = Waiter::with_aging(5, ms(50));
        waiter.on_request(0, 0, ms(0)).unwrap();
        waiter.on_request(0, 1, ms(0)).unwrap();
        assert_eq!(waiter.on_request(1, 1, ms(10)).unwrap(), Reply::Denied);
        waiter.on_release(1).unwrap();
        waiter.on_release(0).unwrap();

        // 1 の失敗からまだ threshold が過ぎていないので 2 が勝つ
        assert_eq!(waiter.on_request(2, 2, ms(40)).unwrap(), Reply::Granted);
    }

    #[test]
    fn test_aging_long_waiting_neighbor_wins() {
        let mut waiter = Waiter::with_aging(5, ms(50));
        waiter.on_request(0, 0, ms(0)).unwrap();
        waiter.on_request(0, 1, ms(0)).unwrap();
        assert_eq!(waiter.on_request(1, 1, ms(10)).unwrap(), Reply::Denied);
        waiter.on_release(1).unwrap();
        waiter.on_release(0).unwrap();

        // 1 は threshold 以上待たされているので、隣の 2 は譲る
        assert_eq!(waiter.on_request(2, 2, ms(100)).unwrap(), Reply::Denied);
        assert_eq!(waiter.on_request(0, 0, ms(100)).unwrap(), Reply::Denied);
        assert_eq!(waiter.on_request(1, 1, ms(101)).unwrap(), Reply::Granted);
    }

    #[test]
    fn test_aging_with_unbounded_threshold_never_escalates() {
        let mut waiter = Waiter::with_aging(3, Duration::MAX);
        waiter.on_request(0, 0, ms(0)).unwrap();
        waiter.on_request(0, 1, ms(0)).unwrap();
        assert_eq!(waiter.on_request(1, 1, ms(10)).unwrap(), Reply::Denied);
        waiter.on_release(1).unwrap();
        waiter.on_release(0).unwrap();

        // 1 の失敗はいつまでも考慮されない
        assert_eq!(waiter.on_request(2, 2, ms(100)).unwrap(), Reply::Granted);
    }

    #[test]
    fn test_aging_earlier_first_failure_wins() {
        let mut waiter = Waiter::with_aging(5, ms(50));
        // 0 と 3 が食べていて、1 と 2 が待たされる
        waiter.on_request(0, 0, ms(0)).unwrap();
        waiter.on_request(0, 1, ms(0)).unwrap();
        waiter.on_request(3, 3, ms(0)).unwrap();
        waiter.on_request(3, 4, ms(0)).unwrap();
        assert_eq!(waiter.on_request(2, 2, ms(5)).unwrap(), Reply::Denied);
        assert_eq!(waiter.on_request(1, 1, ms(8)).unwrap(), Reply::Denied);

        waiter.on_release(1).unwrap();
        waiter.on_release(0).unwrap();
        waiter.on_release(4).unwrap();
        waiter.on_release(3).unwrap();

        // 両方とも threshold を過ぎているので、先に失敗し始めた 2 が勝つ
        assert_eq!(waiter.on_request(1, 1, ms(200)).unwrap(), Reply::Denied);
        assert_eq!(waiter.on_request(2, 2, ms(201)).unwrap(), Reply::Granted);
    }

    #[test]
    fn test_handle_replies_to_requester() {
        let mut waiter = Waiter::with_queue(3);
        let r = waiter
            .handle(
                WaiterRequest::Request {
                    reply_to: "p0",
                    philosopher: 0,
                    fork: 0,
                },
                ms(0),
            )
            .unwrap();
        assert_eq!(r, Some(("p0", Reply::Granted)));

        let r = waiter
            .handle(WaiterRequest::<&str>::Release { fork: 0 }, ms(0))
            .unwrap();
        assert_eq!(r, None);
    }
}
