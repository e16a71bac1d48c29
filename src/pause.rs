use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::philosopher::{Pause, ThinkingKind};

/// 思索と食事の時間を決めるもの
pub trait PauseSource: Send {
    fn think_pause(&mut self, kind: ThinkingKind) -> Duration;
    fn eat_pause(&mut self) -> Duration;

    fn pause(&mut self, pause: Pause) -> Duration {
        match pause {
            Pause::Think(kind) => self.think_pause(kind),
            Pause::Eat => self.eat_pause(),
        }
    }
}

/// 実行シードと哲学者の番号から決まる乱数で休止時間を決める
pub struct RandomPauses {
    rng: StdRng,
}

impl RandomPauses {
    pub fn new(seed: u64, philosopher: usize) -> Self {
        // 番号ごとに系列がずれるように混ぜる
        let mixed = seed ^ (philosopher as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        RandomPauses {
            rng: StdRng::seed_from_u64(mixed),
        }
    }

    fn millis(&mut self, low: u64, high: u64) -> Duration {
        Duration::from_millis(self.rng.gen_range(low..=high))
    }
}

impl PauseSource for RandomPauses {
    fn think_pause(&mut self, kind: ThinkingKind) -> Duration {
        match kind {
            ThinkingKind::Normal => self.millis(10, 60),
            ThinkingKind::Hungry => self.millis(10, 30),
        }
    }

    fn eat_pause(&mut self) -> Duration {
        self.millis(20, 80)
    }
}

/// 常に同じ時間だけ休む. 全員が同時に動き出す状況を作るのに使う
#[derive(Debug, Clone, Copy)]
pub struct FixedPauses {
    pub think: Duration,
    pub hungry: Duration,
    pub eat: Duration,
}

impl PauseSource for FixedPauses {
    fn think_pause(&mut self, kind: ThinkingKind) -> Duration {
        match kind {
            ThinkingKind::Normal => self.think,
            ThinkingKind::Hungry => self.hungry,
        }
    }

    fn eat_pause(&mut self) -> Duration {
        self.eat
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_random_pauses_are_reproducible() {
        let mut a = RandomPauses::new(42, 3);
        let mut b = RandomPauses::new(42, 3);
        for _ in 0..20 {
            assert_eq!(a.eat_pause(), b.eat_pause());
            assert_eq!(
                a.think_pause(ThinkingKind::Hungry),
                b.think_pause(ThinkingKind::Hungry)
            );
        }
    }

    #[test]
    fn test_random_pauses_stay_in_range() {
        let mut p = RandomPauses::new(7, 0);
        for _ in 0..200 {
            let t = p.think_pause(ThinkingKind::Normal).as_millis();
            assert!((10..=60).contains(&t));
            let h = p.think_pause(ThinkingKind::Hungry).as_millis();
            assert!((10..=30).contains(&h));
            let e = p.pause(Pause::Eat).as_millis();
            assert!((20..=80).contains(&e));
        }
    }

    #[test]
    fn test_philosophers_get_different_sequences() {
        let mut a = RandomPauses::new(1, 0);
        let mut b = RandomPauses::new(1, 1);
        let xs: Vec<_> = (0..10).map(|_| a.eat_pause()).collect();
        let ys: Vec<_> = (0..10).map(|_| b.eat_pause()).collect();
        assert_ne!(xs, ys);
    }
}
