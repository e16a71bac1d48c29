use std::sync::{Condvar, Mutex, PoisonError};

// 同時に max 個までしか通さないセマフォ
pub struct Semaphore {
    mutex: Mutex<isize>,
    cond: Condvar,
    max: isize,
}

impl Semaphore {
    pub fn new(max: isize) -> Self {
        Semaphore {
            mutex: Mutex::new(0),
            cond: Condvar::new(),
            max,
        }
    }

    pub fn wait(&self) {
        let mut cnt = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        // カウントが上限に達していたら待機
        while *cnt >= self.max {
            cnt = self
                .cond
                .wait(cnt)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *cnt += 1;
    }

    pub fn post(&self) {
        let mut cnt = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        *cnt -= 1;
        self.cond.notify_one();
    }
}
