// スレッド間のメールボックス. 容量つきで、閉じることができる

use std::{
    collections::LinkedList,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

use crate::semaphore::Semaphore;

struct Inner<T> {
    buf: LinkedList<T>,
    closed: bool,
    senders: usize, // 0 になったら、残りを読み終えた受信側は None を受け取る
}

/// 閉じたチャネルへの送信. 送れなかった値を返す
#[derive(Debug)]
pub struct SendError<T>(pub T);

pub struct Sender<T> {
    semaphore: Arc<Semaphore>,   // 有限性を実現するセマフォ
    inner: Arc<Mutex<Inner<T>>>, // queue
    cond: Arc<Condvar>,
}

// T: Clone を要求しないように手で実装する
impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        lock(&self.inner).senders += 1;
        Sender {
            semaphore: self.semaphore.clone(),
            inner: self.inner.clone(),
            cond: self.cond.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let mut inner = lock(&self.inner);
        inner.senders -= 1;
        if inner.senders == 0 {
            self.cond.notify_all();
        }
    }
}

impl<T: Send> Sender<T> {
    // 満杯なら空きができるまでブロックする
    pub fn send(&self, data: T) -> Result<(), SendError<T>> {
        if lock(&self.inner).closed {
            return Err(SendError(data));
        }
        self.semaphore.wait();
        let mut inner = lock(&self.inner);
        if inner.closed {
            drop(inner);
            self.semaphore.post();
            return Err(SendError(data));
        }
        inner.buf.push_back(data);
        self.cond.notify_one();
        Ok(())
    }

    /// 閉じて、残っている中身は捨てる. 待っている受信側は None を受け取る
    pub fn close(&self) {
        close(&self.inner, &self.cond);
    }
}

pub struct Receiver<T> {
    semaphore: Arc<Semaphore>,
    inner: Arc<Mutex<Inner<T>>>,
    cond: Arc<Condvar>,
}

impl<T> Receiver<T> {
    // 閉じられるか送信側がいなくなるまでブロックして待つ
    pub fn recv(&self) -> Option<T> {
        let mut inner = lock(&self.inner);
        loop {
            if inner.closed {
                return None;
            }
            if let Some(data) = inner.buf.pop_front() {
                self.semaphore.post();
                return Some(data);
            }
            if inner.senders == 0 {
                return None;
            }
            inner = self
                .cond
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn close(&self) {
        close(&self.inner, &self.cond);
    }
}

fn lock<T>(inner: &Mutex<Inner<T>>) -> MutexGuard<'_, Inner<T>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

fn close<T>(inner: &Mutex<Inner<T>>, cond: &Condvar) {
    let mut inner = lock(inner);
    inner.closed = true;
    inner.buf.clear();
    cond.notify_all();
}

pub fn channel<T>(max: isize) -> (Sender<T>, Receiver<T>) {
    assert!(max > 0);
    let semaphore = Arc::new(Semaphore::new(max));
    let inner = Arc::new(Mutex::new(Inner {
        buf: LinkedList::new(),
        closed: false,
        senders: 1,
    }));
    let cond = Arc::new(Condvar::new());
    let tx = Sender {
        semaphore: semaphore.clone(),
        inner: inner.clone(),
        cond: cond.clone(),
    };
    let rx = Receiver {
        semaphore,
        inner,
        cond,
    };
    (tx, rx)
}
