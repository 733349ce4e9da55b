//! Blocking synchronization primitives
//!
//! The kernel achieves atomicity with host mutexes standing in for the
//! interrupt-masked critical sections of a single-CPU scheduler; the
//! suspension points are unchanged: a P() on an empty semaphore, a
//! condition wait, and blocking device I/O.

use std::sync::{Condvar, Mutex};

/// Counting semaphore. P() blocks while the value is zero.
#[derive(Debug)]
pub struct Semaphore {
    value: Mutex<i32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: i32) -> Self {
        Self {
            value: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Wait until the value is positive, then decrement it.
    pub fn p(&self) {
        let mut value = self.value.lock().unwrap();
        while *value == 0 {
            value = self.cond.wait(value).unwrap();
        }
        *value -= 1;
    }

    /// Increment the value, waking one waiter if any.
    pub fn v(&self) {
        let mut value = self.value.lock().unwrap();
        *value += 1;
        self.cond.notify_one();
    }

    /// Current value; only meaningful to observers that know no P() can
    /// run concurrently (process migration freezes the sender first).
    pub fn value(&self) -> i32 {
        *self.value.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn semaphore_counts() {
        let sem = Semaphore::new(2);
        sem.p();
        sem.p();
        assert_eq!(sem.value(), 0);
        sem.v();
        assert_eq!(sem.value(), 1);
    }

    #[test]
    fn semaphore_blocks_until_posted() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = sem.clone();
            std::thread::spawn(move || {
                sem.p();
                42
            })
        };
        sem.v();
        assert_eq!(waiter.join().unwrap(), 42);
    }

    #[test]
    fn mutual_exclusion_counter() {
        // Two threads each do 500 P / increment / V rounds on a shared
        // counter protected by a binary semaphore.
        let sem = Arc::new(Semaphore::new(1));
        let counter = Arc::new(Mutex::new(0u32));
        let mut workers = Vec::new();
        for _ in 0..2 {
            let sem = sem.clone();
            let counter = counter.clone();
            workers.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    sem.p();
                    *counter.lock().unwrap() += 1;
                    sem.v();
                }
            }));
        }
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), 1000);
    }
}
