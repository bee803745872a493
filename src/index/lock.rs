//! # Index Lock
//!
//! Per-index reader/writer lock with a FIFO queue: many readers or one
//! writer. Consecutive readers at the head of the queue are released
//! together; a queued writer blocks every reader behind it, so writers
//! cannot starve behind a steady stream of reads.
//!
//! Built on `parking_lot`'s `Mutex` + `Condvar`. Guards release on drop.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct Waiter {
    id: u64,
    writer: bool,
}

#[derive(Debug, Default)]
struct LockState {
    active_readers: usize,
    writer_active: bool,
    queue: VecDeque<Waiter>,
    next_id: u64,
}

impl LockState {
    fn enqueue(&mut self, writer: bool) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.queue.push_back(Waiter { id, writer });
        id
    }

    fn remove(&mut self, id: u64) {
        if let Some(pos) = self.queue.iter().position(|w| w.id == id) {
            self.queue.remove(pos);
        }
    }

    /// A reader may go when no writer holds the lock and no writer is
    /// queued ahead of it.
    fn reader_may_go(&self, id: u64) -> bool {
        if self.writer_active {
            return false;
        }
        for waiter in &self.queue {
            if waiter.id == id {
                return true;
            }
            if waiter.writer {
                return false;
            }
        }
        false
    }

    /// A writer may go when it heads the queue and the lock is idle.
    fn writer_may_go(&self, id: u64) -> bool {
        !self.writer_active
            && self.active_readers == 0
            && self.queue.front().map(|w| w.id) == Some(id)
    }
}

#[derive(Debug, Default)]
pub struct IndexLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl IndexLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> ReadGuard<'_> {
        let mut state = self.state.lock();
        let id = state.enqueue(false);
        while !state.reader_may_go(id) {
            self.cond.wait(&mut state);
        }
        state.remove(id);
        state.active_readers += 1;
        ReadGuard { lock: self }
    }

    pub fn write(&self) -> WriteGuard<'_> {
        let mut state = self.state.lock();
        let id = state.enqueue(true);
        while !state.writer_may_go(id) {
            self.cond.wait(&mut state);
        }
        state.queue.pop_front();
        state.writer_active = true;
        WriteGuard { lock: self }
    }

    fn release_read(&self) {
        let mut state = self.state.lock();
        state.active_readers -= 1;
        drop(state);
        self.cond.notify_all();
    }

    fn release_write(&self) {
        let mut state = self.state.lock();
        state.writer_active = false;
        drop(state);
        self.cond.notify_all();
    }
}

pub struct ReadGuard<'a> {
    lock: &'a IndexLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

pub struct WriteGuard<'a> {
    lock: &'a IndexLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn readers_share_the_lock() {
        let lock = IndexLock::new();
        let r1 = lock.read();
        let r2 = lock.read();
        drop(r1);
        drop(r2);
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = Arc::new(IndexLock::new());
        let observed = Arc::new(AtomicUsize::new(0));

        let w = lock.write();
        let reader = {
            let lock = Arc::clone(&lock);
            let observed = Arc::clone(&observed);
            std::thread::spawn(move || {
                let _r = lock.read();
                observed.store(1, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(observed.load(Ordering::SeqCst), 0, "reader ran under writer");
        drop(w);
        reader.join().unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn queued_writer_blocks_later_readers() {
        let lock = Arc::new(IndexLock::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let r1 = lock.read();

        let writer = {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            std::thread::spawn(move || {
                let _w = lock.write();
                order.lock().push("writer");
            })
        };
        // Give the writer time to queue up.
        std::thread::sleep(Duration::from_millis(30));

        let late_reader = {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            std::thread::spawn(move || {
                let _r = lock.read();
                order.lock().push("late reader");
            })
        };
        std::thread::sleep(Duration::from_millis(30));

        drop(r1);
        writer.join().unwrap();
        late_reader.join().unwrap();

        let order = order.lock();
        assert_eq!(order.as_slice(), ["writer", "late reader"]);
    }
}
