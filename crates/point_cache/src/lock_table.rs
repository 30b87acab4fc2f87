//! Per-tile-path advisory locks.
//!
//! Only the cache takes these, around mutations of a tile's output buffer;
//! they serialize the initial coloring of a path against its recolors.
//! Waiters are signaled strictly in arrival order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, mpsc};

use point_protocol::TreePath;

#[derive(Debug, Default)]
struct TileLockState {
    waiters: VecDeque<mpsc::Sender<()>>,
}

#[derive(Debug, Default)]
pub struct TileLockTable {
    states: Mutex<HashMap<TreePath, TileLockState>>,
}

impl TileLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `path`, blocking behind earlier holders.
    pub fn lock(&self, path: &TreePath) {
        let receiver = {
            let mut states = self.states.lock().expect("tile lock table lock poisoned");
            match states.get_mut(path) {
                None => {
                    states.insert(path.clone(), TileLockState::default());
                    return;
                }
                Some(state) => {
                    let (sender, receiver) = mpsc::channel();
                    state.waiters.push_back(sender);
                    receiver
                }
            }
        };
        receiver
            .recv()
            .expect("tile lock holder vanished without unlocking");
    }

    /// Release the lock for `path`, handing it to the oldest waiter.
    /// Unlocking a path that is not held is a caller bug.
    pub fn unlock(&self, path: &TreePath) {
        let mut states = self.states.lock().expect("tile lock table lock poisoned");
        let Some(state) = states.get_mut(path) else {
            panic!("unlock of unheld tile path {path}");
        };
        loop {
            match state.waiters.pop_front() {
                Some(waiter) => {
                    // A waiter that gave up (dropped its receiver) is skipped.
                    if waiter.send(()).is_ok() {
                        return;
                    }
                }
                None => {
                    states.remove(path);
                    return;
                }
            }
        }
    }

    pub fn is_locked(&self, path: &TreePath) -> bool {
        self.states
            .lock()
            .expect("tile lock table lock poisoned")
            .contains_key(path)
    }

    pub fn locked_count(&self) -> usize {
        self.states
            .lock()
            .expect("tile lock table lock poisoned")
            .len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn path(text: &str) -> TreePath {
        TreePath::parse(text).expect("parse tree path")
    }

    #[test]
    fn uncontended_lock_is_immediate() {
        let table = TileLockTable::new();
        let tile = path("R12");

        assert!(!table.is_locked(&tile));
        table.lock(&tile);
        assert!(table.is_locked(&tile));
        table.unlock(&tile);
        assert!(!table.is_locked(&tile));
        assert_eq!(table.locked_count(), 0);
    }

    #[test]
    fn distinct_paths_do_not_contend() {
        let table = TileLockTable::new();
        table.lock(&path("R0"));
        table.lock(&path("R1"));
        assert_eq!(table.locked_count(), 2);
        table.unlock(&path("R0"));
        table.unlock(&path("R1"));
    }

    #[test]
    #[should_panic(expected = "unlock of unheld tile path R3")]
    fn unlock_of_unheld_path_panics() {
        let table = TileLockTable::new();
        table.unlock(&path("R3"));
    }

    #[test]
    fn waiters_are_signaled_in_fifo_order() {
        let table = Arc::new(TileLockTable::new());
        let tile = path("R");
        let acquired_order = Arc::new(Mutex::new(Vec::new()));
        let started = Arc::new(AtomicUsize::new(0));

        table.lock(&tile);

        let mut handles = Vec::new();
        for waiter_index in 0..3 {
            let table = Arc::clone(&table);
            let tile = tile.clone();
            let acquired_order = Arc::clone(&acquired_order);
            let started_clone = Arc::clone(&started);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("lock_waiter_{waiter_index}"))
                    .spawn(move || {
                        started_clone.fetch_add(1, Ordering::Release);
                        table.lock(&tile);
                        acquired_order
                            .lock()
                            .expect("acquired order lock poisoned")
                            .push(waiter_index);
                        table.unlock(&tile);
                    })
                    .expect("spawn lock waiter"),
            );
            // Serialize thread startup so the queue order matches spawn order.
            let deadline = std::time::Instant::now() + Duration::from_secs(1);
            while started.load(Ordering::Acquire) <= waiter_index {
                assert!(std::time::Instant::now() < deadline, "waiter failed to start");
                std::thread::yield_now();
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        table.unlock(&tile);
        for handle in handles {
            handle.join().expect("join lock waiter");
        }

        let order = acquired_order.lock().expect("acquired order lock poisoned");
        assert_eq!(*order, vec![0, 1, 2]);
        assert_eq!(table.locked_count(), 0);
    }
}
