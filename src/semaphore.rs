//! Bounded counting semaphore with dynamic capacity adjustment.

use anyhow::Result;
use std::sync::{Condvar, Mutex};

struct State {
    current: i64,
    capacity: i64,
}

/// Mirrors `h2o_sem_t`: a counting semaphore whose capacity may be adjusted
/// at runtime. `current` may go negative transiently after a capacity
/// reduction; it is restored to non-negative by subsequent `post` calls.
pub struct Semaphore {
    state: Mutex<State>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(capacity: i64) -> Self {
        Self {
            state: Mutex::new(State {
                current: capacity,
                capacity,
            }),
            cond: Condvar::new(),
        }
    }

    /// Blocks until `current > 0`, then decrements it.
    pub fn wait(&self) -> Result<()> {
        let mut state = lock!(self.state);
        while state.current <= 0 {
            state = self
                .cond
                .wait(state)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
        }
        state.current -= 1;
        Ok(())
    }

    /// Increments `current` and wakes one waiter.
    pub fn post(&self) -> Result<()> {
        let mut state = lock!(self.state);
        state.current += 1;
        self.cond.notify_one();
        Ok(())
    }

    /// Adjusts capacity, shifting `current` by the same delta, and wakes all
    /// waiters (since a widened capacity may allow more than one to proceed).
    pub fn set_capacity(&self, new_capacity: i64) -> Result<()> {
        let mut state = lock!(self.state);
        state.current += new_capacity - state.capacity;
        state.capacity = new_capacity;
        self.cond.notify_all();
        Ok(())
    }

    /// Current outstanding-capacity snapshot, for diagnostics/tests.
    pub fn current(&self) -> Result<i64> {
        Ok(lock!(self.state).current)
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        if let Ok(state) = self.state.lock() {
            debug_assert_eq!(
                state.current, state.capacity,
                "semaphore destroyed with outstanding acquisitions"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_post_roundtrip() {
        let sem = Semaphore::new(2);
        sem.wait().unwrap();
        sem.wait().unwrap();
        assert_eq!(sem.current().unwrap(), 0);
        sem.post().unwrap();
        assert_eq!(sem.current().unwrap(), 1);
    }

    #[test]
    fn wait_blocks_until_post() {
        let sem = Arc::new(Semaphore::new(1));
        sem.wait().unwrap();

        let sem2 = sem.clone();
        let handle = thread::spawn(move || {
            sem2.wait().unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        sem.post().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn set_capacity_grows_and_wakes() {
        let sem = Arc::new(Semaphore::new(1));
        sem.wait().unwrap();
        assert_eq!(sem.current().unwrap(), 0);

        let sem2 = sem.clone();
        let handle = thread::spawn(move || {
            sem2.wait().unwrap();
        });
        thread::sleep(Duration::from_millis(50));
        sem.set_capacity(2).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn set_capacity_idempotent() {
        let sem = Semaphore::new(4);
        sem.set_capacity(4).unwrap();
        assert_eq!(sem.current().unwrap(), 4);
    }
}
