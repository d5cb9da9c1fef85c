//! Shutdown wait-group
//!
//! Every storage operation holds a [`WaitGuard`] while it runs.
//! `wait_and_block` waits until no guard is alive and then refuses new
//! ones, so teardown never races with an in-flight operation.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct State {
    in_flight: usize,
    blocked: bool,
}

/// Counts in-flight operations and blocks new ones during shutdown
#[derive(Debug, Default)]
pub struct WaitGroup {
    state: Mutex<State>,
    drained: Condvar,
}

/// Marks one in-flight operation; released on drop
#[must_use = "the operation is only tracked while the guard is alive"]
pub struct WaitGuard<'a> {
    wg: &'a WaitGroup,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation.
    ///
    /// # Panics
    /// Panics when called after `wait_and_block`: using storage after
    /// shutdown started is a programming error.
    pub fn enter(&self, op: &str) -> WaitGuard<'_> {
        match self.try_enter() {
            Some(g) => g,
            None => panic!("BUG: storage operation {:?} called after shutdown started", op),
        }
    }

    /// Register an operation unless shutdown started
    pub fn try_enter(&self) -> Option<WaitGuard<'_>> {
        let mut st = self.state.lock();
        if st.blocked {
            return None;
        }
        st.in_flight += 1;
        Some(WaitGuard { wg: self })
    }

    /// Wait for in-flight operations to finish, then block new ones
    pub fn wait_and_block(&self) {
        let mut st = self.state.lock();
        st.blocked = true;
        while st.in_flight > 0 {
            self.drained.wait(&mut st);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.wg.state.lock();
        st.in_flight -= 1;
        if st.in_flight == 0 {
            self.wg.drained.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_wait_and_block_drains() {
        let wg = WaitGroup::new();
        let finished = AtomicBool::new(false);
        std::thread::scope(|s| {
            let guard = wg.enter("search");
            s.spawn(|| {
                let _g = guard;
                std::thread::sleep(Duration::from_millis(50));
                finished.store(true, Ordering::SeqCst);
            });
            wg.wait_and_block();
            assert!(finished.load(Ordering::SeqCst));
        });
        assert!(wg.try_enter().is_none());
        assert_eq!(wg.in_flight(), 0);
    }

    #[test]
    #[should_panic(expected = "after shutdown started")]
    fn test_enter_after_block_panics() {
        let wg = WaitGroup::new();
        wg.wait_and_block();
        let _g = wg.enter("add_rows");
    }
}
