use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::ExecutableCommand;

struct Entry {
    seq: u64,
    cmd: Arc<ExecutableCommand>,
}

struct QueueState {
    entries: Vec<Entry>,
    next_seq: u64,
}

/// Queue of commands ready to execute, ordered by ascending tracker
/// execution time with insertion order breaking ties. Priority is read at
/// poll time, so a tracker whose time grows while queued sinks accordingly.
pub(super) struct CommandQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: Vec::new(),
                next_seq: 0,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn add(&self, cmd: Arc<ExecutableCommand>) {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let seq = guard.next_seq;
        guard.next_seq += 1;
        guard.entries.push(Entry { seq, cmd });
        self.cv.notify_one();
    }

    /// Remove and return the highest-priority command, waiting up to
    /// `timeout` for one to arrive.
    pub fn poll(&self, timeout: Duration) -> Option<Arc<ExecutableCommand>> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if !guard.entries.is_empty() {
                return Some(take_min(&mut guard));
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, _timed_out) = self
                .cv
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|p| p.into_inner());
            guard = next;
        }
    }

    pub fn clear(&self) {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        guard.entries.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        let guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        guard.entries.len()
    }
}

fn take_min(state: &mut QueueState) -> Arc<ExecutableCommand> {
    let mut best = 0;
    let mut best_key = (u64::MAX, u64::MAX);
    for (index, entry) in state.entries.iter().enumerate() {
        let key = (entry.cmd.total_exec_time(), entry.seq);
        if key < best_key {
            best_key = key;
            best = index;
        }
    }
    state.entries.remove(best).cmd
}
