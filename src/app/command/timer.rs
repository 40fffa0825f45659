use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type TimerFn = Box<dyn FnOnce() + Send>;

struct TimerTask {
    due: Instant,
    run: TimerFn,
}

struct TimerShared {
    tasks: Mutex<Vec<TimerTask>>,
    cv: Condvar,
    shutdown: AtomicBool,
}

/// Single-threaded delay timer used to move sleeping commands back into the
/// queue. Pending tasks can be drained wholesale, and shutdown drops
/// anything not yet fired.
pub(super) struct CommandTimer {
    shared: Arc<TimerShared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl CommandTimer {
    pub fn new() -> Self {
        let shared = Arc::new(TimerShared {
            tasks: Mutex::new(Vec::new()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let thread_shared = Arc::clone(&shared);
        let join = thread::spawn(move || timer_loop(thread_shared));
        Self {
            shared,
            join: Mutex::new(Some(join)),
        }
    }

    /// Run `task` after `delay`. Dropped silently if the timer has shut down.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        if self.is_shutdown() {
            return;
        }
        let mut tasks = self.shared.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.push(TimerTask {
            due: Instant::now() + delay,
            run: Box::new(task),
        });
        self.shared.cv.notify_all();
    }

    /// Discard every pending task before it fires.
    pub fn drain(&self) -> usize {
        let mut tasks = self.shared.tasks.lock().unwrap_or_else(|p| p.into_inner());
        let count = tasks.len();
        tasks.clear();
        count
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// Stop the timer thread, dropping pending tasks. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.cv.notify_all();
        if let Some(join) = self.join.lock().unwrap_or_else(|p| p.into_inner()).take() {
            let _ = join.join();
        }
    }
}

fn timer_loop(shared: Arc<TimerShared>) {
    let mut tasks = shared.tasks.lock().unwrap_or_else(|p| p.into_inner());
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        let earliest = tasks
            .iter()
            .enumerate()
            .min_by_key(|(_, task)| task.due)
            .map(|(index, task)| (index, task.due));
        match earliest {
            Some((index, due)) if due <= now => {
                let task = tasks.remove(index);
                drop(tasks);
                (task.run)();
                tasks = shared.tasks.lock().unwrap_or_else(|p| p.into_inner());
            }
            Some((_, due)) => {
                let (next, _timed_out) = shared
                    .cv
                    .wait_timeout(tasks, due - now)
                    .unwrap_or_else(|p| p.into_inner());
                tasks = next;
            }
            None => {
                tasks = shared.cv.wait(tasks).unwrap_or_else(|p| p.into_inner());
            }
        }
    }
}

impl Drop for CommandTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fires_task_after_delay() {
        let timer = CommandTimer::new();
        let (tx, rx) = mpsc::channel();
        timer.schedule(Duration::from_millis(20), move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(2)).expect("task fired");
        timer.shutdown();
    }

    #[test]
    fn fires_tasks_in_due_order() {
        let timer = CommandTimer::new();
        let (tx, rx) = mpsc::channel();
        let tx_late = tx.clone();
        timer.schedule(Duration::from_millis(120), move || {
            let _ = tx_late.send("late");
        });
        timer.schedule(Duration::from_millis(20), move || {
            let _ = tx.send("early");
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok("early"));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok("late"));
        timer.shutdown();
    }

    #[test]
    fn drained_task_never_fires() {
        let timer = CommandTimer::new();
        let (tx, rx) = mpsc::channel();
        timer.schedule(Duration::from_millis(50), move || {
            let _ = tx.send(());
        });
        assert_eq!(timer.drain(), 1);
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        timer.shutdown();
    }

    #[test]
    fn shutdown_drops_pending_tasks() {
        let timer = CommandTimer::new();
        let (tx, rx) = mpsc::channel();
        timer.schedule(Duration::from_secs(30), move || {
            let _ = tx.send(());
        });
        timer.shutdown();
        assert!(timer.is_shutdown());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
