//! Liveness watchdog.
//!
//! Samples the worker pools at a fixed interval and checks that anything
//! with queued work is still completing tasks. A stalled pool under this
//! design means unrecoverable lock contention inside application handlers,
//! not a transient hiccup, so after enough consecutive bad samples the
//! configured recovery action runs: by default a fatal log plus process
//! exit, so a supervisor can restart the server. Tests and embedders inject
//! their own action instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error};

use crate::pools::ThreadPools;

/// Invoked once the stall threshold is reached.
pub type RecoveryAction = Box<dyn Fn() + Send>;

/// Default recovery: log at error level and exit so the process supervisor
/// restarts us. In-process recovery cannot be trusted once a pool is
/// confirmed stalled.
pub fn exit_process_recovery() {
    error!("thread pools stalled beyond the restart threshold; exiting for supervisor restart");
    std::process::exit(1);
}

pub struct Watchdog {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn start(
        pools: Arc<ThreadPools>,
        interval: Duration,
        threshold: u32,
        action: RecoveryAction,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let thread = Builder::new()
            .name("watchdog".to_owned())
            .spawn(move || watch(pools, interval, threshold.max(1), action, stop_flag))
            .expect("failed to spawn watchdog thread");

        Self {
            stop,
            thread: Some(thread),
        }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch(
    pools: Arc<ThreadPools>,
    interval: Duration,
    threshold: u32,
    action: RecoveryAction,
    stop: Arc<AtomicBool>,
) {
    let mut previous_completed: Vec<u64> = pools.progress().iter().map(|p| p.completed).collect();
    let mut consecutive_stalls = 0u32;

    loop {
        // sleep in slices so stop() does not wait out a long interval
        let deadline = Instant::now() + interval;
        while Instant::now() < deadline {
            if stop.load(Ordering::Acquire) || pools.is_shut_down() {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            std::thread::sleep(remaining.min(Duration::from_millis(50)));
        }

        let snapshot = pools.progress();
        let pending = snapshot.iter().any(|p| p.queued > 0);
        let progressed = snapshot
            .iter()
            .zip(previous_completed.iter())
            .any(|(now, before)| now.completed > *before);
        previous_completed = snapshot.iter().map(|p| p.completed).collect();

        if pending && !progressed {
            consecutive_stalls += 1;
            let stuck: Vec<&str> = snapshot
                .iter()
                .filter(|p| p.queued > 0)
                .map(|p| p.name)
                .collect();
            debug!(
                "watchdog: no pool progress (sample {consecutive_stalls}/{threshold}, pending in {stuck:?})"
            );
            if consecutive_stalls >= threshold {
                error!(
                    "watchdog: pools made no progress for {consecutive_stalls} consecutive samples"
                );
                action();
                consecutive_stalls = 0;
            }
        } else {
            consecutive_stalls = 0;
        }
    }
}
