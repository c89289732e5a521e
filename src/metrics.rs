//! Event-loop operational counters, feature-gated the same way the teacher
//! gates its inference-pipeline metrics: a real `AtomicU64`-backed module
//! under `feature = "metrics"`, and an identical-signature no-op module
//! otherwise, so call sites never need `#[cfg]`.

#[cfg(feature = "metrics")]
mod imp {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    static SUBMITS: AtomicU64 = AtomicU64::new(0);
    static COMPLETIONS: AtomicU64 = AtomicU64::new(0);
    static PARTIAL_SUBMITS: AtomicU64 = AtomicU64::new(0);
    static SUBMIT_QUEUE_FULL: AtomicU64 = AtomicU64::new(0);
    static WAKEUPS: AtomicU64 = AtomicU64::new(0);
    static TIMEOUTS_FIRED: AtomicU64 = AtomicU64::new(0);
    static LOOP_EXCEPTIONS: AtomicU64 = AtomicU64::new(0);
    static ACCEPTS: AtomicU64 = AtomicU64::new(0);

    #[derive(Clone, Copy)]
    pub struct MetricsSnapshot {
        pub submits: u64,
        pub completions: u64,
        pub partial_submits: u64,
        pub submit_queue_full: u64,
        pub wakeups: u64,
        pub timeouts_fired: u64,
        pub loop_exceptions: u64,
        pub accepts: u64,
    }

    pub fn inc_submits() {
        SUBMITS.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_completions(n: u64) {
        COMPLETIONS.fetch_add(n, Ordering::Relaxed);
    }
    pub fn inc_partial_submits() {
        PARTIAL_SUBMITS.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_submit_queue_full() {
        SUBMIT_QUEUE_FULL.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_wakeups() {
        WAKEUPS.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_timeouts_fired() {
        TIMEOUTS_FIRED.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_loop_exceptions() {
        LOOP_EXCEPTIONS.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_accepts() {
        ACCEPTS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            submits: SUBMITS.load(Ordering::Relaxed),
            completions: COMPLETIONS.load(Ordering::Relaxed),
            partial_submits: PARTIAL_SUBMITS.load(Ordering::Relaxed),
            submit_queue_full: SUBMIT_QUEUE_FULL.load(Ordering::Relaxed),
            wakeups: WAKEUPS.load(Ordering::Relaxed),
            timeouts_fired: TIMEOUTS_FIRED.load(Ordering::Relaxed),
            loop_exceptions: LOOP_EXCEPTIONS.load(Ordering::Relaxed),
            accepts: ACCEPTS.load(Ordering::Relaxed),
        }
    }

    pub fn spawn_reporter() {
        const INTERVAL_SECS: u64 = 10;
        std::thread::spawn(|| {
            let mut last = snapshot();
            loop {
                std::thread::sleep(Duration::from_secs(INTERVAL_SECS));
                let snap = snapshot();
                tracing::info!(
                    submits = snap.submits.saturating_sub(last.submits),
                    completions = snap.completions.saturating_sub(last.completions),
                    partial_submits = snap.partial_submits.saturating_sub(last.partial_submits),
                    submit_queue_full = snap.submit_queue_full.saturating_sub(last.submit_queue_full),
                    wakeups = snap.wakeups.saturating_sub(last.wakeups),
                    timeouts_fired = snap.timeouts_fired.saturating_sub(last.timeouts_fired),
                    loop_exceptions = snap.loop_exceptions.saturating_sub(last.loop_exceptions),
                    accepts = snap.accepts.saturating_sub(last.accepts),
                    "event loop metrics delta"
                );
                last = snap;
            }
        });
    }
}

#[cfg(not(feature = "metrics"))]
#[allow(dead_code)]
mod imp {
    #[derive(Clone, Copy)]
    pub struct MetricsSnapshot {
        pub submits: u64,
        pub completions: u64,
        pub partial_submits: u64,
        pub submit_queue_full: u64,
        pub wakeups: u64,
        pub timeouts_fired: u64,
        pub loop_exceptions: u64,
        pub accepts: u64,
    }

    pub fn inc_submits() {}
    pub fn inc_completions(_: u64) {}
    pub fn inc_partial_submits() {}
    pub fn inc_submit_queue_full() {}
    pub fn inc_wakeups() {}
    pub fn inc_timeouts_fired() {}
    pub fn inc_loop_exceptions() {}
    pub fn inc_accepts() {}
    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            submits: 0,
            completions: 0,
            partial_submits: 0,
            submit_queue_full: 0,
            wakeups: 0,
            timeouts_fired: 0,
            loop_exceptions: 0,
            accepts: 0,
        }
    }
    pub fn spawn_reporter() {}
}

pub use imp::*;
