//! Loading timer
//!
//! Single ticking task that reports elapsed time while a model loads.
//! At most one task is alive per timer: `start` stops the previous one.

use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

pub const TICK: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct LoadingTimer {
    period: Duration,
    started: Option<Instant>,
    handle: Option<JoinHandle<()>>,
}

impl Default for LoadingTimer {
    fn default() -> Self {
        Self::with_period(TICK)
    }
}

impl LoadingTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_period(period: Duration) -> Self {
        Self { period, started: None, handle: None }
    }

    /// Start ticking. `on_tick` gets the elapsed time once per period and
    /// returns false to stop early (e.g. its channel closed).
    pub fn start<F>(&mut self, mut on_tick: F)
    where
        F: FnMut(Duration) -> bool + Send + 'static,
    {
        self.stop();

        let started = Instant::now();
        let period = self.period;
        self.started = Some(started);
        self.handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                if !on_tick(started.elapsed()) {
                    break;
                }
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.started = None;
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.started.map(|s| s.elapsed())
    }
}

impl Drop for LoadingTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// `m:ss`
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}", secs / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::ZERO), "0:00");
        assert_eq!(format_elapsed(Duration::from_secs(75)), "1:15");
        assert_eq!(format_elapsed(Duration::from_millis(3_599_999)), "59:59");
        assert_eq!(format_elapsed(Duration::from_secs(3600)), "60:00");
    }

    #[tokio::test]
    async fn test_restart_replaces_previous_task() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut timer = LoadingTimer::with_period(Duration::from_millis(10));

        let f = first.clone();
        timer.start(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
            true
        });
        tokio::time::sleep(Duration::from_millis(35)).await;

        let s = second.clone();
        timer.start(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
            true
        });
        let frozen = first.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(frozen >= 1);
        assert_eq!(first.load(Ordering::SeqCst), frozen, "old task kept ticking");
        assert!(second.load(Ordering::SeqCst) >= 1);

        timer.stop();
        assert!(!timer.is_running());
        let after_stop = second.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(second.load(Ordering::SeqCst), after_stop);
    }
}
