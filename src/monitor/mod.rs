//! Periodic per-process resource sampling.
//!
//! Each watched worker gets a sampler task on a fixed cadence. A memory
//! reading above the cap sends a termination request to the supervisor
//! channel; the monitor itself never kills anything.

mod proc;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::MonitorConfig;

pub use proc::{platform_sampler, ProcessSample, ProcessSampler, SampleResult, StubSampler};
#[cfg(unix)]
pub use proc::UnixSampler;

/// Request sent to the supervisor when a resource cap is breached.
#[derive(Debug, Clone)]
pub struct BreachNotice {
    pub worker_id: String,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceStats {
    pub current_memory_bytes: u64,
    pub peak_memory_bytes: u64,
    pub current_cpu_percent: f64,
    pub average_cpu_percent: f64,
    pub uptime_ms: u64,
}

struct WatchState {
    started: Instant,
    samples: VecDeque<(u64, f64)>,
    peak_memory: u64,
    last_ticks: Option<u64>,
    window: usize,
}

impl WatchState {
    fn new(window: usize) -> Self {
        Self {
            started: Instant::now(),
            samples: VecDeque::with_capacity(window),
            peak_memory: 0,
            last_ticks: None,
            window,
        }
    }

    fn record(&mut self, memory: u64, cpu_ticks: u64, interval: Duration, ticks_per_sec: u64) {
        let cpu_percent = match self.last_ticks {
            Some(last) if cpu_ticks >= last && interval.as_secs_f64() > 0.0 => {
                let delta_secs = (cpu_ticks - last) as f64 / ticks_per_sec as f64;
                (delta_secs / interval.as_secs_f64()) * 100.0
            }
            _ => 0.0,
        };
        self.last_ticks = Some(cpu_ticks);
        self.peak_memory = self.peak_memory.max(memory);

        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back((memory, cpu_percent));
    }

    fn stats(&self) -> ResourceStats {
        let (current_memory, current_cpu) = self.samples.back().copied().unwrap_or((0, 0.0));
        let average_cpu = if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().map(|(_, c)| c).sum::<f64>() / self.samples.len() as f64
        };
        ResourceStats {
            current_memory_bytes: current_memory,
            peak_memory_bytes: self.peak_memory,
            current_cpu_percent: current_cpu,
            average_cpu_percent: average_cpu,
            uptime_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

struct Watcher {
    state: Arc<Mutex<WatchState>>,
    task: tokio::task::JoinHandle<()>,
}

pub struct ResourceMonitor {
    sampler: Arc<dyn ProcessSampler>,
    config: MonitorConfig,
    watchers: DashMap<String, Watcher>,
    breach_tx: mpsc::Sender<BreachNotice>,
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig, breach_tx: mpsc::Sender<BreachNotice>) -> Self {
        Self {
            sampler: Arc::from(platform_sampler()),
            config,
            watchers: DashMap::new(),
            breach_tx,
        }
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn ProcessSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    /// Begin sampling a worker's process. Replaces any previous watcher for
    /// the same worker.
    pub fn watch(self: &Arc<Self>, worker_id: &str, pid: u32) {
        let state = Arc::new(Mutex::new(WatchState::new(self.config.sample_window)));
        let monitor = Arc::clone(self);
        let id = worker_id.to_string();
        let watch_state = Arc::clone(&state);

        let task = tokio::spawn(async move {
            monitor.sample_loop(id, pid, watch_state).await;
        });

        if let Some(old) = self.watchers.insert(
            worker_id.to_string(),
            Watcher { state, task },
        ) {
            old.task.abort();
        }
        debug!(worker_id, pid, "Resource monitoring started");
    }

    pub fn unwatch(&self, worker_id: &str) {
        if let Some((_, watcher)) = self.watchers.remove(worker_id) {
            watcher.task.abort();
            debug!(worker_id, "Resource monitoring stopped");
        }
    }

    pub fn stats(&self, worker_id: &str) -> Option<ResourceStats> {
        self.watchers
            .get(worker_id)
            .map(|w| w.state.lock().stats())
    }

    pub fn watched_count(&self) -> usize {
        self.watchers.len()
    }

    pub fn shutdown(&self) {
        for entry in self.watchers.iter() {
            entry.value().task.abort();
        }
        self.watchers.clear();
    }

    async fn sample_loop(&self, worker_id: String, pid: u32, state: Arc<Mutex<WatchState>>) {
        let interval = Duration::from_secs(self.config.sample_interval_secs);
        let limit_bytes = self.config.memory_limit_mb * 1024 * 1024;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so readings are spaced.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match self.sampler.sample(pid) {
                SampleResult::Sample(sample) => {
                    state.lock().record(
                        sample.memory_bytes,
                        sample.cpu_ticks,
                        interval,
                        self.sampler.ticks_per_second(),
                    );

                    if sample.memory_bytes > limit_bytes {
                        warn!(
                            worker_id = %worker_id,
                            memory_mb = sample.memory_bytes / (1024 * 1024),
                            limit_mb = self.config.memory_limit_mb,
                            "Memory limit breached"
                        );
                        let _ = self
                            .breach_tx
                            .send(BreachNotice {
                                worker_id: worker_id.clone(),
                                memory_bytes: sample.memory_bytes,
                            })
                            .await;
                    }
                }
                SampleResult::Exited => {
                    debug!(worker_id = %worker_id, pid, "Process gone, removing sampler");
                    self.watchers.remove(&worker_id);
                    break;
                }
                SampleResult::Unavailable => {
                    // Logged by the sampler; never fatal for the worker.
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSampler {
        memory: u64,
    }

    impl ProcessSampler for FixedSampler {
        fn sample(&self, _pid: u32) -> SampleResult {
            SampleResult::Sample(ProcessSample {
                memory_bytes: self.memory,
                cpu_ticks: 0,
            })
        }
    }

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            sample_interval_secs: 1,
            memory_limit_mb: 512,
            sample_window: 60,
        }
    }

    #[test]
    fn test_window_bounds_samples() {
        let mut state = WatchState::new(3);
        for i in 0..10u64 {
            state.record(i, 0, Duration::from_secs(5), 100);
        }
        assert_eq!(state.samples.len(), 3);
        assert_eq!(state.stats().current_memory_bytes, 9);
        assert_eq!(state.stats().peak_memory_bytes, 9);
    }

    #[test]
    fn test_cpu_percent_from_tick_delta() {
        let mut state = WatchState::new(10);
        state.record(0, 100, Duration::from_secs(5), 100);
        // 250 ticks later over a 5 s interval at 100 Hz = 2.5 s of CPU = 50%
        state.record(0, 350, Duration::from_secs(5), 100);
        let stats = state.stats();
        assert!((stats.current_cpu_percent - 50.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breach_sends_notice() {
        let (tx, mut rx) = mpsc::channel(8);
        let monitor = Arc::new(
            ResourceMonitor::new(fast_config(), tx).with_sampler(Arc::new(FixedSampler {
                memory: 600 * 1024 * 1024,
            })),
        );

        monitor.watch("w-1", 12345);

        // The paused clock auto-advances to the next sampling tick.
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.worker_id, "w-1");
        assert!(notice.memory_bytes > 512 * 1024 * 1024);
        monitor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_visible_after_sampling() {
        let (tx, _rx) = mpsc::channel(8);
        let monitor = Arc::new(
            ResourceMonitor::new(fast_config(), tx)
                .with_sampler(Arc::new(FixedSampler { memory: 1024 })),
        );

        monitor.watch("w-1", 1);

        // The paused clock auto-advances; wait for the first sample.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            if monitor
                .stats("w-1")
                .is_some_and(|s| s.current_memory_bytes == 1024)
            {
                break;
            }
        }

        let stats = monitor.stats("w-1").unwrap();
        assert_eq!(stats.current_memory_bytes, 1024);
        monitor.shutdown();
        assert!(monitor.stats("w-1").is_none());
    }
}
