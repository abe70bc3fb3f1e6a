//! Platform-specific process statistics.

use tracing::warn;

/// One raw reading for a process.
#[derive(Debug, Clone, Copy)]
pub struct ProcessSample {
    /// Resident memory in bytes.
    pub memory_bytes: u64,
    /// Cumulative CPU time in clock ticks (user + system).
    pub cpu_ticks: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum SampleResult {
    Sample(ProcessSample),
    /// The process is gone; the caller should drop its sampler.
    Exited,
    /// Stats could not be read this round; logged, not fatal.
    Unavailable,
}

pub trait ProcessSampler: Send + Sync {
    fn sample(&self, pid: u32) -> SampleResult;

    /// Clock ticks per second, for converting CPU ticks to percentages.
    fn ticks_per_second(&self) -> u64 {
        100
    }
}

#[cfg(unix)]
pub struct UnixSampler {
    page_size: u64,
}

#[cfg(unix)]
impl UnixSampler {
    pub fn new() -> Self {
        Self { page_size: 4096 }
    }

    fn read_memory(&self, pid: u32) -> Option<u64> {
        let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * self.page_size)
    }

    fn read_cpu_ticks(&self, pid: u32) -> Option<u64> {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        // The comm field may contain spaces and parens; everything of
        // interest comes after the closing paren.
        let (_, tail) = stat.rsplit_once(") ")?;
        let fields: Vec<&str> = tail.split_whitespace().collect();
        let utime: u64 = fields.get(11)?.parse().ok()?;
        let stime: u64 = fields.get(12)?.parse().ok()?;
        Some(utime + stime)
    }
}

#[cfg(unix)]
impl Default for UnixSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
impl ProcessSampler for UnixSampler {
    fn sample(&self, pid: u32) -> SampleResult {
        if !std::path::Path::new(&format!("/proc/{pid}")).exists() {
            return SampleResult::Exited;
        }
        match (self.read_memory(pid), self.read_cpu_ticks(pid)) {
            (Some(memory_bytes), Some(cpu_ticks)) => SampleResult::Sample(ProcessSample {
                memory_bytes,
                cpu_ticks,
            }),
            _ => {
                warn!(pid, "Failed to read /proc stats");
                SampleResult::Unavailable
            }
        }
    }
}

#[cfg(windows)]
pub struct WindowsSampler;

#[cfg(windows)]
impl ProcessSampler for WindowsSampler {
    fn sample(&self, pid: u32) -> SampleResult {
        use std::process::Command;

        let output = Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/FO", "CSV", "/NH"])
            .output();

        let Ok(output) = output else {
            warn!(pid, "tasklist invocation failed");
            return SampleResult::Unavailable;
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() || stdout.contains("INFO:") {
            return SampleResult::Exited;
        }

        // Last CSV column is the working set, e.g. "12,345 K".
        let memory_kb: u64 = stdout
            .split(',')
            .next_back()
            .map(|col| {
                col.chars()
                    .filter(|c| c.is_ascii_digit())
                    .collect::<String>()
            })
            .and_then(|digits| digits.parse().ok())
            .unwrap_or(0);

        SampleResult::Sample(ProcessSample {
            memory_bytes: memory_kb * 1024,
            cpu_ticks: 0,
        })
    }
}

/// Fallback for unsupported platforms: zero readings, logged once.
pub struct StubSampler {
    warned: std::sync::Once,
}

impl StubSampler {
    pub fn new() -> Self {
        Self {
            warned: std::sync::Once::new(),
        }
    }
}

impl Default for StubSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSampler for StubSampler {
    fn sample(&self, _pid: u32) -> SampleResult {
        self.warned.call_once(|| {
            warn!("Resource sampling is not supported on this platform; reporting zeros");
        });
        SampleResult::Sample(ProcessSample {
            memory_bytes: 0,
            cpu_ticks: 0,
        })
    }
}

/// Sampler for the current platform.
pub fn platform_sampler() -> Box<dyn ProcessSampler> {
    #[cfg(unix)]
    {
        Box::new(UnixSampler::new())
    }
    #[cfg(windows)]
    {
        Box::new(WindowsSampler)
    }
    #[cfg(not(any(unix, windows)))]
    {
        Box::new(StubSampler::new())
    }
}
