//! Resource governor: rejects new work under memory pressure.

use crate::state::AgentRuntimeState;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

pub const GOVERNOR_INTERVAL: Duration = Duration::from_secs(5);

/// Memory usage against a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    pub used_bytes: u64,
    pub limit_bytes: u64,
}

impl MemoryUsage {
    fn exceeds(&self, ratio: f64) -> bool {
        self.limit_bytes > 0 && self.used_bytes as f64 > self.limit_bytes as f64 * ratio
    }
}

/// Source of memory readings.
pub trait MemoryProbe: Send + Sync {
    /// Resident memory of this process.
    fn process(&self) -> Option<MemoryUsage>;
    /// Memory of the enclosing container, when running in one.
    fn pod(&self) -> Option<MemoryUsage>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorTransition {
    Rejecting,
    Recovered,
    Unchanged,
}

pub struct ResourceGovernor {
    state: Arc<AgentRuntimeState>,
    probe: Box<dyn MemoryProbe>,
}

impl ResourceGovernor {
    pub fn new(state: Arc<AgentRuntimeState>, probe: Box<dyn MemoryProbe>) -> Self {
        Self { state, probe }
    }

    /// Read memory once and move the reject flag at most one step.
    pub fn tick(&self) -> GovernorTransition {
        let ratio = self.state.resources.threshold_ratio;
        let process = self.probe.process();
        let pod = self.probe.pod();

        let over = |usage: Option<MemoryUsage>| usage.is_some_and(|u| u.exceeds(ratio));
        let process_over = over(process);
        let pod_over = over(pod);

        if process_over || pod_over {
            if self.state.resources.try_set_reject() {
                warn!(
                    process_used = process.map(|u| u.used_bytes),
                    process_limit = process.map(|u| u.limit_bytes),
                    pod_used = pod.map(|u| u.used_bytes),
                    pod_limit = pod.map(|u| u.limit_bytes),
                    "Memory threshold exceeded, rejecting new tasks"
                );
                return GovernorTransition::Rejecting;
            }
        } else if self.state.resources.try_clear_reject() {
            info!(
                process_used = process.map(|u| u.used_bytes),
                pod_used = pod.map(|u| u.used_bytes),
                "Memory back under threshold, accepting tasks"
            );
            return GovernorTransition::Recovered;
        }
        GovernorTransition::Unchanged
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(GOVERNOR_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Starting resource governor");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let transition = self.tick();
                    debug!(transition = ?transition, "Governor tick");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

/// Reads process memory through sysinfo and pod memory from cgroup files.
pub struct SysinfoProbe {
    sys: Mutex<System>,
    max_memory_bytes: u64,
}

impl SysinfoProbe {
    /// `max_memory_bytes` bounds the process. Defaults to total system memory.
    pub fn new(max_memory_bytes: Option<u64>) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        let limit = max_memory_bytes.unwrap_or_else(|| sys.total_memory());
        Self {
            sys: Mutex::new(sys),
            max_memory_bytes: limit,
        }
    }
}

impl MemoryProbe for SysinfoProbe {
    fn process(&self) -> Option<MemoryUsage> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut sys = self.sys.lock().ok()?;
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let used_bytes = sys.process(pid)?.memory();
        Some(MemoryUsage {
            used_bytes,
            limit_bytes: self.max_memory_bytes,
        })
    }

    fn pod(&self) -> Option<MemoryUsage> {
        cgroup_memory(Path::new("/sys/fs/cgroup"))
    }
}

/// Container memory from cgroup v2, falling back to v1.
pub fn cgroup_memory(root: &Path) -> Option<MemoryUsage> {
    let read = |name: &str| -> Option<String> {
        std::fs::read_to_string(root.join(name))
            .ok()
            .map(|s| s.trim().to_string())
    };

    let (used, limit) = match (read("memory.current"), read("memory.max")) {
        (Some(used), Some(limit)) => (used, limit),
        _ => (
            read("memory/memory.usage_in_bytes")?,
            read("memory/memory.limit_in_bytes")?,
        ),
    };

    let used_bytes = used.parse::<u64>().ok()?;
    // "max" means unlimited; v1 reports a huge sentinel instead.
    let limit_bytes = limit.parse::<u64>().ok().filter(|l| *l < u64::MAX / 2)?;
    Some(MemoryUsage {
        used_bytes,
        limit_bytes,
    })
}
