/// Cgroup v2 backend
/// Memory, pids and CPU controls for one run, plus peak memory and OOM evidence
use crate::config::types::{LimitsConfig, Result, SandboxError, CPU_PERIOD_US};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

const REMOVE_ATTEMPTS: u32 = 10;
const REMOVE_BACKOFF: Duration = Duration::from_millis(20);

/// Evidence read from the cgroup after the run settles
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CgroupEvidence {
    pub memory_peak_bytes: Option<u64>,
    pub oom_kill_events: u64,
}

impl CgroupEvidence {
    pub fn oom_killed(&self) -> bool {
        self.oom_kill_events > 0
    }
}

/// Per-run cgroup under a delegated v2 parent
#[derive(Debug)]
pub struct CgroupV2 {
    path: PathBuf,
}

impl CgroupV2 {
    /// Whether the unified hierarchy is mounted at `/sys/fs/cgroup`.
    pub fn is_available() -> bool {
        Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
    }

    /// Create `<parent>/<instance_id>` and enable the controllers it needs
    /// on the parent.
    pub fn create(parent: &Path, instance_id: &str) -> Result<Self> {
        fs::create_dir_all(parent).map_err(|e| {
            SandboxError::Cgroup(format!(
                "Failed to create cgroup parent {}: {}",
                parent.display(),
                e
            ))
        })?;
        enable_controllers(parent);

        let path = parent.join(instance_id);
        fs::create_dir(&path).map_err(|e| {
            SandboxError::Cgroup(format!(
                "Failed to create cgroup {}: {}",
                path.display(),
                e
            ))
        })?;

        log::debug!("Created cgroup {}", path.display());
        Ok(Self { path })
    }

    /// Wrap an existing cgroup directory.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the interface files for every configured limit.
    pub fn apply_limits(&self, limits: &LimitsConfig) -> Result<()> {
        if let Some(memory_kib) = limits.memory_kib {
            self.write("memory.max", &memory_kib.saturating_mul(1024).to_string())?;
            // Swap would let the program slip past memory.max
            if self.path.join("memory.swap.max").exists() {
                self.write("memory.swap.max", "0")?;
            }
        }
        if let Some(pids) = limits.pids_count {
            self.write("pids.max", &pids.to_string())?;
        }
        if let Some(shares) = limits.cpu_shares {
            self.write("cpu.weight", &shares_to_weight(shares).to_string())?;
        }
        if let Some(quota) = limits.cpu_quota {
            self.write("cpu.max", &format!("{} {}", quota, CPU_PERIOD_US))?;
        }
        // cpus before mems, matching the order the kernel validates them in
        if let Some(cpus) = &limits.cpuset_cpus {
            self.write("cpuset.cpus", cpus)?;
        }
        if let Some(mems) = &limits.cpuset_mems {
            self.write("cpuset.mems", mems)?;
        }
        Ok(())
    }

    pub fn attach_process(&self, pid: i32) -> Result<()> {
        self.write("cgroup.procs", &pid.to_string())
    }

    /// `memory.peak` (kernel 5.19+) with fallback to `memory.current`
    pub fn memory_peak(&self) -> Option<u64> {
        self.read_u64("memory.peak")
            .or_else(|| self.read_u64("memory.current"))
    }

    /// `oom_kill` count from `memory.events`
    pub fn oom_kill_count(&self) -> u64 {
        let Ok(content) = fs::read_to_string(self.path.join("memory.events")) else {
            return 0;
        };
        parse_event(&content, "oom_kill").unwrap_or(0)
    }

    pub fn collect_evidence(&self) -> CgroupEvidence {
        CgroupEvidence {
            memory_peak_bytes: self.memory_peak(),
            oom_kill_events: self.oom_kill_count(),
        }
    }

    /// Whether no process is left in the cgroup
    pub fn is_empty(&self) -> bool {
        match fs::read_to_string(self.path.join("cgroup.procs")) {
            Ok(content) => content.trim().is_empty(),
            Err(_) => true,
        }
    }

    /// Remove the cgroup directory. Retries while the kernel finishes
    /// releasing exited tasks. Missing directory is success.
    pub fn remove(&self) -> Result<()> {
        let mut last_error = None;
        for _ in 0..REMOVE_ATTEMPTS {
            match fs::remove_dir(&self.path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    last_error = Some(e);
                    thread::sleep(REMOVE_BACKOFF);
                }
            }
        }
        Err(SandboxError::Cgroup(format!(
            "Failed to remove cgroup {}: {}",
            self.path.display(),
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn write(&self, file: &str, value: &str) -> Result<()> {
        fs::write(self.path.join(file), value).map_err(|e| {
            SandboxError::Cgroup(format!(
                "Failed to write {} to {}/{}: {}",
                value,
                self.path.display(),
                file,
                e
            ))
        })
    }

    fn read_u64(&self, file: &str) -> Option<u64> {
        fs::read_to_string(self.path.join(file))
            .ok()
            .and_then(|content| content.trim().parse::<u64>().ok())
    }
}

/// cgroup v1 `cpu.shares` (2..=262144) to v2 `cpu.weight` (1..=10000)
fn shares_to_weight(shares: u64) -> u64 {
    let shares = shares.clamp(2, 262_144);
    1 + ((shares - 2) * 9999) / 262_142
}

/// Best-effort `+memory +pids +cpu +cpuset` on the parent's subtree_control.
/// Fails harmlessly when a controller is already enabled or not delegated.
fn enable_controllers(parent: &Path) {
    let control = parent.join("cgroup.subtree_control");
    if let Ok(current) = fs::read_to_string(&control) {
        let enabled: Vec<&str> = current.split_whitespace().collect();
        for controller in ["memory", "pids", "cpu", "cpuset"] {
            if !enabled.contains(&controller) {
                if let Err(e) = fs::write(&control, format!("+{}", controller)) {
                    log::debug!(
                        "Could not enable {} controller on {}: {}",
                        controller,
                        parent.display(),
                        e
                    );
                }
            }
        }
    }
}

fn parse_event(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(name), Some(value)) if name == key => value.parse().ok(),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_memory_events() {
        let events = "low 0\nhigh 0\nmax 12\noom 1\noom_kill 1\noom_group_kill 0\n";
        assert_eq!(parse_event(events, "oom_kill"), Some(1));
        assert_eq!(parse_event(events, "oom"), Some(1));
        assert_eq!(parse_event(events, "missing"), None);
    }

    #[test]
    fn test_limits_and_evidence_on_plain_directory() {
        let dir = TempDir::new().unwrap();
        let cgroup = CgroupV2::create(dir.path(), "run-1").unwrap();

        let limits = LimitsConfig {
            memory_kib: Some(65536),
            pids_count: Some(16),
            ..LimitsConfig::default()
        };
        cgroup.apply_limits(&limits).unwrap();
        assert_eq!(
            fs::read_to_string(cgroup.path().join("memory.max")).unwrap(),
            "67108864"
        );
        assert_eq!(
            fs::read_to_string(cgroup.path().join("pids.max")).unwrap(),
            "16"
        );

        fs::write(cgroup.path().join("memory.current"), "4096\n").unwrap();
        fs::write(cgroup.path().join("memory.events"), "oom 2\noom_kill 1\n").unwrap();
        let evidence = cgroup.collect_evidence();
        assert_eq!(evidence.memory_peak_bytes, Some(4096));
        assert!(evidence.oom_killed());

        fs::write(cgroup.path().join("memory.peak"), "8192\n").unwrap();
        assert_eq!(cgroup.memory_peak(), Some(8192));
    }

    #[test]
    fn test_cpu_controls_are_written() {
        let dir = TempDir::new().unwrap();
        let cgroup = CgroupV2::create(dir.path(), "run-cpu").unwrap();

        let limits = LimitsConfig {
            cpu_shares: Some(1024),
            cpu_quota: Some(50_000),
            cpuset_cpus: Some("0-1".to_string()),
            cpuset_mems: Some("0".to_string()),
            ..LimitsConfig::default()
        };
        cgroup.apply_limits(&limits).unwrap();

        let read = |file: &str| fs::read_to_string(cgroup.path().join(file)).unwrap();
        assert_eq!(read("cpu.weight"), "39");
        assert_eq!(read("cpu.max"), "50000 100000");
        assert_eq!(read("cpuset.cpus"), "0-1");
        assert_eq!(read("cpuset.mems"), "0");
        assert!(!cgroup.path().join("memory.max").exists());
    }

    #[test]
    fn test_shares_to_weight_bounds() {
        assert_eq!(shares_to_weight(2), 1);
        assert_eq!(shares_to_weight(262_144), 10_000);
        assert_eq!(shares_to_weight(0), 1);
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let dir = TempDir::new().unwrap();
        let cgroup = CgroupV2::open(dir.path().join("gone"));
        assert!(cgroup.remove().is_ok());
        assert!(cgroup.is_empty());
    }

    #[test]
    fn test_create_twice_fails() {
        let dir = TempDir::new().unwrap();
        let _first = CgroupV2::create(dir.path(), "dup").unwrap();
        assert!(CgroupV2::create(dir.path(), "dup").is_err());
    }
}
