//! Cgroup v1 CPU and memory limits. Each container gets its own directory
//! under the `cpu` and `memory` controller hierarchies; writing the PID to
//! the controller's `tasks` file attaches the container process.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

const CGROUP_CPU_QUOTA: &str = "cpu.cfs_quota_us";
const CGROUP_MEMORY_LIMIT: &str = "memory.limit_in_bytes";
const CGROUP_TASKS: &str = "tasks";

/// One microsecond-based CFS period; a quota of `cores * PERIOD` caps the
/// container at `cores` worth of CPU time.
const CFS_PERIOD_US: f64 = 100_000.0;

pub struct CgroupController {
    container_id: String,
    root: PathBuf,
}

impl CgroupController {
    pub fn new(container_id: &str) -> Self {
        Self::with_root(container_id, DEFAULT_CGROUP_ROOT)
    }

    pub fn with_root<P: Into<PathBuf>>(container_id: &str, root: P) -> Self {
        Self {
            container_id: container_id.to_string(),
            root: root.into(),
        }
    }

    fn cpu_dir(&self) -> PathBuf {
        self.root.join("cpu").join(&self.container_id)
    }

    fn memory_dir(&self) -> PathBuf {
        self.root.join("memory").join(&self.container_id)
    }

    /// Applies the requested limits and attaches `pid` to each controller
    /// that carries a non-zero limit. Zero values skip the controller.
    pub fn apply(&self, pid: i32, cpus: f64, memory: u64) -> Result<()> {
        if cpus > 0.0 {
            self.apply_cpu(pid, cpus).context("cgroup cpu setup")?;
        }
        if memory > 0 {
            self.apply_memory(pid, memory).context("cgroup memory setup")?;
        }
        Ok(())
    }

    fn apply_cpu(&self, pid: i32, cpus: f64) -> Result<()> {
        let dir = self.cpu_dir();
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let quota = (cpus * CFS_PERIOD_US) as i64;
        write_cgroup_file(&dir.join(CGROUP_CPU_QUOTA), &quota.to_string())?;
        write_cgroup_file(&dir.join(CGROUP_TASKS), &pid.to_string())?;
        Ok(())
    }

    fn apply_memory(&self, pid: i32, memory: u64) -> Result<()> {
        let dir = self.memory_dir();
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        write_cgroup_file(&dir.join(CGROUP_MEMORY_LIMIT), &memory.to_string())?;
        write_cgroup_file(&dir.join(CGROUP_TASKS), &pid.to_string())?;
        Ok(())
    }

    /// Best-effort removal of both controller directories. The kernel
    /// refuses to delete a cgroup that still has tasks; those errors are
    /// swallowed along with everything else.
    pub fn remove(&self) {
        let _ = fs::remove_dir(self.cpu_dir());
        let _ = fs::remove_dir(self.memory_dir());
    }
}

fn write_cgroup_file(path: &Path, data: &str) -> Result<()> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?
        .write_all(data.as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_cpu_quota() {
        // arrange
        let tmp = tempfile::tempdir().expect("create temp dir");
        let controller = CgroupController::with_root("0123456789ab", tmp.path());

        // act
        controller.apply(42, 1.5, 0).expect("apply cgroups");

        // assert
        let dir = tmp.path().join("cpu/0123456789ab");
        assert_eq!(fs::read_to_string(dir.join(CGROUP_CPU_QUOTA)).unwrap(), "150000");
        assert_eq!(fs::read_to_string(dir.join(CGROUP_TASKS)).unwrap(), "42");
        assert!(!tmp.path().join("memory/0123456789ab").exists());
    }

    #[test]
    fn test_apply_memory_limit() {
        let tmp = tempfile::tempdir().expect("create temp dir");
        let controller = CgroupController::with_root("0123456789ab", tmp.path());

        controller.apply(7, 0.0, 64 * 1024 * 1024).expect("apply cgroups");

        let dir = tmp.path().join("memory/0123456789ab");
        assert_eq!(
            fs::read_to_string(dir.join(CGROUP_MEMORY_LIMIT)).unwrap(),
            "67108864"
        );
        assert_eq!(fs::read_to_string(dir.join(CGROUP_TASKS)).unwrap(), "7");
        assert!(!tmp.path().join("cpu/0123456789ab").exists());
    }

    #[test]
    fn test_zero_limits_skip_all() {
        let tmp = tempfile::tempdir().expect("create temp dir");
        let controller = CgroupController::with_root("0123456789ab", tmp.path());

        controller.apply(7, 0.0, 0).expect("apply cgroups");

        assert!(!tmp.path().join("cpu/0123456789ab").exists());
        assert!(!tmp.path().join("memory/0123456789ab").exists());
    }

    #[test]
    fn test_remove_is_best_effort() {
        let tmp = tempfile::tempdir().expect("create temp dir");
        let controller = CgroupController::with_root("0123456789ab", tmp.path());
        controller.apply(7, 2.0, 1024).expect("apply cgroups");

        // remove the control files so the directories are deletable
        for dir in ["cpu/0123456789ab", "memory/0123456789ab"] {
            for entry in fs::read_dir(tmp.path().join(dir)).unwrap() {
                fs::remove_file(entry.unwrap().path()).unwrap();
            }
        }
        controller.remove();
        controller.remove(); // second call is a no-op

        assert!(!tmp.path().join("cpu/0123456789ab").exists());
        assert!(!tmp.path().join("memory/0123456789ab").exists());
    }
}
