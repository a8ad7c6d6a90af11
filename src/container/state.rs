use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use procfs::process::{ProcState, Process};
use serde::{Deserialize, Serialize};

use crate::store::{self, ResourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Running,
    #[default]
    Exited,
}

/// Runtime configuration of a container: the image's defaults merged with
/// the flags given at `run` time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub auto_remove: bool,

    /// host path or volume name -> guest path
    #[serde(default)]
    pub volumes: HashMap<String, String>,
    /// host port -> guest port, both optionally suffixed `/proto`
    #[serde(default)]
    pub ports: HashMap<String, String>,
    #[serde(default)]
    pub network: String,

    #[serde(default)]
    pub workdir: String,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,

    #[serde(default)]
    pub cpus: f64,
    #[serde(default)]
    pub memory: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    #[serde(rename = "cid")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "image_name")]
    pub image: String,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    /// PID of the in-namespace process, 0 while not running.
    #[serde(default)]
    pub pid: i32,
    #[serde(default)]
    pub status: Status,
    #[serde(rename = "run_options", default)]
    pub opts: RunOptions,
}

impl Container {
    pub fn load(id: &str) -> Result<Self> {
        store::load(ResourceKind::Container, id)
    }

    pub fn save(&self) -> Result<()> {
        store::save(ResourceKind::Container, &self.id, self)
    }

    /// The manifest status cross-checked against the process table. A
    /// detached container whose process died without anyone waiting on it
    /// still says `running` on disk; this reports what is actually true.
    pub fn live_status(&self) -> Status {
        if self.status != Status::Running || self.pid <= 0 {
            return self.status;
        }
        match Process::new(self.pid) {
            Ok(process) => match process.stat().ok().and_then(|stat| stat.state().ok()) {
                Some(ProcState::Zombie) | Some(ProcState::Dead) | None => Status::Exited,
                Some(_) => Status::Running,
            },
            Err(_) => Status::Exited,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_string(&Status::Running).unwrap(), r#""running""#);
        assert_eq!(serde_json::to_string(&Status::Exited).unwrap(), r#""exited""#);
    }

    #[test]
    fn test_manifest_defaults() {
        let container: Container = serde_json::from_str(
            r#"{"cid": "0123456789ab", "image_name": "alpine:latest"}"#,
        )
        .unwrap();

        assert_eq!(container.status, Status::Exited);
        assert_eq!(container.pid, 0);
        assert!(container.name.is_empty());
        assert!(container.opts.cmd.is_empty());
        assert!(container.opts.volumes.is_empty());
    }

    #[test]
    fn test_manifest_field_names() {
        let container = Container {
            id: "0123456789ab".to_string(),
            name: "web".to_string(),
            image: "nginx:latest".to_string(),
            created_at: Utc::now(),
            pid: 1234,
            status: Status::Running,
            opts: RunOptions::default(),
        };

        let json = serde_json::to_value(&container).unwrap();
        assert_eq!(json["cid"], "0123456789ab");
        assert_eq!(json["image_name"], "nginx:latest");
        assert_eq!(json["status"], "running");
        assert!(json["run_options"].is_object());
    }

    #[test]
    fn test_live_status_detects_dead_pid() {
        let mut container: Container = serde_json::from_str(
            r#"{"cid": "0123456789ab", "image_name": "alpine:latest"}"#,
        )
        .unwrap();
        container.status = Status::Running;
        // PIDs wrap far below this value, so nothing can be running here
        container.pid = i32::MAX - 1;

        assert_eq!(container.live_status(), Status::Exited);
    }

    #[test]
    fn test_live_status_trusts_exited_manifest() {
        let container: Container = serde_json::from_str(
            r#"{"cid": "0123456789ab", "image_name": "alpine:latest", "pid": 0}"#,
        )
        .unwrap();
        assert_eq!(container.live_status(), Status::Exited);
    }
}
