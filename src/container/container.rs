//! Container lifecycle. Starting a container is a two-process handshake:
//! the parent clones a child into fresh namespaces, wires up cgroups,
//! volumes and networking against the recorded PID, then releases the
//! child through a pipe so the user program never observes a half-built
//! environment.

use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::fd::AsRawFd;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::mount::{umount2, MntFlags};
use nix::sched::{self, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{self, close, pipe2, write, Pid};

use crate::cgroups::CgroupController;
use crate::container::init::{ENV_CONTAINER_ID, ENV_SYNC_FD, SYNC_FD};
use crate::container::state::{Container, RunOptions, Status};
use crate::image;
use crate::network;
use crate::store::{self, ResourceKind};
use crate::utils;
use crate::volume;

const STACK_SIZE: usize = 1024 * 1024;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Creates a container from an image and starts it.
pub fn run(name: &str, image_tag: &str, opts: RunOptions) -> Result<Container> {
    let mut container = create(name, image_tag, opts).context("create container")?;
    container.start().context("run container")?;
    Ok(container)
}

/// Creates the container record and its union rootfs. The container starts
/// out exited.
pub fn create(name: &str, image_tag: &str, opts: RunOptions) -> Result<Container> {
    if !name.is_empty() && super::find(name).is_ok() {
        bail!("container name {name} already exists");
    }

    let id = if name.is_empty() {
        store::random_id()
    } else {
        store::generate_id(name)
    };

    let container = Container {
        id,
        name: name.to_string(),
        image: image_tag.to_string(),
        created_at: Utc::now(),
        pid: 0,
        status: Status::Exited,
        opts,
    };

    let layers = image::find(image_tag)
        .context("get image layers")?
        .layer_dirs();
    container.setup_rootfs(&layers).context("setup rootfs")?;
    container.save().context("save config")?;
    Ok(container)
}

impl Container {
    fn merged_dir(&self) -> PathBuf {
        store::container_merged_dir(&self.id)
    }

    fn setup_rootfs(&self, layer_dirs: &[PathBuf]) -> Result<()> {
        let upper = store::container_upper_dir(&self.id);
        let work = store::container_work_dir(&self.id);
        let merged = self.merged_dir();
        for dir in [&upper, &work, &merged] {
            utils::ensure_dir(dir)?;
        }
        utils::mount_overlay(layer_dirs, &upper, &work, &merged)
    }

    pub fn start(&mut self) -> Result<()> {
        if self.status == Status::Running {
            bail!("container already running");
        }

        let (sync_rd, sync_wr) = pipe2(OFlag::O_CLOEXEC).context("create sync pipe")?;
        let pid = match self.spawn_child(sync_rd) {
            Ok(pid) => pid,
            Err(e) => {
                let _ = close(sync_rd);
                let _ = close(sync_wr);
                return Err(e).context("start process");
            }
        };
        let _ = close(sync_rd);
        self.pid = pid.as_raw();
        self.status = Status::Running;
        let _ = self.save();

        if let Err(e) = self.setup_resources() {
            let _ = close(sync_wr);
            self.kill_and_reset();
            let _ = self.save();
            return Err(e).context("setup resources");
        }
        let _ = self.save();

        // the child blocks on the pipe until the environment is complete
        let _ = write(sync_wr, b"GO");
        let _ = close(sync_wr);

        if self.opts.interactive {
            self.wait_and_cleanup(pid);
        }
        Ok(())
    }

    /// Clones the re-entry child into fresh UTS/PID/mount/net namespaces.
    /// The callback runs in the child: it pins the sync pipe to fd 3, sets
    /// up environment and stdio, and re-execs this binary as `init`.
    fn spawn_child(&self, sync_rd: RawFd) -> Result<Pid> {
        let mut stack = vec![0u8; STACK_SIZE];
        let id = self.id.clone();
        let env = self.opts.env.clone();
        let interactive = self.opts.interactive;
        let log_path = store::container_log_path(&self.id);

        let cb = Box::new(move || -> isize {
            match child_setup(sync_rd, &id, &env, interactive, &log_path) {
                // child_setup only returns on exec failure
                Ok(()) => 0,
                Err(e) => {
                    log::error!("container child setup: {e:#}");
                    -1
                }
            }
        });

        let flags = CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWNET;
        let pid = unsafe { sched::clone(cb, &mut stack, flags, Some(Signal::SIGCHLD as i32)) }
            .context("clone container process")?;
        Ok(pid)
    }

    /// Applies limits and wiring against the freshly recorded PID, in the
    /// order the handshake guarantees: cgroups, volumes, network, ports.
    fn setup_resources(&mut self) -> Result<()> {
        CgroupController::new(&self.id)
            .apply(self.pid, self.opts.cpus, self.opts.memory)
            .context("set resource limit")?;

        let merged = self.merged_dir();
        for (source, guest) in &self.opts.volumes {
            volume::mount_into(source, guest, &merged).context("mount volume")?;
        }

        if self.opts.network.is_empty() {
            self.opts.network = network::DEFAULT_NETWORK_NAME.to_string();
        }
        network::connect(&self.opts.network, &self.id, self.pid).context("connect network")?;

        if !self.opts.ports.is_empty() {
            network::setup_port_mappings(&self.opts.network, &self.id, &self.opts.ports)
                .context("setup port mapping")?;
        }
        Ok(())
    }

    fn kill_and_reset(&mut self) {
        if self.pid > 0 {
            let _ = kill(Pid::from_raw(self.pid), Signal::SIGKILL);
        }
        self.status = Status::Exited;
        self.pid = 0;
    }

    fn wait_and_cleanup(&mut self, pid: Pid) {
        let _ = waitpid(pid, None);
        self.status = Status::Exited;
        self.pid = 0;
        self.cleanup_network();
        let _ = self.save();
        if self.opts.auto_remove {
            if let Err(e) = self.remove() {
                log::warn!("auto-remove container {}: {e:#}", self.id);
            }
        }
    }

    /// Port rules must go before the address they point at does.
    fn cleanup_network(&self) {
        let network_name = if self.opts.network.is_empty() {
            network::DEFAULT_NETWORK_NAME
        } else {
            self.opts.network.as_str()
        };
        if !self.opts.ports.is_empty() {
            network::clean_port_mappings(network_name, &self.id, &self.opts.ports);
        }
        if let Err(e) = network::disconnect(network_name, &self.id) {
            log::debug!("disconnect container {}: {e:#}", self.id);
        }
    }

    pub fn stop(&mut self, timeout_secs: u64) -> Result<()> {
        if self.status != Status::Running {
            bail!("container not running");
        }

        self.cleanup_network();

        let pid = Pid::from_raw(self.pid);
        if self.pid > 0 && kill(pid, None).is_ok() {
            let _ = kill(pid, Signal::SIGTERM);
            if !self.wait_process_exit(timeout_secs) {
                let _ = kill(pid, Signal::SIGKILL);
            }
        }

        self.status = Status::Exited;
        self.pid = 0;
        self.save()
    }

    /// Polls the process with signal 0 until it exits or the deadline
    /// passes. A zero timeout skips the wait entirely.
    fn wait_process_exit(&self, timeout_secs: u64) -> bool {
        if timeout_secs == 0 {
            return true;
        }
        let deadline = Instant::now() + Duration::from_secs(timeout_secs);
        while Instant::now() < deadline {
            if kill(Pid::from_raw(self.pid), None).is_err() {
                return true;
            }
            thread::sleep(STOP_POLL_INTERVAL);
        }
        false
    }

    /// Runs a command inside the container's namespaces through nsenter,
    /// rooted at the merged dir.
    pub fn exec(
        &self,
        interactive: bool,
        env: &[String],
        cmd: &[String],
        workdir: &str,
    ) -> Result<()> {
        if self.status != Status::Running {
            bail!("container not running");
        }
        if cmd.is_empty() {
            bail!("no command specified");
        }

        let merged = self.merged_dir();
        let mut command = Command::new("nsenter");
        command.args([
            "-t",
            &self.pid.to_string(),
            "-m",
            "-p",
            "-u",
            "-i",
            "-n",
            &format!("--root={}", merged.display()),
        ]);
        if !workdir.is_empty() {
            command.arg(format!("--wd={workdir}"));
        }
        command.arg("--").args(cmd);

        for entry in env {
            if let Some((key, value)) = entry.split_once('=') {
                command.env(key, value);
            }
        }
        if !interactive {
            command.stdin(Stdio::null());
        }

        let status = command.status().context("run nsenter")?;
        if !status.success() {
            bail!("exec exited with {status}");
        }
        Ok(())
    }

    pub fn logs(&self, follow: bool, tail: usize) -> Result<()> {
        let path = store::container_log_path(&self.id);
        let file = fs::File::open(&path).context("open log file")?;
        let mut reader = BufReader::new(file);

        let mut lines = Vec::new();
        let mut buf = String::new();
        while reader.read_line(&mut buf).context("scan log file")? > 0 {
            lines.push(buf.trim_end_matches('\n').to_string());
            buf.clear();
        }

        if tail > 0 && lines.len() > tail {
            lines.drain(..lines.len() - tail);
        }
        for line in &lines {
            println!("{line}");
        }

        if !follow {
            return Ok(());
        }
        loop {
            buf.clear();
            let n = reader.read_line(&mut buf).context("read log")?;
            if n == 0 {
                thread::sleep(Duration::from_millis(100));
                continue;
            }
            print!("{buf}");
            let _ = std::io::stdout().flush();
        }
    }

    /// Copies a file tree between the host and the container's merged view.
    /// Only allowed while stopped so the copy can't race the container.
    pub fn copy(&self, src: &str, dst: &str, src_in_container: bool) -> Result<()> {
        if self.status == Status::Running {
            bail!("cannot copy from running container");
        }

        let merged = self.merged_dir();
        let (src, dst) = if src_in_container {
            (merged.join(src.trim_start_matches('/')), PathBuf::from(dst))
        } else {
            (PathBuf::from(src), merged.join(dst.trim_start_matches('/')))
        };

        if let Some(parent) = dst.parent() {
            utils::ensure_dir(parent).context("create parent directory")?;
        }
        utils::copy_dir(&src, &dst).context("copy")
    }

    /// Snapshots the container as a new image: its current image plus the
    /// upper layer, keeping the container's run configuration.
    pub fn commit(&self, new_tag: &str) -> Result<()> {
        if self.status == Status::Running {
            bail!("cannot commit running container");
        }
        let opts = image::ImageOptions {
            workdir: self.opts.workdir.clone(),
            env: self.opts.env.clone(),
            port: Vec::new(),
            cmd: self.opts.cmd.clone(),
        };
        image::create_from_layer(
            &self.image,
            new_tag,
            &store::container_upper_dir(&self.id),
            opts,
        )
    }

    pub fn remove(&self) -> Result<()> {
        if self.status == Status::Running {
            bail!("cannot remove running container");
        }

        let merged = self.merged_dir();
        match umount2(&merged, MntFlags::MNT_DETACH) {
            Ok(()) => {}
            // EINVAL means the overlay is already gone, e.g. after a reboot
            Err(nix::errno::Errno::EINVAL) => {}
            Err(e) => return Err(e).context("unmount merged dir"),
        }

        let dir = store::resource_dir(ResourceKind::Container, &self.id);
        fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;

        CgroupController::new(&self.id).remove();
        Ok(())
    }
}

/// Child-side half of the clone: runs inside the new namespaces, before the
/// re-exec. Must only return on failure.
fn child_setup(
    sync_rd: RawFd,
    container_id: &str,
    env: &[String],
    interactive: bool,
    log_path: &Path,
) -> Result<()> {
    // dup2 leaves FD_CLOEXEC set when sync_rd is already fd 3, so the flag
    // must be cleared explicitly for fd 3 to survive into the init process
    unistd::dup2(sync_rd, SYNC_FD).context("dup sync pipe")?;
    fcntl(SYNC_FD, FcntlArg::F_SETFD(FdFlag::empty())).context("clear cloexec on sync pipe")?;

    std::env::set_var(ENV_CONTAINER_ID, container_id);
    std::env::set_var(ENV_SYNC_FD, SYNC_FD.to_string());
    for entry in env {
        if let Some((key, value)) = entry.split_once('=') {
            std::env::set_var(key, value);
        }
    }

    if !interactive {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).context("create log dir")?;
        }
        let log = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(log_path)
            .context("create log file")?;
        unistd::dup2(log.as_raw_fd(), 1).context("redirect stdout")?;
        unistd::dup2(log.as_raw_fd(), 2).context("redirect stderr")?;
    }

    let exe = CString::new("/proc/self/exe").context("exe path")?;
    let argv = [
        CString::new("ducker").context("argv[0]")?,
        CString::new("init").context("argv[1]")?,
    ];
    unistd::execv(&exe, &argv).context("exec init process")?;
    Ok(())
}
