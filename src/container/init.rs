//! Child-side re-entry point. The `init` subcommand runs as PID 1 of the
//! new namespaces; it waits for the parent to finish resource setup, swaps
//! the root filesystem for the container's merged view and execs the user
//! program.

use std::ffi::CString;
use std::fs;
use std::os::unix::io::RawFd;
use std::path::Path;

use anyhow::{Context, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::{self, close, read};

use crate::container::state::Container;
use crate::store;

pub const ENV_CONTAINER_ID: &str = "DUCKER_ID";
pub const ENV_SYNC_FD: &str = "DUCKER_SYNC_FD";
pub const SYNC_FD: RawFd = 3;

/// Entry point of the hidden `init` subcommand.
pub fn run() -> Result<()> {
    let container_id = std::env::var(ENV_CONTAINER_ID).context("container ID not set")?;
    let container = Container::load(&container_id).context("load config")?;

    wait_for_go();

    let merged = store::container_merged_dir(&container.id);
    pivot_into(&merged).context("pivot root")?;

    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )
    .context("mount proc")?;

    if !container.opts.workdir.is_empty() {
        fs::create_dir_all(&container.opts.workdir).context("create workdir")?;
        unistd::chdir(Path::new(&container.opts.workdir)).context("chdir to workdir")?;
    }

    exec_task(&container.opts.cmd)
}

/// Blocks until the parent signals that cgroups, volumes and networking are
/// in place. The token itself carries no information.
fn wait_for_go() {
    let mut buf = [0u8; 2];
    let _ = read(SYNC_FD, &mut buf);
    let _ = close(SYNC_FD);
}

/// Makes the merged dir the root of this mount namespace: recursively
/// privatize `/`, bind the merged dir onto itself so it is a mount point,
/// pivot into it and drop the old root.
fn pivot_into(new_root: &Path) -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .context("make root private")?;

    mount(
        Some(new_root),
        new_root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .context("bind mount new root")?;

    let old_root = new_root.join(".old_root");
    fs::create_dir_all(&old_root).context("create old_root")?;

    unistd::pivot_root(new_root, &old_root).context("pivot_root")?;
    unistd::chdir("/").context("chdir to new root")?;

    umount2("/.old_root", MntFlags::MNT_DETACH).context("unmount old_root")?;
    let _ = fs::remove_dir_all("/.old_root");
    Ok(())
}

/// Replaces this process with the container command. `execvp` resolves the
/// program through PATH inside the new root.
fn exec_task(cmd: &[String]) -> Result<()> {
    let argv: Vec<String> = if cmd.is_empty() {
        vec!["/bin/sh".to_string()]
    } else {
        cmd.to_vec()
    };

    let program = CString::new(argv[0].clone()).context("command path")?;
    let args: Vec<CString> = argv
        .iter()
        .map(|arg| CString::new(arg.clone()))
        .collect::<Result<_, _>>()
        .context("command args")?;

    unistd::execvp(&program, &args).with_context(|| format!("exec {}", argv[0]))?;
    Ok(())
}
