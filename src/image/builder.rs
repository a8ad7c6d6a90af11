//! Recipe-driven image assembly. Option directives mutate the image's
//! default run options; COPY and RUN produce pending layers in scratch
//! directories that are only copied into the store once every step
//! succeeded.

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use nix::mount::{umount2, MntFlags};
use tempfile::TempDir;

use crate::image::image::{Image, ImageOptions};
use crate::image::normalize_tag;
use crate::image::recipe::Instruction;
use crate::store;
use crate::utils;

struct PendingLayer {
    hash: String,
    dir: PathBuf,
}

pub struct ImageBuilder {
    base: Image,
    tag: String,
    opts: ImageOptions,
    pending: Vec<PendingLayer>,
    // scratch dirs stay alive until the build is over, then drop cleans
    // them up whatever the outcome was
    scratch: Vec<TempDir>,
}

impl ImageBuilder {
    /// A builder starts from a copy of the base image's run options; a
    /// caller-supplied options record replaces that copy wholesale.
    pub fn new(base: Image, tag: &str, opts: Option<ImageOptions>) -> Self {
        let opts = opts.unwrap_or_else(|| base.run_options.clone());
        Self {
            base,
            tag: normalize_tag(tag),
            opts,
            pending: Vec::new(),
            scratch: Vec::new(),
        }
    }

    pub fn apply(&mut self, instructions: &[Instruction]) -> Result<()> {
        for instruction in instructions {
            self.execute(instruction)
                .with_context(|| format!("execute {}", instruction.name()))?;
        }
        Ok(())
    }

    fn execute(&mut self, instruction: &Instruction) -> Result<()> {
        match instruction {
            // the base image was resolved before the builder was created
            Instruction::From(_) => Ok(()),
            Instruction::Workdir(dir) => {
                self.opts.workdir = dir.clone();
                Ok(())
            }
            Instruction::Env(vars) => {
                self.opts.env.extend(vars.iter().cloned());
                Ok(())
            }
            Instruction::Expose(ports) => {
                self.opts.port.extend(ports.iter().cloned());
                Ok(())
            }
            Instruction::Cmd(cmd) => {
                self.opts.cmd = cmd.clone();
                Ok(())
            }
            Instruction::Copy { src, dst } => self.exec_copy(src, dst),
            Instruction::Run(cmd) => self.exec_run(cmd),
        }
    }

    fn exec_copy(&mut self, src: &Path, dst: &str) -> Result<()> {
        let scratch = tempfile::Builder::new()
            .prefix("ducker-layer-")
            .tempdir()
            .context("create layer dir")?;

        let dest_in_layer = scratch.path().join(dst.trim_start_matches('/'));
        if let Some(parent) = dest_in_layer.parent() {
            utils::ensure_dir(parent).context("create dest dir")?;
        }
        utils::copy_dir(src, &dest_in_layer).context("copy files")?;

        let hash = utils::hash_dir(scratch.path()).context("hash layer")?;
        self.pending.push(PendingLayer {
            hash,
            dir: scratch.path().to_path_buf(),
        });
        self.scratch.push(scratch);
        Ok(())
    }

    fn exec_run(&mut self, cmd: &str) -> Result<()> {
        let scratch = tempfile::Builder::new()
            .prefix("ducker-run-")
            .tempdir()
            .context("create scratch dir")?;
        let upper = scratch.path().join("upper");
        let work = scratch.path().join("work");
        let merged = scratch.path().join("merged");
        for dir in [&upper, &work, &merged] {
            utils::ensure_dir(dir)?;
        }

        utils::mount_overlay(&self.lower_dirs(), &upper, &work, &merged)
            .context("mount overlayfs")?;

        let result = run_in_chroot(&merged, cmd, &self.opts.env);
        let _ = umount2(&merged, MntFlags::MNT_DETACH);
        result?;

        let hash = utils::hash_dir(&upper).context("hash layer")?;
        self.pending.push(PendingLayer { hash, dir: upper });
        self.scratch.push(scratch);
        Ok(())
    }

    /// Registers an existing directory (a container's upper layer on
    /// commit) as the next pending layer.
    pub fn add_layer(&mut self, dir: &Path) -> Result<()> {
        let hash = utils::hash_dir(dir).context("hash layer")?;
        self.pending.push(PendingLayer {
            hash,
            dir: dir.to_path_buf(),
        });
        Ok(())
    }

    /// Layer stack for the next RUN step: the base image's layers followed
    /// by every pending layer built so far.
    fn lower_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = self.base.layer_dirs();
        dirs.extend(self.pending.iter().map(|layer| layer.dir.clone()));
        dirs
    }

    /// Materializes the new image in the store. Scratch directories are
    /// released regardless of the outcome.
    pub fn build(&mut self) -> Result<()> {
        let result = self.create_image();
        self.scratch.clear();
        result.context("create image")?;

        log::info!("successfully built image {}", self.tag);
        Ok(())
    }

    fn create_image(&self) -> Result<()> {
        let image_id = store::generate_id(&self.tag);

        let mut layers = self.base.layers.clone();
        layers.extend(self.pending.iter().map(|layer| layer.hash.clone()));

        let mut image = Image {
            tag: self.tag.clone(),
            id: image_id.clone(),
            created_at: Utc::now(),
            layers,
            size: 0,
            hidden: false,
            run_options: self.opts.clone(),
        };

        utils::ensure_dir(store::image_layers_dir(&image_id)).context("ensure layers dir")?;

        // the new image owns copies of its base layers so it stays usable
        // after the base image is removed
        for src in self.base.layer_dirs() {
            let hash = src
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            if let Err(e) = utils::copy_dir(&src, store::image_layer_dir(&image_id, &hash)) {
                let _ = image.remove();
                return Err(e).context("copy base layer");
            }
        }

        for layer in &self.pending {
            let dst = store::image_layer_dir(&image_id, &layer.hash);
            if let Err(e) = utils::copy_dir(&layer.dir, &dst) {
                let _ = image.remove();
                return Err(e).context("copy layer");
            }
        }

        if let Err(e) = image.save_config() {
            let _ = image.remove();
            return Err(e).context("save config");
        }
        Ok(())
    }
}

/// Runs `/bin/sh -c cmd` chrooted into `merged` with exactly the given
/// environment.
fn run_in_chroot(merged: &Path, cmd: &str, env: &[String]) -> Result<()> {
    let mut command = Command::new("/bin/sh");
    command.arg("-c").arg(cmd).env_clear();
    for entry in env {
        if let Some((key, value)) = entry.split_once('=') {
            command.env(key, value);
        }
    }

    let root = merged.to_path_buf();
    unsafe {
        command.pre_exec(move || {
            nix::unistd::chroot(&root)
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            nix::unistd::chdir("/").map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            Ok(())
        });
    }

    let status = command.status().with_context(|| format!("run command {cmd:?}"))?;
    if !status.success() {
        bail!("command {cmd:?} exited with {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::recipe::Instruction;
    use std::fs;

    fn base_image() -> Image {
        Image {
            tag: "base:latest".to_string(),
            id: "0123456789ab".to_string(),
            created_at: Utc::now(),
            layers: vec!["aaa111aaa111".to_string()],
            size: 0,
            hidden: false,
            run_options: ImageOptions {
                workdir: "/srv".to_string(),
                env: vec!["BASE=1".to_string()],
                port: vec!["80".to_string()],
                cmd: vec!["/bin/true".to_string()],
            },
        }
    }

    #[test]
    fn test_builder_copies_base_options() {
        let builder = ImageBuilder::new(base_image(), "out", None);
        assert_eq!(builder.opts.workdir, "/srv");
        assert_eq!(builder.opts.env, vec!["BASE=1".to_string()]);
        assert_eq!(builder.tag, "out:latest");
    }

    #[test]
    fn test_caller_options_replace_base_options() {
        let override_opts = ImageOptions {
            cmd: vec!["/bin/sh".to_string()],
            ..Default::default()
        };
        let builder = ImageBuilder::new(base_image(), "out:1", Some(override_opts));
        assert!(builder.opts.workdir.is_empty());
        assert_eq!(builder.opts.cmd, vec!["/bin/sh".to_string()]);
    }

    #[test]
    fn test_option_directives_mutate_options() {
        let mut builder = ImageBuilder::new(base_image(), "out", None);
        builder
            .apply(&[
                Instruction::Workdir("/app".to_string()),
                Instruction::Env(vec!["A=1".to_string()]),
                Instruction::Expose(vec!["8080".to_string()]),
                Instruction::Cmd(vec!["/bin/echo".to_string(), "hi".to_string()]),
            ])
            .expect("apply instructions");

        assert_eq!(builder.opts.workdir, "/app");
        assert_eq!(builder.opts.env, vec!["BASE=1".to_string(), "A=1".to_string()]);
        assert_eq!(builder.opts.port, vec!["80".to_string(), "8080".to_string()]);
        assert_eq!(
            builder.opts.cmd,
            vec!["/bin/echo".to_string(), "hi".to_string()]
        );
    }

    #[test]
    fn test_add_layer_hashes_directory() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("marker"), b"x").unwrap();

        let mut builder = ImageBuilder::new(base_image(), "out", None);
        builder.add_layer(tmp.path()).expect("add layer");

        assert_eq!(builder.pending.len(), 1);
        assert_eq!(builder.pending[0].hash.len(), 12);
        assert_eq!(builder.pending[0].dir, tmp.path());
    }

    #[test]
    fn test_lower_dirs_stack_base_then_pending() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("f"), b"x").unwrap();

        let mut builder = ImageBuilder::new(base_image(), "out", None);
        builder.add_layer(tmp.path()).unwrap();

        let dirs = builder.lower_dirs();
        assert_eq!(dirs.len(), 2);
        assert!(dirs[0].ends_with("0123456789ab/layers/aaa111aaa111"));
        assert_eq!(dirs[1], tmp.path());
    }
}
