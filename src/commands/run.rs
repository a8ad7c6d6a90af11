use std::collections::HashMap;

use anyhow::Result;
use clap::Parser;

use crate::container::{self, RunOptions};
use crate::image::{self, ImageOptions};

/// Create and run a new container
#[derive(Parser, Debug)]
pub struct Run {
    /// Assign a name to the container
    #[clap(long)]
    name: Option<String>,
    /// Keep STDIN open even if not attached
    #[clap(short, long)]
    interactive: bool,
    /// Run container in background and print container ID
    #[clap(short, long)]
    detach: bool,
    /// Automatically remove the container when it exits
    #[clap(long = "rm")]
    auto_remove: bool,
    /// Working directory inside the container
    #[clap(short, long)]
    workdir: Option<String>,
    /// Set environment variables
    #[clap(short, long)]
    env: Vec<String>,
    /// Bind mount a volume (source:container_path)
    #[clap(short, long)]
    volume: Vec<String>,
    /// Connect the container to a network
    #[clap(long)]
    network: Option<String>,
    /// Publish a container's port to the host (host_port:container_port)
    #[clap(short, long)]
    publish: Vec<String>,
    /// Number of CPUs
    #[clap(long, default_value_t = 0.0)]
    cpus: f64,
    /// Memory limit with optional k/m/g suffix
    #[clap(short, long)]
    memory: Option<String>,
    /// Image to run
    image: String,
    /// Command and arguments, overriding the image default
    #[clap(trailing_var_arg = true)]
    command: Vec<String>,
}

impl Run {
    pub fn exec(&self) -> Result<()> {
        let image_opts = image::find(&self.image)?.run_options;
        let opts = self.build_options(&image_opts);
        let container = container::run(self.name.as_deref().unwrap_or(""), &self.image, opts)?;
        if self.detach {
            println!("{}", container.id);
        }
        Ok(())
    }

    /// Flags win over the image's defaults; unset flags fall back to them.
    fn build_options(&self, image_opts: &ImageOptions) -> RunOptions {
        RunOptions {
            interactive: self.interactive || !self.detach,
            auto_remove: self.auto_remove,
            volumes: parse_key_value_args(&self.volume),
            ports: parse_key_value_args(&self.publish),
            network: self.network.clone().unwrap_or_default(),
            workdir: self
                .workdir
                .clone()
                .unwrap_or_else(|| image_opts.workdir.clone()),
            env: if self.env.is_empty() {
                image_opts.env.clone()
            } else {
                self.env.clone()
            },
            cmd: if self.command.is_empty() {
                image_opts.cmd.clone()
            } else {
                self.command.clone()
            },
            cpus: self.cpus,
            memory: parse_memory(self.memory.as_deref().unwrap_or("")),
        }
    }
}

/// `key:value` flags into a map; entries without a colon are dropped.
fn parse_key_value_args(args: &[String]) -> HashMap<String, String> {
    args.iter()
        .filter_map(|arg| arg.split_once(':'))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Memory strings with optional k/m/g suffix (powers of 1024). Anything
/// unparsable means no limit.
fn parse_memory(value: &str) -> u64 {
    let value = value.trim().to_ascii_lowercase();
    if value.is_empty() {
        return 0;
    }

    let (number, multiplier) = match value.as_bytes()[value.len() - 1] {
        b'k' => (&value[..value.len() - 1], 1024),
        b'm' => (&value[..value.len() - 1], 1024 * 1024),
        b'g' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value.as_str(), 1),
    };
    number.parse::<u64>().map_or(0, |n| n * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_suffixes() {
        assert_eq!(parse_memory("512"), 512);
        assert_eq!(parse_memory("4k"), 4096);
        assert_eq!(parse_memory("2m"), 2 * 1024 * 1024);
        assert_eq!(parse_memory("1g"), 1024 * 1024 * 1024);
        assert_eq!(parse_memory("1G"), 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_memory_invalid_means_unlimited() {
        assert_eq!(parse_memory(""), 0);
        assert_eq!(parse_memory("  "), 0);
        assert_eq!(parse_memory("lots"), 0);
    }

    #[test]
    fn test_parse_key_value_args() {
        let parsed = parse_key_value_args(&[
            "data:/work".to_string(),
            "8080:80".to_string(),
            "broken".to_string(),
        ]);
        assert_eq!(parsed.get("data"), Some(&"/work".to_string()));
        assert_eq!(parsed.get("8080"), Some(&"80".to_string()));
        assert_eq!(parsed.len(), 2);
    }
}
