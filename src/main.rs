use std::process::exit;

use anyhow::Result;
use clap::{Parser, Subcommand};

use ducker::commands::{
    Build, Commit, Cp, Exec, Images, Init, Load, Logs, NetworkCmd, Ps, Rm, Rmi, Run, Save, Start,
    Stop, VolumeCmd,
};
use ducker::{image, logger, network};

#[derive(Parser, Debug)]
#[clap(name = "ducker", version, about = "A simple container runtime")]
struct Opts {
    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Subcommand, Debug)]
enum SubCommand {
    Build(Build),
    Commit(Commit),
    Cp(Cp),
    Exec(Exec),
    Images(Images),
    #[clap(hide = true)]
    Init(Init),
    Load(Load),
    Logs(Logs),
    #[clap(subcommand)]
    Network(NetworkCmd),
    Ps(Ps),
    Rm(Rm),
    Rmi(Rmi),
    Run(Run),
    Save(Save),
    Start(Start),
    Stop(Stop),
    #[clap(subcommand)]
    Volume(VolumeCmd),
}

fn main() {
    if let Err(e) = run() {
        log::error!("{e:#}");
        exit(1);
    }
    exit(0);
}

fn run() -> Result<()> {
    let opts = Opts::parse();
    if let Err(e) = logger::init() {
        eprintln!("log init failed: {e:?}");
    }

    // keep the default network and the builtin image available before any
    // user command runs; the child re-entry path must skip this
    if !matches!(opts.subcmd, SubCommand::Init(_)) {
        bootstrap();
    }

    match opts.subcmd {
        SubCommand::Build(cmd) => cmd.exec(),
        SubCommand::Commit(cmd) => cmd.exec(),
        SubCommand::Cp(cmd) => cmd.exec(),
        SubCommand::Exec(cmd) => cmd.exec(),
        SubCommand::Images(cmd) => cmd.exec(),
        SubCommand::Init(cmd) => cmd.exec(),
        SubCommand::Load(cmd) => cmd.exec(),
        SubCommand::Logs(cmd) => cmd.exec(),
        SubCommand::Network(cmd) => cmd.exec(),
        SubCommand::Ps(cmd) => cmd.exec(),
        SubCommand::Rm(cmd) => cmd.exec(),
        SubCommand::Rmi(cmd) => cmd.exec(),
        SubCommand::Run(cmd) => cmd.exec(),
        SubCommand::Save(cmd) => cmd.exec(),
        SubCommand::Start(cmd) => cmd.exec(),
        SubCommand::Stop(cmd) => cmd.exec(),
        SubCommand::Volume(cmd) => cmd.exec(),
    }
}

/// A runtime without a working default network should still run commands
/// that can recover it, so bootstrap failures only warn.
fn bootstrap() {
    if let Err(e) = network::init() {
        log::warn!("init default network failed: {e:#}");
    }
    if let Err(e) = image::load_builtin() {
        log::warn!("load builtin image failed: {e:#}");
    }
}
