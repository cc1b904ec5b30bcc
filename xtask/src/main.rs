//! Workspace build tasks.
//!
//! `watchcow-ebpf` only compiles for the BPF target, so it is excluded from
//! the workspace default-members and driven from here instead:
//!
//!   cargo xtask build-ebpf [--release]   compile the probe, stage the
//!                                        object under target/bpf/
//!   cargo xtask build [--release]        probe, then the userspace daemon

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

/// Target triple the probe compiles for.
const BPF_TARGET: &str = "bpfel-unknown-none";
/// Staged object name; matches the daemon's default `ebpf_object` config.
const OBJECT_NAME: &str = "watchcow_ebpf.o";

#[derive(Parser)]
#[command(name = "xtask", about = "Workspace build tasks for watchcow")]
struct Cli {
    #[command(subcommand)]
    task: Task,

    /// Build in release mode
    #[arg(long, global = true)]
    release: bool,
}

#[derive(Subcommand)]
enum Task {
    /// Compile the eBPF probe and stage the object under target/bpf/
    BuildEbpf,
    /// Compile the probe, then the userspace daemon
    Build,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let root = workspace_root()?;

    let staged = build_probe(&root, cli.release)?;
    println!("probe staged at {}", staged.display());

    if matches!(cli.task, Task::Build) {
        let mut cmd = Command::new("cargo");
        cmd.current_dir(&root).args(["build", "-p", "watchcow"]);
        if cli.release {
            cmd.arg("--release");
        }
        run(cmd)?;
    }

    Ok(())
}

/// Cross-compile the probe and copy the object where the daemon expects it.
/// Needs nightly: core has to be rebuilt for the BPF target.
fn build_probe(root: &Path, release: bool) -> Result<PathBuf> {
    let mut cmd = Command::new("cargo");
    cmd.current_dir(root).args([
        "+nightly",
        "build",
        "-p",
        "watchcow-ebpf",
        "--target",
        BPF_TARGET,
        "-Z",
        "build-std=core",
        "--target-dir",
        "target",
    ]);
    if release {
        cmd.arg("--release");
    }
    run(cmd)?;

    let profile = if release { "release" } else { "debug" };
    let built = root
        .join("target")
        .join(BPF_TARGET)
        .join(profile)
        .join("watchcow-ebpf");
    if !built.exists() {
        bail!("expected probe binary at {}", built.display());
    }

    let stage_dir = root.join("target").join("bpf");
    fs::create_dir_all(&stage_dir)
        .with_context(|| format!("creating {}", stage_dir.display()))?;
    let staged = stage_dir.join(OBJECT_NAME);
    fs::copy(&built, &staged).with_context(|| format!("staging {}", staged.display()))?;

    Ok(staged)
}

fn run(mut cmd: Command) -> Result<()> {
    println!("$ {:?}", cmd);
    let status = cmd.status().with_context(|| format!("spawning {:?}", cmd))?;
    if !status.success() {
        bail!("command failed: {:?} ({})", cmd, status);
    }
    Ok(())
}

fn workspace_root() -> Result<PathBuf> {
    let xtask_dir =
        PathBuf::from(env::var("CARGO_MANIFEST_DIR").context("CARGO_MANIFEST_DIR not set")?);
    Ok(xtask_dir
        .parent()
        .context("xtask has no parent directory")?
        .to_path_buf())
}
