use std::{path::PathBuf, process::Command};

use anyhow::Context;
use clap::{Parser, ValueEnum};

#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum Architecture {
    BpfEl,
    BpfEb,
}

impl Architecture {
    fn target(&self) -> &'static str {
        match self {
            Self::BpfEl => "bpfel-unknown-none",
            Self::BpfEb => "bpfeb-unknown-none",
        }
    }
}

#[derive(Debug, Parser)]
pub struct Options {
    /// Target architecture.
    #[arg(long, value_enum, default_value_t = Architecture::BpfEl)]
    pub target: Architecture,

    /// Build the release target.
    #[arg(long)]
    pub release: bool,
}

/// Builds the eBPF crate into the workspace `target/` directory, where the loader
/// looks for it.
pub fn build_ebpf(opts: Options) -> Result<(), anyhow::Error> {
    let dir = PathBuf::from("tproxy-tc-ebpf");
    let target = format!("--target={}", opts.target.target());
    let mut args = vec![
        "+nightly",
        "build",
        "--verbose",
        target.as_str(),
        "-Z",
        "build-std=core",
        "--target-dir",
        "../target",
    ];
    if opts.release {
        args.push("--release");
    }

    let status = Command::new("cargo")
        .current_dir(dir)
        .env_remove("RUSTUP_TOOLCHAIN")
        .args(&args)
        .status()
        .context("failed to run cargo")?;

    if !status.success() {
        anyhow::bail!("failed to build the eBPF program: {status}");
    }
    Ok(())
}
