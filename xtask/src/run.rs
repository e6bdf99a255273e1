use std::process::Command;

use anyhow::Context;
use clap::Parser;

use crate::build_ebpf::{build_ebpf, Architecture, Options as BuildOptions};

#[derive(Debug, Parser)]
pub struct Options {
    /// Target architecture of the eBPF program.
    #[arg(long, value_enum, default_value_t = Architecture::BpfEl)]
    pub bpf_target: Architecture,

    /// Build and run the release target.
    #[arg(long)]
    pub release: bool,

    /// Command used to run the loader, which needs CAP_BPF and CAP_NET_ADMIN.
    #[arg(long, default_value = "sudo -E")]
    pub runner: String,

    /// Arguments passed to the loader, e.g. `attach -i eth0`.
    #[arg(last = true)]
    pub run_args: Vec<String>,
}

fn build(opts: &Options) -> Result<(), anyhow::Error> {
    let mut args = vec!["build", "--package", "tproxy-tc"];
    if opts.release {
        args.push("--release");
    }

    let status = Command::new("cargo")
        .args(&args)
        .status()
        .context("failed to run cargo")?;

    if !status.success() {
        anyhow::bail!("failed to build the loader: {status}");
    }
    Ok(())
}

pub fn run(opts: Options) -> Result<(), anyhow::Error> {
    build_ebpf(BuildOptions {
        target: opts.bpf_target,
        release: opts.release,
    })
    .context("error while building the eBPF program")?;
    build(&opts).context("error while building the loader")?;

    let profile = if opts.release { "release" } else { "debug" };
    let bin_path = format!("target/{profile}/tproxy-tc");

    let mut args: Vec<_> = opts.runner.trim().split_terminator(' ').collect();
    args.push(bin_path.as_str());
    args.extend(opts.run_args.iter().map(String::as_str));

    let (program, args) = args.split_first().context("empty runner")?;
    let status = Command::new(program)
        .args(args)
        .status()
        .context("failed to run the loader")?;

    if !status.success() {
        anyhow::bail!("the loader exited with {status}");
    }
    Ok(())
}
