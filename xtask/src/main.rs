mod build_ebpf;
mod run;

use std::process::exit;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
pub struct Options {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build the eBPF classifier.
    BuildEbpf(build_ebpf::Options),
    /// Build the eBPF classifier and the loader, then run the loader.
    Run(run::Options),
}

fn main() {
    let opts = Options::parse();

    let ret = match opts.command {
        Command::BuildEbpf(opts) => build_ebpf::build_ebpf(opts),
        Command::Run(opts) => run::run(opts),
    };

    if let Err(e) = ret {
        eprintln!("{e:#}");
        exit(1);
    }
}
