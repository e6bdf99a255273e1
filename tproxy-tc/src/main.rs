use clap::Parser;
use log::{info, warn};
use tokio::signal;

use tproxy_tc::cli::{Args, AttachArgs, Command, Direction};
use tproxy_tc::{listener, loader, loader::TproxyProgram};
use tproxy_tc_common::RedirectStrategy;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::init();

    let args = Args::parse();

    match args.command() {
        Command::Attach(args) => attach(args).await,
        Command::Classify(args) => {
            println!("{}", args.dry_run()?);
            Ok(())
        }
    }
}

async fn attach(args: AttachArgs) -> Result<(), anyhow::Error> {
    let iface = args.iface()?;
    let policy = args.policy.policy(loader::ifindex)?;
    info!("policy: {:?}", policy);

    let strategy = policy.strategy();
    if strategy == RedirectStrategy::SocketAssign {
        if args.direction == Direction::Egress {
            warn!("socket assignment only takes effect on ingress, egress traffic will be passed");
        }
        if !args.skip_listener_check {
            listener::check(policy.proxy_port);
        }
    }

    let mut program = TproxyProgram::load(&policy, &args.bpf_object)?;
    info!("BPF program loaded");

    program.attach(iface, args.direction.into())?;
    info!(
        "classifier attached iface={} direction={:?} strategy={:?}",
        iface, args.direction, strategy
    );

    info!("Waiting for Ctrl-C...");
    signal::ctrl_c().await?;
    info!("Exiting...");

    program.detach()
}
