#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod proxy;
mod signal;
mod teardown;

use anyhow::Result;
use clap::Parser;
use ipnet::Ipv4Net;
use std::{net::SocketAddr, path::PathBuf};
use tracing::info;
use wirepod_k8s::topology::TopologyOverrides;

#[derive(Debug, Parser)]
#[clap(
    name = "wirepod",
    version,
    about = "Easy, direct connections to, and through, a Kubernetes cluster"
)]
struct Args {
    #[clap(long, default_value = "wirepod=info,warn", env = "WIREPOD_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    /// Toggle debug logging
    #[clap(long, short = 'd', env = "DEBUG", global = true)]
    debug: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Proxy cluster access to the target Kubernetes workload.
    Proxy(ProxyArgs),

    /// Runs the cluster-side tunnel agent.
    #[clap(hide = true)]
    Agent(AgentArgs),
}

#[derive(Debug, clap::Args)]
struct ProxyArgs {
    #[clap(flatten)]
    client: kubert::ClientArgs,

    /// Namespace of the target workload
    #[clap(long, short = 'n', default_value = "default")]
    namespace: String,

    /// Name of the container to replace
    #[clap(long, short = 'c')]
    container: Option<String>,

    /// Overlay prefix (CIDR); skips automatic selection
    #[clap(long, short = 'o')]
    overlay: Option<String>,

    /// Try NAT hole punching instead of a load balancer for access to the pod
    #[clap(long, short = 'p')]
    direct: bool,

    /// Agent image to use
    #[clap(
        long,
        short = 'i',
        default_value = concat!("ghcr.io/wirepod/wirepod:", env!("CARGO_PKG_VERSION"))
    )]
    agent_image: String,

    /// Keep created cluster resources when exiting
    #[clap(
        long,
        short = 'k',
        action = clap::ArgAction::Set,
        default_value_t = true
    )]
    keep_resources: bool,

    /// Kubernetes service CIDR
    #[clap(long)]
    service_cidr: Option<Ipv4Net>,

    /// Kubernetes node CIDR
    #[clap(long)]
    node_cidr: Option<Ipv4Net>,

    /// Kubernetes pod CIDR
    #[clap(long)]
    pod_cidr: Option<Ipv4Net>,

    /// Local `host:port` accessible from the remote agent
    #[clap(long)]
    local_address: Option<SocketAddr>,

    /// Target workload, `<kind>/<name>` or `<kind> <name>`
    #[clap(required = true, num_args = 1..=2)]
    target: Vec<String>,
}

#[derive(Debug, clap::Args)]
struct AgentArgs {
    /// Path to the configuration file
    #[clap(long, short = 'c', default_value = "/app/config/wg.yml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        log_level,
        log_format,
        debug,
        command,
    } = Args::parse();

    let log_level = if debug {
        "wirepod=debug,info".parse()?
    } else {
        log_level
    };
    log_format
        .try_init(log_level)
        .expect("must configure logging");

    match command {
        Command::Proxy(args) => {
            let ProxyArgs {
                client,
                namespace,
                container,
                overlay,
                direct,
                agent_image,
                keep_resources,
                service_cidr,
                node_cidr,
                pod_cidr,
                local_address,
                target,
            } = args;

            let client = client
                .try_client()
                .await
                .map_err(|error| anyhow::anyhow!("failed to create kubernetes client: {error}"))?;

            proxy::run(
                client,
                proxy::Settings {
                    namespace,
                    container,
                    agent_image,
                    keep_resources,
                    direct,
                    overlay,
                    local_address,
                    overrides: TopologyOverrides {
                        pod_prefix: pod_cidr,
                        service_prefix: service_cidr,
                        node_prefix: node_cidr,
                    },
                    target,
                },
            )
            .await
        }
        Command::Agent(args) => {
            let guards =
                wirepod_agent::start(&args.config, &wirepod_agent::nat::IceDiscovery).await?;
            info!("Started, waiting for signal");
            signal::shutdown().await?;
            guards.tear_down().await;
            Ok(())
        }
    }
}
