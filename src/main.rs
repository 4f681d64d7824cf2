use kube::Client;
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

use pav::kubernetes::ClusterObjectRef;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "pav",
    about = "A pluggable Kubernetes volume provisioner driven by helper pods"
)]
enum Command {
    /// Run a provisioning agent.
    Agent(AgentCommand),
    /// Serve a CSI plugin instance on the local Unix socket.
    CsiPlugin(CsiPluginCommand),
}

#[derive(StructOpt, Debug)]
enum AgentCommand {
    /// The cluster-wide controller agent.
    Controller {
        /// Image to use for the per-provisioner CSI plugin workloads.
        image: String,
    },
    /// The agent for one node.
    Node {
        /// Name of the node this agent runs on.
        node_name: String,
    },
}

#[derive(StructOpt, Debug)]
struct CsiPluginCommand {
    /// Name of the Provisioner object this plugin serves.
    provisioner_name: String,
    /// Uid of the Provisioner object this plugin serves.
    provisioner_uid: String,
    #[structopt(subcommand)]
    service: CsiPluginService,
}

#[derive(StructOpt, Debug)]
enum CsiPluginService {
    /// The cluster-wide controller plugin instance.
    Controller,
    /// The plugin instance for one node.
    Node { node_name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let command = Command::from_args();
    let client = Client::try_default().await?;

    match command {
        Command::Agent(AgentCommand::Controller { image }) => {
            pav::agent::controller::run(client, image).await
        }
        Command::Agent(AgentCommand::Node { node_name }) => {
            pav::agent::node::run(client, node_name).await
        }
        Command::CsiPlugin(CsiPluginCommand {
            provisioner_name,
            provisioner_uid,
            service,
        }) => {
            let provisioner = ClusterObjectRef {
                name: provisioner_name,
                uid: provisioner_uid,
            };
            match service {
                CsiPluginService::Controller => pav::csi::run_controller(client, provisioner).await,
                CsiPluginService::Node { node_name } => {
                    pav::csi::run_node(client, provisioner, node_name).await
                }
            }
        }
    }
}
