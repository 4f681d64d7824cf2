//! The CSI plugin front-end: a gRPC server on a local Unix domain socket
//! exposing the identity service plus either the controller or the node
//! service, depending on which plugin instance this process is.

mod common;
mod controller;
mod grpc_sock;
mod identity;
mod node;

use k8s_csi::v1_3_0::controller_server::ControllerServer;
use k8s_csi::v1_3_0::identity_server::IdentityServer;
use k8s_csi::v1_3_0::node_server::NodeServer;
use kube::Client;
use tonic::transport::Server;
use tracing::info;

use crate::config::CSI_SOCKET_PATH;
use crate::csi::controller::ControllerService;
use crate::csi::identity::IdentityService;
use crate::csi::node::NodeService;
use crate::kubernetes::ClusterObjectRef;

/// Serve the controller plugin instance until terminated.
pub async fn run_controller(client: Client, provisioner: ClusterObjectRef) -> anyhow::Result<()> {
    serve(client, provisioner, None).await
}

/// Serve the node plugin instance until terminated.
pub async fn run_node(
    client: Client,
    provisioner: ClusterObjectRef,
    node_name: String,
) -> anyhow::Result<()> {
    serve(client, provisioner, Some(node_name)).await
}

async fn serve(
    client: Client,
    provisioner: ClusterObjectRef,
    node_name: Option<String>,
) -> anyhow::Result<()> {
    let socket = grpc_sock::Socket::bind(CSI_SOCKET_PATH)?;
    let identity = IdentityServer::new(IdentityService::new(provisioner.clone()));

    // on SIGTERM the server stops accepting calls and drains in-flight ones
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async move {
        sigterm.recv().await;
        info!("received SIGTERM, draining in-flight calls");
    };

    info!(socket = CSI_SOCKET_PATH, "serving CSI plugin");
    match node_name {
        None => {
            let service = ControllerServer::new(ControllerService::new(client, provisioner));
            Server::builder()
                .add_service(identity)
                .add_service(service)
                .serve_with_incoming_shutdown(socket, shutdown)
                .await?;
        }
        Some(node_name) => {
            let service = NodeServer::new(NodeService::new(client, provisioner, node_name));
            Server::builder()
                .add_service(identity)
                .add_service(service)
                .serve_with_incoming_shutdown(socket, shutdown)
                .await?;
        }
    }

    Ok(())
}
