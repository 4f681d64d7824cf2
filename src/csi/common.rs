//! Plumbing shared by the CSI services: RPC logging and typed aborts.

use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use kube::Client;
use tonic::{Code, Status};
use tracing::{error, info};

use crate::provisioner::Provisioner;

/// Process-wide RPC sequence counter, shared by all three services.
static NEXT_RPC_SEQNUM: AtomicU64 = AtomicU64::new(0);

/// An error that aborts the current RPC with a specific status.
#[derive(Debug, thiserror::Error)]
#[error("rpc aborted: {0}")]
pub(crate) struct Abort(pub Status);

pub(crate) fn abort(code: Code, details: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(Abort(Status::new(code, details.into())))
}

pub(crate) fn ensure_rpc(
    condition: bool,
    code: Code,
    details: impl Into<String>,
) -> anyhow::Result<()> {
    if condition {
        Ok(())
    } else {
        Err(abort(code, details))
    }
}

pub(crate) async fn ensure_provisioner_is_not_being_deleted(
    client: &Client,
    provisioner_name: &str,
) -> anyhow::Result<()> {
    let provisioner = Provisioner::get(client, provisioner_name).await?;
    ensure_rpc(
        !provisioner.is_marked_for_deletion(),
        Code::FailedPrecondition,
        "the provisioner is under deletion",
    )
}

/// The claim access mode corresponding to a CSI capability access mode.
pub(crate) fn access_mode_name(mode: i32) -> anyhow::Result<&'static str> {
    use k8s_csi::v1_3_0::volume_capability::access_mode::Mode;
    match Mode::from_i32(mode) {
        Some(Mode::SingleNodeWriter) => Ok("ReadWriteOnce"),
        Some(Mode::MultiNodeReaderOnly) => Ok("ReadOnlyMany"),
        Some(Mode::MultiNodeMultiWriter) => Ok("ReadWriteMany"),
        other => anyhow::bail!("unsupported access mode {:?}", other),
    }
}

/// The claim volume mode corresponding to a CSI capability access type.
pub(crate) fn capability_volume_mode(
    capability: &k8s_csi::v1_3_0::VolumeCapability,
) -> anyhow::Result<&'static str> {
    use k8s_csi::v1_3_0::volume_capability::AccessType;
    match capability.access_type.as_ref() {
        Some(AccessType::Mount(_)) => Ok("Filesystem"),
        Some(AccessType::Block(_)) => Ok("Block"),
        None => anyhow::bail!("volume capability specifies no access type"),
    }
}

/// Reject mount capabilities that carry a filesystem type or mount flags;
/// helper pods decide both.
pub(crate) fn reject_mount_options(
    capability: &k8s_csi::v1_3_0::VolumeCapability,
    fs_type_details: &str,
    mount_flags_details: &str,
) -> anyhow::Result<()> {
    use k8s_csi::v1_3_0::volume_capability::AccessType;
    if let Some(AccessType::Mount(mount)) = capability.access_type.as_ref() {
        ensure_rpc(
            mount.fs_type.is_empty(),
            Code::InvalidArgument,
            fs_type_details,
        )?;
        ensure_rpc(
            mount.mount_flags.is_empty(),
            Code::InvalidArgument,
            mount_flags_details,
        )?;
    }
    Ok(())
}

/// Run an RPC handler, logging entry, exit, and outcome under a globally
/// increasing sequence number, and mapping errors to statuses.
pub(crate) async fn instrument_rpc<Request, Response, Call>(
    service: &str,
    method: &str,
    request: &Request,
    call: Call,
) -> Result<tonic::Response<Response>, Status>
where
    Request: Debug,
    Response: Debug,
    Call: Future<Output = anyhow::Result<Response>>,
{
    let seqnum = NEXT_RPC_SEQNUM.fetch_add(1, Ordering::Relaxed);
    info!(seqnum, "entering {}.{} <-- {:?}", service, method, request);

    match call.await {
        Ok(response) => {
            info!(seqnum, "exited {}.{} --> {:?}", service, method, response);
            Ok(tonic::Response::new(response))
        }
        Err(err) => match err.downcast::<Abort>() {
            Ok(Abort(status)) => {
                info!(
                    seqnum,
                    code = ?status.code(),
                    "exited {}.{} --> aborted: {}",
                    service,
                    method,
                    status.message()
                );
                Err(status)
            }
            Err(err) => {
                error!(seqnum, "exited {}.{} --> unhandled: {:#}", service, method, err);
                Err(Status::internal(format!("{:#}", err)))
            }
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn aborts_keep_their_status() {
        let result: Result<tonic::Response<()>, Status> = instrument_rpc(
            "Test",
            "Method",
            &"request",
            async { Err::<(), _>(abort(Code::FailedPrecondition, "nope")) },
        )
        .await;
        let status = result.unwrap_err();
        assert_eq!(status.code(), Code::FailedPrecondition);
        assert_eq!(status.message(), "nope");
    }

    #[tokio::test]
    async fn other_errors_become_internal() {
        let result: Result<tonic::Response<()>, Status> = instrument_rpc(
            "Test",
            "Method",
            &"request",
            async { Err::<(), _>(anyhow::anyhow!("boom")) },
        )
        .await;
        assert_eq!(result.unwrap_err().code(), Code::Internal);
    }

    #[tokio::test]
    async fn sequence_numbers_increase() {
        let first = NEXT_RPC_SEQNUM.load(Ordering::Relaxed);
        let _ = instrument_rpc("Test", "Method", &"request", async { Ok(()) }).await;
        let _ = instrument_rpc("Test", "Method", &"request", async { Ok(()) }).await;
        assert!(NEXT_RPC_SEQNUM.load(Ordering::Relaxed) >= first + 2);
    }

    #[tokio::test]
    async fn ensure_rpc_passes_and_fails() {
        assert!(ensure_rpc(true, Code::Aborted, "x").is_ok());
        let err = ensure_rpc(false, Code::Aborted, "x").unwrap_err();
        assert_eq!(err.downcast::<Abort>().unwrap().0.code(), Code::Aborted);
    }
}
