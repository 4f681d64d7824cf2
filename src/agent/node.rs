//! The per-node agent.
//!
//! Drives the node side of the provisioning state machine (awaiting and
//! removing helper pods whose side channel lives on this node) and the whole
//! staging state machine for client pods scheduled here.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use kube::Client;
use tonic::Code;

use crate::agent::{
    run_provisioning_engine, run_staging_engine, ProvisioningContext, ProvisioningHandler,
    StagingContext, StagingHandler,
};
use crate::kubernetes::quantity::{parse_quantity, Rounding};
use crate::pod::{host, PodHandle};
use crate::provisioner::VolumeMode;
use crate::state::{ProvisioningState, StagingState};

/// Run the node agent until failure.
pub async fn run(client: Client, node_name: String) -> anyhow::Result<()> {
    let provisioning_handler = Arc::new(NodeProvisioningHandler {
        client: client.clone(),
        node_name: node_name.clone(),
    });
    let staging_handler = Arc::new(NodeStagingHandler {
        client: client.clone(),
        node_name: node_name.clone(),
    });

    tokio::try_join!(
        run_provisioning_engine(client.clone(), provisioning_handler, Some(node_name.clone())),
        run_staging_engine(client, staging_handler, node_name),
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Provisioning (node side)

struct NodeProvisioningHandler {
    client: Client,
    node_name: String,
}

impl NodeProvisioningHandler {
    fn helper_pod(&self, context: &ProvisioningContext, kind: &str, namespace: &str) -> PodHandle {
        let name = format!("pav-volume-{}-pod-{}", kind, context.claim_uid());
        PodHandle::new(self.client.clone(), &name, namespace, &name)
    }
}

#[async_trait::async_trait]
impl ProvisioningHandler for NodeProvisioningHandler {
    fn handles(&self, state: &ProvisioningState) -> bool {
        matches!(
            state,
            ProvisioningState::AwaitValidationPod { .. }
                | ProvisioningState::RemoveValidationPod { .. }
                | ProvisioningState::RemoveValidationPodAfterFailure { .. }
                | ProvisioningState::AwaitCreationPod { .. }
                | ProvisioningState::RemoveCreationPod { .. }
                | ProvisioningState::RemoveCreationPodAfterFailure { .. }
                | ProvisioningState::AwaitDeletionPod { .. }
                | ProvisioningState::AwaitDeletionPodAfterFailure { .. }
                | ProvisioningState::RemoveDeletionPod { .. }
                | ProvisioningState::RemoveDeletionPodAfterFailure { .. }
        )
    }

    async fn handle(
        &self,
        context: &ProvisioningContext,
        state: &ProvisioningState,
    ) -> anyhow::Result<()> {
        match state {
            ProvisioningState::AwaitValidationPod {
                validation_pod_namespace,
            } => {
                let pod = self.helper_pod(context, "validation", validation_pod_namespace);
                if pod.wait_until_terminated().await? {
                    context
                        .set_state(
                            ProvisioningState::RemoveValidationPod {
                                validation_pod_namespace: validation_pod_namespace.clone(),
                            },
                            Some(&self.node_name),
                        )
                        .await
                } else {
                    let message = pod
                        .read_side_channel_file("error")
                        .await
                        .unwrap_or_default();
                    context
                        .set_state(
                            ProvisioningState::RemoveValidationPodAfterFailure {
                                validation_pod_namespace: validation_pod_namespace.clone(),
                                error_code: Code::InvalidArgument,
                                error_details: format!(
                                    "Validation pod failed: {}",
                                    message.trim()
                                ),
                            },
                            Some(&self.node_name),
                        )
                        .await
                }
            }

            ProvisioningState::RemoveValidationPod {
                validation_pod_namespace,
            } => {
                let pod = self.helper_pod(context, "validation", validation_pod_namespace);
                pod.delete().await?;
                context
                    .set_state(ProvisioningState::LaunchCreationPod, None)
                    .await
            }

            ProvisioningState::RemoveValidationPodAfterFailure {
                validation_pod_namespace,
                error_code,
                error_details,
            } => {
                let pod = self.helper_pod(context, "validation", validation_pod_namespace);
                pod.delete().await?;
                context
                    .set_state(
                        ProvisioningState::CreationFailed {
                            error_code: *error_code,
                            error_details: error_details.clone(),
                        },
                        None,
                    )
                    .await
            }

            ProvisioningState::AwaitCreationPod {
                creation_pod_namespace,
                handle,
                capacity,
            } => {
                self.await_creation_pod(context, creation_pod_namespace, handle, capacity)
                    .await
            }

            ProvisioningState::RemoveCreationPod {
                creation_pod_namespace,
                handle,
                capacity,
            } => {
                let pod = self.helper_pod(context, "creation", creation_pod_namespace);
                pod.delete().await?;
                context
                    .set_state(
                        ProvisioningState::Created {
                            handle: handle.clone(),
                            capacity: *capacity,
                        },
                        None,
                    )
                    .await
            }

            ProvisioningState::RemoveCreationPodAfterFailure {
                creation_pod_namespace,
                error_code,
                error_details,
            } => {
                let pod = self.helper_pod(context, "creation", creation_pod_namespace);
                pod.delete().await?;
                context
                    .set_state(
                        ProvisioningState::LaunchDeletionPodAfterFailure {
                            error_code: *error_code,
                            error_details: error_details.clone(),
                        },
                        None,
                    )
                    .await
            }

            ProvisioningState::AwaitDeletionPod {
                deletion_pod_namespace,
            } => {
                let pod = self.helper_pod(context, "deletion", deletion_pod_namespace);
                if pod.wait_until_terminated().await? {
                    context
                        .set_state(
                            ProvisioningState::RemoveDeletionPod {
                                deletion_pod_namespace: deletion_pod_namespace.clone(),
                            },
                            Some(&self.node_name),
                        )
                        .await
                } else {
                    self.deletion_pod_failed(context, &pod).await
                }
            }

            ProvisioningState::AwaitDeletionPodAfterFailure {
                deletion_pod_namespace,
                error_code,
                error_details,
            } => {
                let pod = self.helper_pod(context, "deletion", deletion_pod_namespace);
                if pod.wait_until_terminated().await? {
                    context
                        .set_state(
                            ProvisioningState::RemoveDeletionPodAfterFailure {
                                deletion_pod_namespace: deletion_pod_namespace.clone(),
                                error_code: *error_code,
                                error_details: error_details.clone(),
                            },
                            Some(&self.node_name),
                        )
                        .await
                } else {
                    self.deletion_pod_failed(context, &pod).await
                }
            }

            ProvisioningState::RemoveDeletionPod {
                deletion_pod_namespace,
            } => {
                let pod = self.helper_pod(context, "deletion", deletion_pod_namespace);
                pod.delete().await?;
                context.set_state(ProvisioningState::Deleted, None).await
            }

            ProvisioningState::RemoveDeletionPodAfterFailure {
                deletion_pod_namespace,
                error_code,
                error_details,
            } => {
                let pod = self.helper_pod(context, "deletion", deletion_pod_namespace);
                pod.delete().await?;
                context
                    .set_state(
                        ProvisioningState::CreationFailed {
                            error_code: *error_code,
                            error_details: error_details.clone(),
                        },
                        None,
                    )
                    .await
            }

            _ => Ok(()),
        }
    }
}

impl NodeProvisioningHandler {
    async fn await_creation_pod(
        &self,
        context: &ProvisioningContext,
        creation_pod_namespace: &str,
        state_handle: &Option<String>,
        state_capacity: &Option<i64>,
    ) -> anyhow::Result<()> {
        let pod = self.helper_pod(context, "creation", creation_pod_namespace);

        let fail = |message: String| ProvisioningState::RemoveCreationPodAfterFailure {
            creation_pod_namespace: creation_pod_namespace.to_owned(),
            error_code: Code::InvalidArgument,
            error_details: format!("Creation pod failed: {}", message.trim()),
        };

        if !pod.wait_until_terminated().await? {
            let message = pod
                .read_side_channel_file("error")
                .await
                .unwrap_or_default();
            return context.set_state(fail(message), Some(&self.node_name)).await;
        }

        // the handle may come from the side channel, the creation config, or
        // fall back to a claim-derived default
        let handle = match pod.read_side_channel_file("handle").await {
            Some(handle) => {
                let handle = handle.trim().to_owned();
                if handle.is_empty() {
                    return context
                        .set_state(
                            fail("Specified empty handle in file /pav/handle".to_owned()),
                            Some(&self.node_name),
                        )
                        .await;
                }
                handle
            }
            None => match state_handle {
                Some(handle) => handle.clone(),
                None => format!("pvc-{}", context.claim_uid()),
            },
        };

        // the capacity has no default; a creation pod that provides none and
        // has none in the config is an error
        let capacity = match pod.read_side_channel_file("capacity").await {
            Some(text) => match parse_quantity(&text, Rounding::HalfEven) {
                Ok(capacity) => capacity,
                Err(error) => {
                    return context
                        .set_state(
                            fail(format!(
                                "Specified invalid capacity in file /pav/capacity: {}",
                                error
                            )),
                            Some(&self.node_name),
                        )
                        .await;
                }
            },
            None => match state_capacity {
                Some(capacity) => *capacity,
                None => {
                    return context
                        .set_state(
                            fail(
                                "Creation pod didn't specify volume capacity in file /pav/capacity"
                                    .to_owned(),
                            ),
                            Some(&self.node_name),
                        )
                        .await;
                }
            },
        };

        context
            .set_state(
                ProvisioningState::RemoveCreationPod {
                    creation_pod_namespace: creation_pod_namespace.to_owned(),
                    handle,
                    capacity,
                },
                Some(&self.node_name),
            )
            .await
    }

    async fn deletion_pod_failed(
        &self,
        context: &ProvisioningContext,
        pod: &PodHandle,
    ) -> anyhow::Result<()> {
        let message = pod
            .read_side_channel_file("error")
            .await
            .unwrap_or_default();
        context
            .set_state(
                ProvisioningState::UnrecoverableFailure {
                    error_code: Code::InvalidArgument,
                    error_details: format!("Deletion pod failed: {}", message.trim()),
                },
                None,
            )
            .await
    }
}

// ---------------------------------------------------------------------------
// Staging

struct NodeStagingHandler {
    client: Client,
    node_name: String,
}

impl NodeStagingHandler {
    fn staging_pod(&self, context: &StagingContext, kind: &str, namespace: &str) -> PodHandle {
        let name = format!(
            "pav-volume-{}-pod-{}-{}",
            kind,
            context.claim_uid(),
            context.pod_uid()
        );
        PodHandle::new(
            self.client.clone(),
            &name,
            namespace,
            &side_channel_name(context),
        )
    }
}

fn side_channel_name(context: &StagingContext) -> String {
    format!(
        "pav-volume-stage-{}-{}",
        context.claim_uid(),
        context.pod_uid()
    )
}

#[async_trait::async_trait]
impl StagingHandler for NodeStagingHandler {
    fn handles(&self, state: &StagingState) -> bool {
        !state.is_terminal() && !matches!(state, StagingState::Staged { .. })
    }

    async fn handle(
        &self,
        context: &StagingContext,
        state: &StagingState,
    ) -> anyhow::Result<()> {
        match state {
            StagingState::LaunchStagingPod => self.launch_staging_pod(context).await,

            StagingState::AwaitStagingPod {
                staging_pod_namespace,
            } => {
                self.await_staging_pod(context, staging_pod_namespace)
                    .await
            }

            StagingState::RemoveStagingPod {
                staging_pod_namespace,
            } => {
                self.remove_staging_pod(context, staging_pod_namespace)
                    .await?;
                context.set_state(StagingState::LaunchUnstagingPod).await
            }

            StagingState::RemoveStagingPodAfterFailure {
                staging_pod_namespace,
                error_code,
                error_details,
            } => {
                self.remove_staging_pod(context, staging_pod_namespace)
                    .await?;
                context
                    .set_state(StagingState::LaunchUnstagingPodAfterFailure {
                        error_code: *error_code,
                        error_details: error_details.clone(),
                    })
                    .await
            }

            StagingState::LaunchUnstagingPod => {
                self.launch_unstaging_pod(context, None).await
            }

            StagingState::LaunchUnstagingPodAfterFailure {
                error_code,
                error_details,
            } => {
                self.launch_unstaging_pod(context, Some((*error_code, error_details.clone())))
                    .await
            }

            StagingState::AwaitUnstagingPod {
                unstaging_pod_namespace,
            } => {
                self.await_unstaging_pod(context, unstaging_pod_namespace, None)
                    .await
            }

            StagingState::AwaitUnstagingPodAfterFailure {
                unstaging_pod_namespace,
                error_code,
                error_details,
            } => {
                self.await_unstaging_pod(
                    context,
                    unstaging_pod_namespace,
                    Some((*error_code, error_details.clone())),
                )
                .await
            }

            StagingState::RemoveUnstagingPod {
                unstaging_pod_namespace,
            } => {
                let pod = self.staging_pod(context, "unstaging", unstaging_pod_namespace);
                pod.delete().await?;
                context.set_state(StagingState::Unstaged).await
            }

            StagingState::RemoveUnstagingPodAfterFailure {
                unstaging_pod_namespace,
                error_code,
                error_details,
            } => {
                let pod = self.staging_pod(context, "unstaging", unstaging_pod_namespace);
                pod.delete().await?;
                context
                    .set_state(StagingState::StagingFailed {
                        error_code: *error_code,
                        error_details: error_details.clone(),
                    })
                    .await
            }

            _ => Ok(()),
        }
    }
}

impl NodeStagingHandler {
    async fn launch_staging_pod(&self, context: &StagingContext) -> anyhow::Result<()> {
        let config = match context.eval_staging_config().await {
            Ok(config) => config,
            Err(error) => {
                return context
                    .set_state(StagingState::StagingFailed {
                        error_code: Code::InvalidArgument,
                        error_details: format!("{:#}", error),
                    })
                    .await;
            }
        };

        let pod_name = format!(
            "pav-volume-staging-pod-{}-{}",
            context.claim_uid(),
            context.pod_uid()
        );
        let side_channel = side_channel_name(context);
        let pod = match config
            .pod_template
            .create(
                &pod_name,
                Some(&self.node_name),
                Some(&side_channel),
                true,
            )
            .await
        {
            Ok(pod) => pod,
            Err(error) => {
                return context
                    .set_state(StagingState::RemoveStagingPodAfterFailure {
                        staging_pod_namespace: config.pod_template.namespace().to_owned(),
                        error_code: Code::InvalidArgument,
                        error_details: format!("{:#}", error),
                    })
                    .await;
            }
        };

        context
            .set_state(StagingState::AwaitStagingPod {
                staging_pod_namespace: pod.namespace().to_owned(),
            })
            .await
    }

    async fn await_staging_pod(
        &self,
        context: &StagingContext,
        staging_pod_namespace: &str,
    ) -> anyhow::Result<()> {
        let pod = self.staging_pod(context, "staging", staging_pod_namespace);

        let fail = |message: String| StagingState::RemoveStagingPodAfterFailure {
            staging_pod_namespace: staging_pod_namespace.to_owned(),
            error_code: Code::InvalidArgument,
            error_details: message,
        };

        if !pod.wait_until_terminated_or_ready().await? {
            let message = pod
                .read_side_channel_file("error")
                .await
                .unwrap_or_default();
            return context
                .set_state(fail(format!("Staging pod failed: {}", message.trim())))
                .await;
        }

        // resolve /pav/volume and make sure it stays inside the side channel
        let volume_path = pod.side_channel_path().join("volume");
        let resolved = match tokio::fs::canonicalize(&volume_path).await {
            Ok(resolved) => resolved,
            Err(error) => {
                return context
                    .set_state(fail(format!("Error resolving /pav/volume: {}", error)))
                    .await;
            }
        };
        if !resolves_within_side_channel(&resolved, pod.side_channel_path()) {
            return context
                .set_state(fail(
                    "/pav/volume resolves to a path outside /pav".to_owned(),
                ))
                .await;
        }

        let volume_mode: VolumeMode = context
            .pv
            .spec
            .as_ref()
            .and_then(|spec| spec.volume_mode.as_deref())
            .unwrap_or_default()
            .parse()?;

        let metadata = tokio::fs::metadata(&resolved).await?;
        match volume_mode {
            VolumeMode::Filesystem => {
                if !metadata.is_dir() {
                    return context
                        .set_state(fail("/pav/volume must resolve to a directory".to_owned()))
                        .await;
                }
            }
            VolumeMode::Block => {
                use std::os::unix::fs::FileTypeExt;
                if !metadata.file_type().is_block_device() {
                    return context
                        .set_state(fail(
                            "/pav/volume must resolve to a block special file".to_owned(),
                        ))
                        .await;
                }

                // a block volume must have exactly the declared capacity
                let declared = context
                    .pv
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.capacity.as_ref())
                    .and_then(|capacity| capacity.get("storage"))
                    .map(|quantity| parse_quantity(&quantity.0, Rounding::HalfEven))
                    .transpose()?
                    .unwrap_or_default();
                let actual = host::block_device_size(&resolved)? as i64;
                if actual != declared {
                    return context
                        .set_state(fail(format!(
                            "Block device at /pav/volume has size {}, should be {}",
                            actual, declared
                        )))
                        .await;
                }
            }
        }

        // expose the volume where the orchestrator expects it
        create_symlink(&resolved, &context.target_path_in_host).await?;

        context
            .set_state(StagingState::Staged {
                staging_pod_namespace: staging_pod_namespace.to_owned(),
            })
            .await
    }

    async fn remove_staging_pod(
        &self,
        context: &StagingContext,
        staging_pod_namespace: &str,
    ) -> anyhow::Result<()> {
        let pod = self.staging_pod(context, "staging", staging_pod_namespace);
        pod.delete().await?;

        match tokio::fs::remove_file(&context.target_path_in_host).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn launch_unstaging_pod(
        &self,
        context: &StagingContext,
        failure: Option<(Code, String)>,
    ) -> anyhow::Result<()> {
        let config = match context.eval_unstaging_config().await {
            Ok(config) => config,
            Err(error) => {
                return context
                    .set_state(StagingState::UnrecoverableFailure {
                        error_code: Code::InvalidArgument,
                        error_details: format!("{:#}", error),
                    })
                    .await;
            }
        };

        let template = match config.pod_template {
            Some(template) => template,
            None => {
                // no unstaging helper is configured; the mount is done
                let next = match failure {
                    None => StagingState::Unstaged,
                    Some((error_code, error_details)) => StagingState::StagingFailed {
                        error_code,
                        error_details,
                    },
                };
                return context.set_state(next).await;
            }
        };

        let pod_name = format!(
            "pav-volume-unstaging-pod-{}-{}",
            context.claim_uid(),
            context.pod_uid()
        );
        let side_channel = side_channel_name(context);
        let pod = match template
            .create(
                &pod_name,
                Some(&self.node_name),
                Some(&side_channel),
                true,
            )
            .await
        {
            Ok(pod) => pod,
            Err(error) => {
                return context
                    .set_state(StagingState::UnrecoverableFailure {
                        error_code: Code::InvalidArgument,
                        error_details: format!("{:#}", error),
                    })
                    .await;
            }
        };

        let next = match failure {
            None => StagingState::AwaitUnstagingPod {
                unstaging_pod_namespace: pod.namespace().to_owned(),
            },
            Some((error_code, error_details)) => StagingState::AwaitUnstagingPodAfterFailure {
                unstaging_pod_namespace: pod.namespace().to_owned(),
                error_code,
                error_details,
            },
        };
        context.set_state(next).await
    }

    async fn await_unstaging_pod(
        &self,
        context: &StagingContext,
        unstaging_pod_namespace: &str,
        failure: Option<(Code, String)>,
    ) -> anyhow::Result<()> {
        let pod = self.staging_pod(context, "unstaging", unstaging_pod_namespace);

        if !pod.wait_until_terminated().await? {
            // the unstaging helper must not fail; this requires operator
            // intervention
            let message = pod
                .read_side_channel_file("error")
                .await
                .unwrap_or_default();
            return context
                .set_state(StagingState::UnrecoverableFailure {
                    error_code: Code::InvalidArgument,
                    error_details: format!("Unstaging pod failed: {}", message.trim()),
                })
                .await;
        }

        let next = match failure {
            None => StagingState::RemoveUnstagingPod {
                unstaging_pod_namespace: unstaging_pod_namespace.to_owned(),
            },
            Some((error_code, error_details)) => StagingState::RemoveUnstagingPodAfterFailure {
                unstaging_pod_namespace: unstaging_pod_namespace.to_owned(),
                error_code,
                error_details,
            },
        };
        context.set_state(next).await
    }
}

/// Whether the canonicalized `/pav/volume` payload stays inside the
/// side-channel directory. The directory itself does not count.
fn resolves_within_side_channel(resolved: &Path, side_channel: &Path) -> bool {
    resolved != side_channel && resolved.starts_with(side_channel)
}

/// Create the target-path symlink, tolerating a retried handler finding its
/// own earlier symlink in place.
async fn create_symlink(target: &Path, link: &Path) -> anyhow::Result<()> {
    match tokio::fs::symlink(target, link).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == ErrorKind::AlreadyExists => {
            let existing = tokio::fs::read_link(link).await?;
            if existing == target {
                Ok(())
            } else {
                tokio::fs::remove_file(link).await?;
                tokio::fs::symlink(target, link).await?;
                Ok(())
            }
        }
        Err(error) => Err(error.into()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn containment_requires_a_strict_descendant() {
        let side_channel = Path::new("/var/lib/kubernetes-pav/vol-1");
        assert!(resolves_within_side_channel(
            Path::new("/var/lib/kubernetes-pav/vol-1/volume"),
            side_channel
        ));
        assert!(resolves_within_side_channel(
            Path::new("/var/lib/kubernetes-pav/vol-1/nested/dev"),
            side_channel
        ));
        // the directory itself is not a valid payload
        assert!(!resolves_within_side_channel(side_channel, side_channel));
        // escapes are rejected after canonicalization
        assert!(!resolves_within_side_channel(Path::new("/dev/sda1"), side_channel));
        assert!(!resolves_within_side_channel(
            Path::new("/var/lib/kubernetes-pav/vol-10/volume"),
            side_channel
        ));
    }

    #[tokio::test]
    async fn symlink_creation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("volume");
        tokio::fs::create_dir(&target).await.unwrap();
        let link = dir.path().join("target");

        create_symlink(&target, &link).await.unwrap();
        create_symlink(&target, &link).await.unwrap();
        assert_eq!(tokio::fs::read_link(&link).await.unwrap(), target);

        // a stale link pointing elsewhere is replaced
        let other = dir.path().join("other");
        tokio::fs::create_dir(&other).await.unwrap();
        create_symlink(&other, &link).await.unwrap();
        assert_eq!(tokio::fs::read_link(&link).await.unwrap(), other);
    }
}
