//! The cluster-wide controller agent.
//!
//! Drives the controller side of the provisioning state machine (the
//! `Launch*` states), marks claims whose deletion was requested, and keeps
//! the per-provisioner CSI plugin workloads deployed.

use std::sync::Arc;

use anyhow::Context as _;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::CSIDriver;
use kube::api::{Api, DynamicObject, ListParams, PostParams};
use kube::{Client, ResourceExt};
use kube_runtime::watcher;
use kube_runtime::watcher::Event;
use serde_json::json;
use tonic::Code;
use tracing::{info, warn};

use crate::agent::{run_provisioning_engine, ProvisioningContext, ProvisioningHandler};
use crate::config::{
    domain_key, CSI_NODE_DRIVER_REGISTRAR_IMAGE, CSI_PROVISIONER_IMAGE, INTERNAL_NAMESPACE,
};
use crate::kubernetes::{modify_atomically, synchronously_delete};
use crate::provisioner::{Provisioner, RequestedVolumeProperties, VolumeValidationConfig};
use crate::state::ProvisioningState;

/// Run the controller agent until failure.
pub async fn run(client: Client, image: String) -> anyhow::Result<()> {
    let handler = Arc::new(ControllerHandler {
        client: client.clone(),
    });

    tokio::try_join!(
        run_provisioning_engine(client.clone(), handler, None),
        reconcile_provisioners(client, image),
    )?;
    Ok(())
}

struct ControllerHandler {
    client: Client,
}

#[async_trait::async_trait]
impl ProvisioningHandler for ControllerHandler {
    /// Record a user's deletion of the claim as the `deletion-requested`
    /// marker, redirecting a finished machine back into the deletion path.
    async fn observe_claim(&self, pvc: &PersistentVolumeClaim) -> anyhow::Result<()> {
        if pvc.metadata.deletion_timestamp.is_none() {
            return Ok(());
        }
        let annotations = match pvc.metadata.annotations.as_ref() {
            Some(annotations) => annotations,
            None => return Ok(()),
        };
        if !annotations.contains_key(&domain_key("state"))
            || annotations.contains_key(&domain_key("deletion-requested"))
        {
            return Ok(());
        }

        let namespace = pvc.namespace().context("claim has no namespace")?;
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);
        modify_atomically(&api, &pvc.name(), |pvc| {
            let annotations = pvc
                .metadata
                .annotations
                .get_or_insert_with(Default::default);
            if annotations.contains_key(&domain_key("deletion-requested")) {
                return Ok(());
            }
            annotations.insert(domain_key("deletion-requested"), String::new());

            let state_json = annotations.get(&domain_key("state")).cloned();
            if let Some(state_json) = state_json {
                if let Ok(ProvisioningState::Created { .. }) =
                    ProvisioningState::from_json(&state_json)
                {
                    annotations.insert(
                        domain_key("state"),
                        ProvisioningState::LaunchDeletionPod.to_json(),
                    );
                }
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    fn handles(&self, state: &ProvisioningState) -> bool {
        matches!(
            state,
            ProvisioningState::LaunchValidationPod
                | ProvisioningState::LaunchCreationPod
                | ProvisioningState::LaunchDeletionPod
                | ProvisioningState::LaunchDeletionPodAfterFailure { .. }
        )
    }

    async fn handle(
        &self,
        context: &ProvisioningContext,
        state: &ProvisioningState,
    ) -> anyhow::Result<()> {
        match state {
            ProvisioningState::LaunchValidationPod => {
                self.launch_validation_pod(context).await
            }
            ProvisioningState::LaunchCreationPod => self.launch_creation_pod(context).await,
            ProvisioningState::LaunchDeletionPod => {
                self.launch_deletion_pod(context, None).await
            }
            ProvisioningState::LaunchDeletionPodAfterFailure {
                error_code,
                error_details,
            } => {
                self.launch_deletion_pod(context, Some((*error_code, error_details.clone())))
                    .await
            }
            _ => Ok(()),
        }
    }
}

impl ControllerHandler {
    async fn launch_validation_pod(&self, context: &ProvisioningContext) -> anyhow::Result<()> {
        let config = match context.eval_validation_config().await {
            Ok(config) => config,
            Err(error) => {
                return context
                    .set_state(creation_failed(format!("{:#}", error)), None)
                    .await;
            }
        };

        let requested = RequestedVolumeProperties::from_claim(&context.pvc)?;
        if let Err(message) = check_validation_bounds(&requested, &config) {
            return context.set_state(creation_failed(message), None).await;
        }

        let template = match &config.pod_template {
            Some(template) => template,
            None => {
                // nothing to run; the bounds above were the whole validation
                return context
                    .set_state(ProvisioningState::LaunchCreationPod, None)
                    .await;
            }
        };

        let pod_name = format!("pav-volume-validation-pod-{}", context.claim_uid());
        let pod = match template.create(&pod_name, None, None, false).await {
            Ok(pod) => pod,
            Err(error) => {
                return context
                    .set_state(
                        ProvisioningState::RemoveValidationPodAfterFailure {
                            validation_pod_namespace: template.namespace().to_owned(),
                            error_code: Code::InvalidArgument,
                            error_details: format!("{:#}", error),
                        },
                        None,
                    )
                    .await;
            }
        };

        let node = pod.wait_until_scheduled().await?;
        context
            .set_state(
                ProvisioningState::AwaitValidationPod {
                    validation_pod_namespace: pod.namespace().to_owned(),
                },
                Some(&node),
            )
            .await
    }

    async fn launch_creation_pod(&self, context: &ProvisioningContext) -> anyhow::Result<()> {
        let config = match context.eval_creation_config().await {
            Ok(config) => config,
            Err(error) => {
                return context
                    .set_state(creation_failed(format!("{:#}", error)), None)
                    .await;
            }
        };

        let template = match &config.pod_template {
            Some(template) => template,
            None => {
                // no helper to run; the config itself fully determines the
                // volume
                let capacity = match config.capacity {
                    Some(capacity) => capacity,
                    None => {
                        return context
                            .set_state(
                                creation_failed(
                                    "'spec.volumeCreation' specifies neither a capacity nor a \
                                     pod template"
                                        .to_owned(),
                                ),
                                None,
                            )
                            .await;
                    }
                };
                let handle = config
                    .handle
                    .unwrap_or_else(|| format!("pvc-{}", context.claim_uid()));
                return context
                    .set_state(ProvisioningState::Created { handle, capacity }, None)
                    .await;
            }
        };

        let pod_name = format!("pav-volume-creation-pod-{}", context.claim_uid());
        let pod = match template.create(&pod_name, None, None, false).await {
            Ok(pod) => pod,
            Err(error) => {
                return context
                    .set_state(
                        ProvisioningState::RemoveCreationPodAfterFailure {
                            creation_pod_namespace: template.namespace().to_owned(),
                            error_code: Code::InvalidArgument,
                            error_details: format!("{:#}", error),
                        },
                        None,
                    )
                    .await;
            }
        };

        let node = pod.wait_until_scheduled().await?;
        context
            .set_state(
                ProvisioningState::AwaitCreationPod {
                    creation_pod_namespace: pod.namespace().to_owned(),
                    handle: config.handle,
                    capacity: config.capacity,
                },
                Some(&node),
            )
            .await
    }

    async fn launch_deletion_pod(
        &self,
        context: &ProvisioningContext,
        failure: Option<(Code, String)>,
    ) -> anyhow::Result<()> {
        let config = match context.eval_deletion_config().await {
            Ok(config) => config,
            Err(error) => {
                // the deletion path must not fail; this requires operator
                // intervention
                return context
                    .set_state(
                        ProvisioningState::UnrecoverableFailure {
                            error_code: Code::InvalidArgument,
                            error_details: format!("{:#}", error),
                        },
                        None,
                    )
                    .await;
            }
        };

        let template = match &config.pod_template {
            Some(template) => template,
            None => {
                let next = match failure {
                    None => ProvisioningState::Deleted,
                    Some((error_code, error_details)) => ProvisioningState::CreationFailed {
                        error_code,
                        error_details,
                    },
                };
                return context.set_state(next, None).await;
            }
        };

        let pod_name = format!("pav-volume-deletion-pod-{}", context.claim_uid());
        let pod = match template.create(&pod_name, None, None, false).await {
            Ok(pod) => pod,
            Err(error) => {
                return context
                    .set_state(
                        ProvisioningState::UnrecoverableFailure {
                            error_code: Code::InvalidArgument,
                            error_details: format!("{:#}", error),
                        },
                        None,
                    )
                    .await;
            }
        };

        let node = pod.wait_until_scheduled().await?;
        let next = match failure {
            None => ProvisioningState::AwaitDeletionPod {
                deletion_pod_namespace: pod.namespace().to_owned(),
            },
            Some((error_code, error_details)) => ProvisioningState::AwaitDeletionPodAfterFailure {
                deletion_pod_namespace: pod.namespace().to_owned(),
                error_code,
                error_details,
            },
        };
        context.set_state(next, Some(&node)).await
    }
}

fn creation_failed(details: String) -> ProvisioningState {
    ProvisioningState::CreationFailed {
        error_code: Code::InvalidArgument,
        error_details: details,
    }
}

/// Check a claim's requested properties against the provisioner's validation
/// bounds.
fn check_validation_bounds(
    requested: &RequestedVolumeProperties,
    config: &VolumeValidationConfig,
) -> Result<(), String> {
    if !config.volume_modes.contains(&requested.volume_mode) {
        return Err(format!(
            "volume mode {} is not supported by the provisioner",
            requested.volume_mode
        ));
    }
    for mode in &requested.access_modes {
        if !config.access_modes.contains(mode) {
            return Err(format!(
                "access mode {} is not supported by the provisioner",
                mode
            ));
        }
    }
    if requested.min_capacity < config.min_capacity {
        return Err(format!(
            "requested capacity {} is below the provisioner's minimum of {}",
            requested.min_capacity, config.min_capacity
        ));
    }
    if let Some(max_capacity) = config.max_capacity {
        if requested.min_capacity > max_capacity {
            return Err(format!(
                "requested capacity {} exceeds the provisioner's maximum of {}",
                requested.min_capacity, max_capacity
            ));
        }
    }
    Ok(())
}

/// Watch Provisioner objects and keep their cluster-side children (the
/// CSIDriver object and the CSI plugin workloads) in their desired state.
async fn reconcile_provisioners(client: Client, image: String) -> anyhow::Result<()> {
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &Provisioner::api_resource());
    let mut stream = watcher(api, ListParams::default()).boxed();

    while let Some(event) = stream.next().await {
        let objects = match event {
            Ok(Event::Applied(object)) => vec![object],
            Ok(Event::Restarted(objects)) => objects,
            Ok(Event::Deleted(_)) => continue,
            Err(error) => {
                warn!(?error, "error streaming provisioner events");
                continue;
            }
        };
        for object in objects {
            let name = object.name();
            if let Err(error) = reconcile_provisioner(&client, &image, &object).await {
                warn!(provisioner = %name, error = ?error, "failed to reconcile provisioner");
            }
        }
    }

    anyhow::bail!("provisioner watch ended unexpectedly")
}

async fn reconcile_provisioner(
    client: &Client,
    image: &str,
    object: &DynamicObject,
) -> anyhow::Result<()> {
    let provisioner = Provisioner::from_object(client.clone(), object)?;

    if provisioner.is_marked_for_deletion() {
        return teardown_provisioner(client, &provisioner).await;
    }

    provisioner.validate()?;

    // adopt the provisioner before creating children for it
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &Provisioner::api_resource());
    modify_atomically(&api, provisioner.name(), |object| {
        let finalizers = object.metadata.finalizers.get_or_insert_with(Vec::new);
        let finalizer = domain_key("deploy");
        if !finalizers.contains(&finalizer) {
            finalizers.push(finalizer);
        }
        Ok(())
    })
    .await?;

    create_if_absent(
        Api::<CSIDriver>::all(client.clone()),
        csi_driver(&provisioner)?,
    )
    .await?;
    create_if_absent(
        Api::<Deployment>::namespaced(client.clone(), INTERNAL_NAMESPACE),
        controller_plugin_deployment(&provisioner, image)?,
    )
    .await?;
    create_if_absent(
        Api::<DaemonSet>::namespaced(client.clone(), INTERNAL_NAMESPACE),
        node_plugin_daemon_set(&provisioner, image)?,
    )
    .await?;

    Ok(())
}

async fn teardown_provisioner(client: &Client, provisioner: &Provisioner) -> anyhow::Result<()> {
    info!(provisioner = %provisioner.name(), "tearing down provisioner children");

    synchronously_delete(
        Api::<Deployment>::namespaced(client.clone(), INTERNAL_NAMESPACE),
        &controller_plugin_name(provisioner),
    )
    .await?;
    synchronously_delete(
        Api::<DaemonSet>::namespaced(client.clone(), INTERNAL_NAMESPACE),
        &node_plugin_name(provisioner),
    )
    .await?;
    synchronously_delete(Api::<CSIDriver>::all(client.clone()), provisioner.name()).await?;

    let api: Api<DynamicObject> = Api::all_with(client.clone(), &Provisioner::api_resource());
    modify_atomically(&api, provisioner.name(), |object| {
        if let Some(finalizers) = object.metadata.finalizers.as_mut() {
            finalizers.retain(|finalizer| finalizer != &domain_key("deploy"));
        }
        Ok(())
    })
    .await?;
    Ok(())
}

async fn create_if_absent<K>(api: Api<K>, object: K) -> anyhow::Result<()>
where
    K: kube::Resource + Clone + serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.create(&PostParams::default(), &object).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 409 => Ok(()),
        Err(error) => Err(error.into()),
    }
}

fn controller_plugin_name(provisioner: &Provisioner) -> String {
    format!("pav-controller-plugin-{}", provisioner.name())
}

fn node_plugin_name(provisioner: &Provisioner) -> String {
    format!("pav-node-plugin-{}", provisioner.name())
}

/// The CSIDriver object registering this provisioner with the orchestrator.
/// `podInfoOnMount` is required for the node plugin to learn which client pod
/// a publish request belongs to.
fn csi_driver(provisioner: &Provisioner) -> anyhow::Result<CSIDriver> {
    Ok(serde_json::from_value(json!({
        "apiVersion": "storage.k8s.io/v1",
        "kind": "CSIDriver",
        "metadata": {
            "name": provisioner.name(),
            "labels": { "app.kubernetes.io/managed-by": "kubernetes-pav" },
        },
        "spec": {
            "attachRequired": false,
            "podInfoOnMount": true,
            "volumeLifecycleModes": ["Persistent"],
        },
    }))?)
}

fn controller_plugin_deployment(
    provisioner: &Provisioner,
    image: &str,
) -> anyhow::Result<Deployment> {
    let name = controller_plugin_name(provisioner);
    Ok(serde_json::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": name,
            "namespace": INTERNAL_NAMESPACE,
            "labels": { "app.kubernetes.io/managed-by": "kubernetes-pav" },
        },
        "spec": {
            "replicas": 1,
            "selector": { "matchLabels": { "app": name } },
            "template": {
                "metadata": { "labels": { "app": name } },
                "spec": {
                    "serviceAccountName": "pav-csi-plugin",
                    "containers": [
                        {
                            "name": "csi-provisioner",
                            "image": CSI_PROVISIONER_IMAGE,
                            "args": ["--csi-address=/csi/socket"],
                            "volumeMounts": [
                                { "name": "socket-dir", "mountPath": "/csi" },
                            ],
                        },
                        {
                            "name": "csi-plugin",
                            "image": image,
                            "args": [
                                "csi-plugin",
                                provisioner.name(),
                                provisioner.uid(),
                                "controller",
                            ],
                            "volumeMounts": [
                                { "name": "socket-dir", "mountPath": "/csi" },
                            ],
                        },
                    ],
                    "volumes": [
                        { "name": "socket-dir", "emptyDir": {} },
                    ],
                },
            },
        },
    }))?)
}

fn node_plugin_daemon_set(provisioner: &Provisioner, image: &str) -> anyhow::Result<DaemonSet> {
    let name = node_plugin_name(provisioner);
    let kubelet_plugin_dir = format!("/var/lib/kubelet/plugins/{}", provisioner.name());
    Ok(serde_json::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "DaemonSet",
        "metadata": {
            "name": name,
            "namespace": INTERNAL_NAMESPACE,
            "labels": { "app.kubernetes.io/managed-by": "kubernetes-pav" },
        },
        "spec": {
            "selector": { "matchLabels": { "app": name } },
            "template": {
                "metadata": { "labels": { "app": name } },
                "spec": {
                    "serviceAccountName": "pav-csi-plugin",
                    "containers": [
                        {
                            "name": "csi-node-driver-registrar",
                            "image": CSI_NODE_DRIVER_REGISTRAR_IMAGE,
                            "args": [
                                "--csi-address=/csi/socket",
                                format!("--kubelet-registration-path={}/socket", kubelet_plugin_dir),
                            ],
                            "volumeMounts": [
                                { "name": "socket-dir", "mountPath": "/csi" },
                                { "name": "registration-dir", "mountPath": "/registration" },
                            ],
                        },
                        {
                            "name": "csi-plugin",
                            "image": image,
                            "args": [
                                "csi-plugin",
                                provisioner.name(),
                                provisioner.uid(),
                                "node",
                                "$(NODE_NAME)",
                            ],
                            "env": [
                                {
                                    "name": "NODE_NAME",
                                    "valueFrom": { "fieldRef": { "fieldPath": "spec.nodeName" } },
                                },
                            ],
                            "volumeMounts": [
                                { "name": "socket-dir", "mountPath": "/csi" },
                            ],
                        },
                    ],
                    "volumes": [
                        {
                            "name": "socket-dir",
                            "hostPath": { "path": kubelet_plugin_dir, "type": "DirectoryOrCreate" },
                        },
                        {
                            "name": "registration-dir",
                            "hostPath": { "path": "/var/lib/kubelet/plugins_registry", "type": "Directory" },
                        },
                    ],
                },
            },
        },
    }))?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::provisioner::{AccessMode, VolumeMode};
    use std::collections::BTreeSet;

    fn requested(volume_mode: VolumeMode, min_capacity: i64) -> RequestedVolumeProperties {
        RequestedVolumeProperties {
            volume_mode,
            access_modes: BTreeSet::from([AccessMode::ReadWriteOnce]),
            min_capacity,
            max_capacity: None,
        }
    }

    fn bounds(min_capacity: i64, max_capacity: Option<i64>) -> VolumeValidationConfig {
        VolumeValidationConfig {
            volume_modes: BTreeSet::from([VolumeMode::Filesystem]),
            access_modes: BTreeSet::from([AccessMode::ReadWriteOnce, AccessMode::ReadOnlyMany]),
            min_capacity,
            max_capacity,
            pod_template: None,
        }
    }

    #[test]
    fn bounds_accept_a_conforming_claim() {
        let result = check_validation_bounds(
            &requested(VolumeMode::Filesystem, 1024),
            &bounds(1, Some(1 << 30)),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn bounds_reject_an_unsupported_volume_mode() {
        let result =
            check_validation_bounds(&requested(VolumeMode::Block, 1024), &bounds(1, None));
        assert!(result.unwrap_err().contains("volume mode"));
    }

    #[test]
    fn bounds_reject_out_of_range_capacities() {
        let result =
            check_validation_bounds(&requested(VolumeMode::Filesystem, 10), &bounds(1024, None));
        assert!(result.unwrap_err().contains("below"));

        let result = check_validation_bounds(
            &requested(VolumeMode::Filesystem, 4096),
            &bounds(1, Some(1024)),
        );
        assert!(result.unwrap_err().contains("exceeds"));
    }

    #[test]
    fn bounds_reject_an_unsupported_access_mode() {
        let mut properties = requested(VolumeMode::Filesystem, 1024);
        properties.access_modes = BTreeSet::from([AccessMode::ReadWriteMany]);
        let result = check_validation_bounds(&properties, &bounds(1, None));
        assert!(result.unwrap_err().contains("access mode"));
    }
}
