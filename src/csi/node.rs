//! The CSI node service: staging volumes for client pods and unstaging them.

use anyhow::Context as _;
use k8s_csi::v1_3_0::node_server::Node;
use k8s_csi::v1_3_0::*;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use lazy_static::lazy_static;
use regex::Regex;
use tonic::{Code, Request, Response, Status};

use crate::config::{domain_key, DOMAIN};
use crate::csi::common::{
    abort, access_mode_name, capability_volume_mode, ensure_provisioner_is_not_being_deleted,
    ensure_rpc, instrument_rpc, reject_mount_options,
};
use crate::kubernetes::{modify_atomically, watch_object, ClusterObjectRef, ObjectRef};
use crate::state::StagingState;

lazy_static! {
    static ref TARGET_PATH_KEY_PATTERN: Regex = Regex::new(&format!(
        r"^{}/(\w{{8}}-\w{{4}}-\w{{4}}-\w{{4}}-\w{{12}})-target-path-in-host$",
        regex::escape(DOMAIN)
    ))
    .unwrap();
}

/// The (client pod, claim) pair behind one staged mount.
struct VolumeStageRef {
    client_pod: ObjectRef,
    pvc: ObjectRef,
}

pub struct NodeService {
    client: Client,
    provisioner: ClusterObjectRef,
    node_name: String,
}

impl NodeService {
    pub fn new(client: Client, provisioner: ClusterObjectRef, node_name: String) -> Self {
        NodeService {
            client,
            provisioner,
            node_name,
        }
    }

    async fn handle_publish(&self, request: &NodePublishVolumeRequest) -> anyhow::Result<()> {
        ensure_provisioner_is_not_being_deleted(&self.client, &self.provisioner.name).await?;

        let context_value = |key: &str| -> anyhow::Result<&String> {
            request
                .volume_context
                .get(key)
                .with_context(|| format!("request carries no {} value", key))
        };
        let client_pod_ref = ObjectRef {
            name: context_value("csi.storage.k8s.io/pod.name")?.clone(),
            namespace: context_value("csi.storage.k8s.io/pod.namespace")?.clone(),
            uid: context_value("csi.storage.k8s.io/pod.uid")?.clone(),
        };

        let pv = self.find_volume(&request.volume_id).await?;
        let claim_ref = pv
            .spec
            .as_ref()
            .and_then(|spec| spec.claim_ref.as_ref())
            .context("volume references no claim")?;
        let pvc_ref = ObjectRef {
            name: claim_ref.name.clone().context("claim reference has no name")?,
            namespace: claim_ref
                .namespace
                .clone()
                .context("claim reference has no namespace")?,
            uid: claim_ref.uid.clone().context("claim reference has no uid")?,
        };

        let pvc_api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &pvc_ref.namespace);
        let pvc = pvc_api.get(&pvc_ref.name).await?;
        anyhow::ensure!(
            pvc.uid().as_deref() == Some(pvc_ref.uid.as_str()),
            "claim does not match the volume's claim reference"
        );

        self.assert_request_matches_volume(request, &pv, &pvc)?;

        if let Some(capability) = request.volume_capability.as_ref() {
            // these can only be wrong for statically provisioned volumes;
            // dynamic ones would have failed during creation
            reject_mount_options(
                capability,
                "must not specify 'PersistentVolume.spec.csi.fsType'",
                "must not specify 'PersistentVolume.spec.mountOptions'",
            )?;
        }

        self.delegate_staging_to_agent(
            &client_pod_ref,
            &pvc_ref,
            &request.target_path,
            request.readonly,
        )
        .await?;
        self.wait_for_agent_to_stage_volume(&client_pod_ref, &pvc_ref)
            .await
    }

    /// The only field selectors valid for volumes are name and namespace, so
    /// scan them all for the one with this handle.
    async fn find_volume(&self, volume_id: &str) -> anyhow::Result<PersistentVolume> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let volumes = api.list(&ListParams::default()).await?;

        let mut matches = volumes.items.into_iter().filter(|pv| {
            pv.spec
                .as_ref()
                .and_then(|spec| spec.csi.as_ref())
                .map_or(false, |csi| {
                    csi.driver == self.provisioner.name && csi.volume_handle == volume_id
                })
        });

        let volume = matches
            .next()
            .with_context(|| format!("no volume has handle {:?}", volume_id))?;
        anyhow::ensure!(
            matches.next().is_none(),
            "more than one volume has handle {:?}",
            volume_id
        );
        Ok(volume)
    }

    /// The agent will reconstruct the request's data from the volume and the
    /// claim, so they must agree.
    fn assert_request_matches_volume(
        &self,
        request: &NodePublishVolumeRequest,
        pv: &PersistentVolume,
        pvc: &PersistentVolumeClaim,
    ) -> anyhow::Result<()> {
        let driver = pv
            .spec
            .as_ref()
            .and_then(|spec| spec.csi.as_ref())
            .map(|csi| csi.driver.as_str())
            .context("volume has no CSI source")?;
        anyhow::ensure!(
            self.provisioner.name == driver,
            "volume belongs to a different provisioner"
        );

        let capability = request
            .volume_capability
            .as_ref()
            .context("request specifies no volume capability")?;

        let request_mode = capability_volume_mode(capability)?;
        let claim_mode = pvc
            .spec
            .as_ref()
            .and_then(|spec| spec.volume_mode.as_deref())
            .unwrap_or("Filesystem");
        anyhow::ensure!(
            request_mode == claim_mode,
            "request and claim disagree on the volume mode"
        );

        let access_mode = capability
            .access_mode
            .as_ref()
            .context("request specifies no access mode")?;
        let access_mode = access_mode_name(access_mode.mode)?;
        let claim_access_modes = pvc
            .spec
            .as_ref()
            .and_then(|spec| spec.access_modes.as_deref())
            .unwrap_or_default();
        anyhow::ensure!(
            claim_access_modes.iter().any(|mode| mode == access_mode),
            "request access mode is not among the claim's access modes"
        );

        Ok(())
    }

    /// Install the per-mount annotation group, labels, and finalizer on the
    /// client pod and kick the staging machine.
    async fn delegate_staging_to_agent(
        &self,
        client_pod_ref: &ObjectRef,
        pvc_ref: &ObjectRef,
        target_path: &str,
        read_only: bool,
    ) -> anyhow::Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &client_pod_ref.namespace);
        let prefix = |suffix: &str| domain_key(&format!("{}-{}", pvc_ref.uid, suffix));
        let provisioner_uid = self.provisioner.uid.clone();

        modify_atomically(&api, &client_pod_ref.name, |pod| {
            ensure_rpc(
                pod.uid().as_deref() == Some(client_pod_ref.uid.as_str()),
                Code::FailedPrecondition,
                "Pod object was replaced",
            )?;

            let annotations = pod
                .metadata
                .annotations
                .get_or_insert_with(Default::default);
            let state = annotations
                .get(&prefix("state"))
                .map(|json| StagingState::from_json(json))
                .transpose()?;
            let unstaging_requested = annotations.contains_key(&prefix("unstaging-requested"));

            // only an unstarted mount or one whose staging failed may be
            // (re)started
            let may_start = matches!(state, None | Some(StagingState::StagingFailed { .. }));
            if may_start {
                let labels = pod.metadata.labels.get_or_insert_with(Default::default);
                labels.insert(domain_key("uses-volumes"), String::new());
                labels.insert(
                    domain_key(&format!("uses-volume-{}", pvc_ref.uid)),
                    String::new(),
                );
                labels.insert(
                    domain_key(&format!("uses-provisioner-{}", provisioner_uid)),
                    String::new(),
                );

                if !unstaging_requested {
                    let finalizers = pod.metadata.finalizers.get_or_insert_with(Vec::new);
                    let finalizer = prefix("unstage-volume");
                    if !finalizers.contains(&finalizer) {
                        finalizers.push(finalizer);
                    }

                    let annotations = pod
                        .metadata
                        .annotations
                        .get_or_insert_with(Default::default);
                    annotations.insert(
                        prefix("state"),
                        StagingState::LaunchStagingPod.to_json(),
                    );
                    annotations.insert(prefix("pvc-name"), pvc_ref.name.clone());
                    annotations.insert(prefix("pvc-namespace"), pvc_ref.namespace.clone());
                    annotations.insert(prefix("target-path-in-host"), target_path.to_owned());
                    annotations.insert(prefix("read-only"), read_only.to_string());
                }
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn wait_for_agent_to_stage_volume(
        &self,
        client_pod_ref: &ObjectRef,
        pvc_ref: &ObjectRef,
    ) -> anyhow::Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &client_pod_ref.namespace);
        let state_key = domain_key(&format!("{}-state", pvc_ref.uid));
        let pod_uid = client_pod_ref.uid.clone();

        watch_object(api, &client_pod_ref.name, move |pod: &Pod| {
            ensure_rpc(
                pod.uid().as_deref() == Some(pod_uid.as_str()),
                Code::FailedPrecondition,
                "Pod object was replaced",
            )?;

            let state_json = pod
                .metadata
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(&state_key))
                .context("client pod carries no staging state")?;
            let state = StagingState::from_json(state_json)?;

            match state {
                StagingState::StagingFailed {
                    error_code,
                    error_details,
                }
                | StagingState::UnrecoverableFailure {
                    error_code,
                    error_details,
                } => Err(abort(error_code, error_details)),
                StagingState::Staged { .. } => Ok(Some(())),
                state if state.is_after_staged() => {
                    // the volume already started being unstaged
                    Err(abort(Code::Aborted, "volume is already being unstaged"))
                }
                _ => Ok(None),
            }
        })
        .await
    }

    async fn handle_unpublish(&self, request: &NodeUnpublishVolumeRequest) -> anyhow::Result<()> {
        // the target path embeds the client pod and claim uids, so it is
        // globally unique; an unknown path means there is nothing to undo
        let stage_ref = match self.find_stage_ref(&request.target_path).await? {
            Some(stage_ref) => stage_ref,
            None => return Ok(()),
        };

        self.delegate_unstaging_to_agent(&stage_ref).await?;
        self.wait_for_agent_to_unstage_volume(&stage_ref).await
    }

    /// Find the (client pod, claim) pair whose mount owns `target_path`, by
    /// scanning the pods on this node.
    async fn find_stage_ref(&self, target_path: &str) -> anyhow::Result<Option<VolumeStageRef>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={}", self.node_name));
        let pods = api.list(&params).await?;

        let mut matches = pods.items.iter().filter_map(|pod| {
            let annotations = pod.metadata.annotations.as_ref()?;
            let claim_uid = annotations.iter().find_map(|(key, value)| {
                let captures = TARGET_PATH_KEY_PATTERN.captures(key)?;
                (value.as_str() == target_path).then(|| captures[1].to_owned())
            })?;
            Some((pod, claim_uid))
        });

        let (pod, claim_uid) = match matches.next() {
            Some(found) => found,
            None => return Ok(None),
        };
        anyhow::ensure!(
            matches.next().is_none(),
            "more than one mount owns target path {:?}",
            target_path
        );

        let annotations = pod
            .metadata
            .annotations
            .as_ref()
            .context("client pod has no annotations")?;
        let annotation = |suffix: &str| -> anyhow::Result<String> {
            let key = domain_key(&format!("{}-{}", claim_uid, suffix));
            annotations
                .get(&key)
                .cloned()
                .with_context(|| format!("client pod has no {} annotation", key))
        };

        Ok(Some(VolumeStageRef {
            client_pod: ObjectRef {
                name: pod.name(),
                namespace: pod.namespace().context("client pod has no namespace")?,
                uid: pod.uid().context("client pod has no uid")?,
            },
            pvc: ObjectRef {
                name: annotation("pvc-name")?,
                namespace: annotation("pvc-namespace")?,
                uid: claim_uid,
            },
        }))
    }

    /// Write the unstaging-requested marker and, if the mount is currently
    /// staged, advance it into the removal path directly.
    async fn delegate_unstaging_to_agent(&self, stage_ref: &VolumeStageRef) -> anyhow::Result<()> {
        let api: Api<Pod> =
            Api::namespaced(self.client.clone(), &stage_ref.client_pod.namespace);
        let prefix = |suffix: &str| domain_key(&format!("{}-{}", stage_ref.pvc.uid, suffix));
        let pod_uid = stage_ref.client_pod.uid.clone();

        modify_atomically(&api, &stage_ref.client_pod.name, |pod| {
            ensure_rpc(
                pod.uid().as_deref() == Some(pod_uid.as_str()),
                Code::FailedPrecondition,
                "Pod object was replaced",
            )?;

            let annotations = pod
                .metadata
                .annotations
                .get_or_insert_with(Default::default);
            let state = annotations
                .get(&prefix("state"))
                .map(|json| StagingState::from_json(json))
                .transpose()?
                .context("client pod carries no staging state")?;

            annotations.insert(prefix("unstaging-requested"), String::new());

            if let StagingState::Staged {
                staging_pod_namespace,
            } = state
            {
                annotations.insert(
                    prefix("state"),
                    StagingState::RemoveStagingPod {
                        staging_pod_namespace,
                    }
                    .to_json(),
                );
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn wait_for_agent_to_unstage_volume(
        &self,
        stage_ref: &VolumeStageRef,
    ) -> anyhow::Result<()> {
        let api: Api<Pod> =
            Api::namespaced(self.client.clone(), &stage_ref.client_pod.namespace);
        let state_key = domain_key(&format!("{}-state", stage_ref.pvc.uid));
        let pod_uid = stage_ref.client_pod.uid.clone();

        watch_object(api, &stage_ref.client_pod.name, move |pod: &Pod| {
            ensure_rpc(
                pod.uid().as_deref() == Some(pod_uid.as_str()),
                Code::FailedPrecondition,
                "Pod object was replaced",
            )?;

            let state_json = pod
                .metadata
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(&state_key))
                .context("client pod carries no staging state")?;
            let state = StagingState::from_json(state_json)?;

            let done = matches!(
                state,
                StagingState::Unstaged
                    | StagingState::StagingFailed { .. }
                    | StagingState::UnrecoverableFailure { .. }
            );
            Ok(done.then(|| ()))
        })
        .await
    }
}

#[async_trait::async_trait]
impl Node for NodeService {
    async fn node_get_info(
        &self,
        request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        let request = request.into_inner();
        instrument_rpc("Node", "NodeGetInfo", &request, async {
            Ok(NodeGetInfoResponse {
                node_id: self.node_name.clone(),
                max_volumes_per_node: 0,
                accessible_topology: None,
            })
        })
        .await
    }

    async fn node_get_capabilities(
        &self,
        request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        let request = request.into_inner();
        instrument_rpc("Node", "NodeGetCapabilities", &request, async {
            Ok(NodeGetCapabilitiesResponse {
                capabilities: Vec::new(),
            })
        })
        .await
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let request = request.into_inner();
        instrument_rpc("Node", "NodePublishVolume", &request, async {
            self.handle_publish(&request).await?;
            Ok(NodePublishVolumeResponse {})
        })
        .await
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let request = request.into_inner();
        instrument_rpc("Node", "NodeUnpublishVolume", &request, async {
            self.handle_unpublish(&request).await?;
            Ok(NodeUnpublishVolumeResponse {})
        })
        .await
    }

    // Staging to a node-global path is not advertised; the orchestrator only
    // calls publish and unpublish.

    async fn node_stage_volume(
        &self,
        _request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        Err(Status::unimplemented("not supported"))
    }

    async fn node_unstage_volume(
        &self,
        _request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        Err(Status::unimplemented("not supported"))
    }

    async fn node_get_volume_stats(
        &self,
        _request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        Err(Status::unimplemented("not supported"))
    }

    async fn node_expand_volume(
        &self,
        _request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("not supported"))
    }
}
