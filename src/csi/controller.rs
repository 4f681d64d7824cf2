//! The CSI controller service: volume creation and deletion.

use std::collections::BTreeSet;

use anyhow::Context as _;
use k8s_csi::v1_3_0::controller_server::Controller;
use k8s_csi::v1_3_0::controller_service_capability::rpc::Type as RpcType;
use k8s_csi::v1_3_0::controller_service_capability::{Rpc, Type};
use k8s_csi::v1_3_0::*;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::Api;
use kube::{Client, ResourceExt};
use tonic::{Code, Request, Response, Status};

use crate::config::domain_key;
use crate::csi::common::{
    abort, access_mode_name, capability_volume_mode, ensure_provisioner_is_not_being_deleted,
    ensure_rpc, instrument_rpc, reject_mount_options,
};
use crate::kubernetes::quantity::{parse_quantity, Rounding};
use crate::kubernetes::{modify_atomically, watch_object, ClusterObjectRef, ObjectRef};
use crate::state::ProvisioningState;

pub struct ControllerService {
    client: Client,
    provisioner: ClusterObjectRef,
}

impl ControllerService {
    pub fn new(client: Client, provisioner: ClusterObjectRef) -> Self {
        ControllerService {
            client,
            provisioner,
        }
    }

    async fn handle_create_volume(&self, request: &CreateVolumeRequest) -> anyhow::Result<Volume> {
        ensure_provisioner_is_not_being_deleted(&self.client, &self.provisioner.name).await?;

        let pvc_name = request
            .parameters
            .get("csi.storage.k8s.io/pvc/name")
            .context("request carries no claim name")?;
        let pvc_namespace = request
            .parameters
            .get("csi.storage.k8s.io/pvc/namespace")
            .context("request carries no claim namespace")?;

        let pvc_api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), pvc_namespace);
        let pvc = pvc_api.get(pvc_name).await?;

        let sc_name = pvc
            .spec
            .as_ref()
            .and_then(|spec| spec.storage_class_name.as_deref())
            .context("claim names no storage class")?;
        let sc_api: Api<StorageClass> = Api::all(self.client.clone());
        let sc = sc_api.get(sc_name).await?;

        self.assert_request_matches_claim_and_class(request, &pvc, &sc)?;

        for capability in &request.volume_capabilities {
            reject_mount_options(
                capability,
                "must not specify 'StorageClass.parameters[\"csi.storage.k8s.io/fstype\"]'",
                "must not specify 'StorageClass.mountOptions'",
            )?;
        }

        let pvc_ref = ObjectRef {
            name: pvc_name.clone(),
            namespace: pvc_namespace.clone(),
            uid: pvc.uid().context("claim has no uid")?,
        };

        self.delegate_creation_to_agents(&pvc_ref, &sc).await?;
        let (handle, capacity) = self.wait_for_agents_to_create_volume(&pvc_ref).await?;

        Ok(Volume {
            volume_id: handle,
            capacity_bytes: capacity,
            // copies the class parameters onto the volume object
            volume_context: sc.parameters.clone().unwrap_or_default(),
            ..Default::default()
        })
    }

    /// The agents will reconstruct the request's data from the claim and the
    /// class, so the three must agree.
    fn assert_request_matches_claim_and_class(
        &self,
        request: &CreateVolumeRequest,
        pvc: &PersistentVolumeClaim,
        sc: &StorageClass,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.provisioner.name == sc.provisioner,
            "storage class names a different provisioner"
        );

        let spec = pvc.spec.as_ref().context("claim has no spec")?;

        let request_modes: BTreeSet<&str> = request
            .volume_capabilities
            .iter()
            .map(capability_volume_mode)
            .collect::<anyhow::Result<_>>()?;
        let claim_mode = spec.volume_mode.as_deref().unwrap_or("Filesystem");
        anyhow::ensure!(
            request_modes.len() == 1 && request_modes.contains(claim_mode),
            "request and claim disagree on the volume mode"
        );

        let request_access_modes: BTreeSet<&str> = request
            .volume_capabilities
            .iter()
            .map(|capability| {
                let mode = capability
                    .access_mode
                    .as_ref()
                    .context("volume capability specifies no access mode")?;
                access_mode_name(mode.mode)
            })
            .collect::<anyhow::Result<_>>()?;
        let claim_access_modes: BTreeSet<&str> = spec
            .access_modes
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(String::as_str)
            .collect();
        anyhow::ensure!(
            request_access_modes == claim_access_modes,
            "request and claim disagree on the access modes"
        );

        let resources = spec.resources.as_ref().context("claim has no resources")?;
        let min_capacity = resources
            .requests
            .as_ref()
            .and_then(|requests| requests.get("storage"))
            .map(|quantity| parse_quantity(&quantity.0, Rounding::HalfEven))
            .transpose()?
            .unwrap_or_default();
        let max_capacity = resources
            .limits
            .as_ref()
            .and_then(|limits| limits.get("storage"))
            .map(|quantity| parse_quantity(&quantity.0, Rounding::HalfEven))
            .transpose()?
            .unwrap_or_default();
        let range = request.capacity_range.clone().unwrap_or_default();
        anyhow::ensure!(
            range.required_bytes == min_capacity && range.limit_bytes == max_capacity,
            "request and claim disagree on the capacity range"
        );

        let class_parameters = sc.parameters.clone().unwrap_or_default();
        anyhow::ensure!(
            class_parameters
                .iter()
                .all(|(key, value)| request.parameters.get(key) == Some(value)),
            "request parameters are not a superset of the class parameters"
        );

        Ok(())
    }

    /// Freeze the storage class into the claim, install the provisioner label
    /// and the delete-volume finalizer, and kick the provisioning machine.
    async fn delegate_creation_to_agents(
        &self,
        pvc_ref: &ObjectRef,
        sc: &StorageClass,
    ) -> anyhow::Result<()> {
        // the class can be deleted before the claim, so store a snapshot
        let sc_json = serde_json::to_string(sc)?;
        let provisioner_name = self.provisioner.name.clone();

        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &pvc_ref.namespace);
        modify_atomically(&api, &pvc_ref.name, |pvc| {
            ensure_rpc(
                pvc.uid().as_deref() == Some(pvc_ref.uid.as_str()),
                Code::FailedPrecondition,
                "PersistentVolumeClaim object was replaced",
            )?;

            let annotations = pvc
                .metadata
                .annotations
                .get_or_insert_with(Default::default);
            annotations.insert(domain_key("storage-class"), sc_json.clone());

            let state = annotations
                .get(&domain_key("state"))
                .map(|json| ProvisioningState::from_json(json))
                .transpose()?;
            let deletion_requested =
                annotations.contains_key(&domain_key("deletion-requested"));

            // only an unstarted claim or one whose creation failed may be
            // (re)started
            let may_start = matches!(
                state,
                None | Some(ProvisioningState::CreationFailed { .. })
            );
            if may_start {
                pvc.metadata
                    .labels
                    .get_or_insert_with(Default::default)
                    .insert(domain_key("provisioner"), provisioner_name.clone());

                if !deletion_requested {
                    let finalizers = pvc.metadata.finalizers.get_or_insert_with(Vec::new);
                    let finalizer = domain_key("delete-volume");
                    if !finalizers.contains(&finalizer) {
                        finalizers.push(finalizer);
                    }

                    pvc.metadata
                        .annotations
                        .get_or_insert_with(Default::default)
                        .insert(
                            domain_key("state"),
                            ProvisioningState::LaunchValidationPod.to_json(),
                        );
                }
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn wait_for_agents_to_create_volume(
        &self,
        pvc_ref: &ObjectRef,
    ) -> anyhow::Result<(String, i64)> {
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &pvc_ref.namespace);
        let uid = pvc_ref.uid.clone();

        watch_object(api, &pvc_ref.name, move |pvc: &PersistentVolumeClaim| {
            ensure_rpc(
                pvc.uid().as_deref() == Some(uid.as_str()),
                Code::FailedPrecondition,
                "PersistentVolumeClaim object was replaced",
            )?;

            let state_json = pvc
                .metadata
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(&domain_key("state")))
                .context("claim carries no provisioning state")?;
            let state = ProvisioningState::from_json(state_json)?;

            match state {
                ProvisioningState::CreationFailed {
                    error_code,
                    error_details,
                }
                | ProvisioningState::UnrecoverableFailure {
                    error_code,
                    error_details,
                } => Err(abort(error_code, error_details)),
                ProvisioningState::Created { handle, capacity } => Ok(Some((handle, capacity))),
                state if state.is_after_created() => {
                    // the volume already started being deleted
                    Err(abort(Code::Aborted, "volume is already being deleted"))
                }
                _ => Ok(None),
            }
        })
        .await
    }
}

#[async_trait::async_trait]
impl Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let request = request.into_inner();
        instrument_rpc("Controller", "CreateVolume", &request, async {
            let volume = self.handle_create_volume(&request).await?;
            Ok(CreateVolumeResponse {
                volume: Some(volume),
            })
        })
        .await
    }

    /// Deletion is driven by finalizer removal: this RPC is only invoked
    /// after the claim is fully deleted, which only happens after the agents
    /// already deleted the volume.
    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let request = request.into_inner();
        instrument_rpc("Controller", "DeleteVolume", &request, async {
            Ok(DeleteVolumeResponse {})
        })
        .await
    }

    async fn controller_get_capabilities(
        &self,
        request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        let request = request.into_inner();
        instrument_rpc("Controller", "ControllerGetCapabilities", &request, async {
            Ok(ControllerGetCapabilitiesResponse {
                capabilities: vec![ControllerServiceCapability {
                    r#type: Some(Type::Rpc(Rpc {
                        r#type: RpcType::CreateDeleteVolume as i32,
                    })),
                }],
            })
        })
        .await
    }

    // The orchestrator never calls the remaining controller RPCs for this
    // kind of plugin.

    async fn controller_publish_volume(
        &self,
        _request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        Err(Status::unimplemented("not supported"))
    }

    async fn controller_unpublish_volume(
        &self,
        _request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        Err(Status::unimplemented("not supported"))
    }

    async fn validate_volume_capabilities(
        &self,
        _request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        Err(Status::unimplemented("not supported"))
    }

    async fn list_volumes(
        &self,
        _request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        Err(Status::unimplemented("not supported"))
    }

    async fn get_capacity(
        &self,
        _request: Request<GetCapacityRequest>,
    ) -> Result<Response<GetCapacityResponse>, Status> {
        Err(Status::unimplemented("not supported"))
    }

    async fn create_snapshot(
        &self,
        _request: Request<CreateSnapshotRequest>,
    ) -> Result<Response<CreateSnapshotResponse>, Status> {
        Err(Status::unimplemented("not supported"))
    }

    async fn delete_snapshot(
        &self,
        _request: Request<DeleteSnapshotRequest>,
    ) -> Result<Response<DeleteSnapshotResponse>, Status> {
        Err(Status::unimplemented("not supported"))
    }

    async fn list_snapshots(
        &self,
        _request: Request<ListSnapshotsRequest>,
    ) -> Result<Response<ListSnapshotsResponse>, Status> {
        Err(Status::unimplemented("not supported"))
    }

    async fn controller_expand_volume(
        &self,
        _request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("not supported"))
    }

    async fn controller_get_volume(
        &self,
        _request: Request<ControllerGetVolumeRequest>,
    ) -> Result<Response<ControllerGetVolumeResponse>, Status> {
        Err(Status::unimplemented("not supported"))
    }
}
