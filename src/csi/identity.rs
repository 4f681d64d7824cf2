//! The CSI identity service.

use k8s_csi::v1_3_0::identity_server::Identity;
use k8s_csi::v1_3_0::plugin_capability::service::Type as ServiceType;
use k8s_csi::v1_3_0::plugin_capability::{Service, Type};
use k8s_csi::v1_3_0::{
    GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse, GetPluginInfoRequest,
    GetPluginInfoResponse, PluginCapability, ProbeRequest, ProbeResponse,
};
use tonic::{Request, Response, Status};

use crate::config::VENDOR_VERSION;
use crate::csi::common::instrument_rpc;
use crate::kubernetes::ClusterObjectRef;

pub struct IdentityService {
    provisioner: ClusterObjectRef,
}

impl IdentityService {
    pub fn new(provisioner: ClusterObjectRef) -> Self {
        IdentityService { provisioner }
    }
}

#[async_trait::async_trait]
impl Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        let request = request.into_inner();
        instrument_rpc("Identity", "GetPluginInfo", &request, async {
            Ok(GetPluginInfoResponse {
                name: self.provisioner.name.clone(),
                vendor_version: VENDOR_VERSION.to_owned(),
                ..Default::default()
            })
        })
        .await
    }

    async fn get_plugin_capabilities(
        &self,
        request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        let request = request.into_inner();
        instrument_rpc("Identity", "GetPluginCapabilities", &request, async {
            Ok(GetPluginCapabilitiesResponse {
                capabilities: vec![PluginCapability {
                    r#type: Some(Type::Service(Service {
                        r#type: ServiceType::ControllerService as i32,
                    })),
                }],
            })
        })
        .await
    }

    async fn probe(
        &self,
        request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        let request = request.into_inner();
        instrument_rpc("Identity", "Probe", &request, async {
            Ok(ProbeResponse { ready: Some(true) })
        })
        .await
    }
}
