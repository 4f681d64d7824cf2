//! The engine driving the per-claim provisioning state machine.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Context as _;
use futures::StreamExt;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use kube_runtime::watcher;
use kube_runtime::watcher::Event;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::{domain_key, HANDLER_RETRY_DELAY};
use crate::kubernetes::modify_atomically;
use crate::provisioner::{
    Provisioner, VolumeCreationConfig, VolumeDeletionConfig, VolumeValidationConfig,
};
use crate::state::ProvisioningState;

/// Everything a provisioning handler needs to act on one claim. Rebuilt from
/// the live objects before every handler run.
pub(crate) struct ProvisioningContext {
    pub client: Client,
    pub provisioner: Provisioner,
    pub pvc: PersistentVolumeClaim,
    pub sc: StorageClass,
    claim_uid: String,
}

impl ProvisioningContext {
    pub async fn from_claim(
        client: &Client,
        name: &str,
        namespace: &str,
    ) -> anyhow::Result<Self> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
        let pvc = api.get(name).await?;

        // The storage class may already have been deleted, so use the
        // snapshot frozen into the claim's annotations.
        let sc_json = pvc
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(&domain_key("storage-class")))
            .context("claim carries no storage class snapshot")?;
        let sc: StorageClass = serde_json::from_str(sc_json)?;

        let provisioner = Provisioner::get(client, &sc.provisioner).await?;
        let claim_uid = pvc.uid().context("claim has no uid")?;

        Ok(ProvisioningContext {
            client: client.clone(),
            provisioner,
            pvc,
            sc,
            claim_uid,
        })
    }

    pub fn claim_uid(&self) -> &str {
        &self.claim_uid
    }

    pub async fn eval_validation_config(&self) -> anyhow::Result<VolumeValidationConfig> {
        self.provisioner
            .eval_validation_config(&self.sc, &self.pvc)
            .await
    }

    pub async fn eval_creation_config(&self) -> anyhow::Result<VolumeCreationConfig> {
        self.provisioner
            .eval_creation_config(&self.sc, &self.pvc)
            .await
    }

    pub async fn eval_deletion_config(&self) -> anyhow::Result<VolumeDeletionConfig> {
        self.provisioner
            .eval_deletion_config(&self.sc, &self.pvc)
            .await
    }

    /// Advance the claim's provisioning state. The `handler-node` label is
    /// set to `handler_node` or removed when `None`.
    pub async fn set_state(
        &self,
        state: ProvisioningState,
        handler_node: Option<&str>,
    ) -> anyhow::Result<()> {
        let namespace = self.pvc.namespace().context("claim has no namespace")?;
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);
        modify_atomically(&api, &self.pvc.name(), |pvc| {
            apply_provisioning_state(pvc, &state, handler_node);
            Ok(())
        })
        .await?;
        Ok(())
    }
}

/// Write `state` into the claim, applying the late overrides that make the
/// state machine safe against concurrent user deletion: a `Created` write
/// under a pending deletion request becomes `LaunchDeletionPod`, a
/// `CreationFailed` write becomes `Deleted`, and writes terminal for the
/// creation path drop the `delete-volume` finalizer.
pub(crate) fn apply_provisioning_state(
    pvc: &mut PersistentVolumeClaim,
    state: &ProvisioningState,
    handler_node: Option<&str>,
) {
    let deletion_requested = pvc
        .metadata
        .annotations
        .as_ref()
        .map_or(false, |annotations| {
            annotations.contains_key(&domain_key("deletion-requested"))
        });

    let mut new_state = state.clone();
    let mut drop_finalizer = false;

    match state {
        ProvisioningState::Created { .. } if deletion_requested => {
            new_state = ProvisioningState::LaunchDeletionPod;
        }
        ProvisioningState::CreationFailed { .. } => {
            drop_finalizer = true;
            if deletion_requested {
                new_state = ProvisioningState::Deleted;
            }
        }
        ProvisioningState::Deleted => {
            drop_finalizer = true;
        }
        _ => {}
    }

    if drop_finalizer {
        if let Some(finalizers) = pvc.metadata.finalizers.as_mut() {
            finalizers.retain(|finalizer| finalizer != &domain_key("delete-volume"));
        }
    }

    pvc.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(domain_key("state"), new_state.to_json());

    let labels = pvc.metadata.labels.get_or_insert_with(Default::default);
    match handler_node {
        Some(node) => {
            labels.insert(domain_key("handler-node"), node.to_owned());
        }
        None => {
            labels.remove(&domain_key("handler-node"));
        }
    }
}

/// One agent's side of the provisioning state machine.
#[async_trait::async_trait]
pub(crate) trait ProvisioningHandler: Send + Sync + 'static {
    /// Invoked with every observed claim version, before state dispatch.
    async fn observe_claim(&self, _pvc: &PersistentVolumeClaim) -> anyhow::Result<()> {
        Ok(())
    }

    /// Whether this agent drives the given state.
    fn handles(&self, state: &ProvisioningState) -> bool;

    async fn handle(
        &self,
        context: &ProvisioningContext,
        state: &ProvisioningState,
    ) -> anyhow::Result<()>;
}

/// Watch all claims labeled for this provisioner system (restricted to one
/// node's claims when `handler_node` is given) and run one managing task per
/// claim uid.
pub(crate) async fn run_provisioning_engine<H: ProvisioningHandler>(
    client: Client,
    handler: Arc<H>,
    handler_node: Option<String>,
) -> anyhow::Result<()> {
    let mut selector = domain_key("provisioner");
    if let Some(node) = &handler_node {
        selector = format!("{},{}={}", selector, domain_key("handler-node"), node);
    }
    let params = ListParams::default().labels(&selector);
    let api: Api<PersistentVolumeClaim> = Api::all(client.clone());

    let mut tasks: HashMap<String, watch::Sender<PersistentVolumeClaim>> = HashMap::new();
    let mut stream = watcher(api, params).boxed();

    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Applied(pvc)) => {
                dispatch_claim(&client, &handler, &mut tasks, pvc);
            }
            Ok(Event::Deleted(pvc)) => {
                if let Some(uid) = pvc.uid() {
                    tasks.remove(&uid);
                }
            }
            Ok(Event::Restarted(pvcs)) => {
                let current: HashSet<String> = pvcs.iter().filter_map(ResourceExt::uid).collect();
                tasks.retain(|uid, _| current.contains(uid));
                for pvc in pvcs {
                    dispatch_claim(&client, &handler, &mut tasks, pvc);
                }
            }
            Err(error) => {
                warn!(?error, "error streaming claim events");
            }
        }
    }

    anyhow::bail!("claim watch ended unexpectedly")
}

fn dispatch_claim<H: ProvisioningHandler>(
    client: &Client,
    handler: &Arc<H>,
    tasks: &mut HashMap<String, watch::Sender<PersistentVolumeClaim>>,
    pvc: PersistentVolumeClaim,
) {
    let uid = match pvc.uid() {
        Some(uid) => uid,
        None => return,
    };

    if let Some(sender) = tasks.get(&uid) {
        if sender.send(pvc.clone()).is_ok() {
            return;
        }
        // the managing task is gone; replace it
        tasks.remove(&uid);
    }

    debug!(claim_uid = %uid, "starting managing task for claim");
    let (sender, receiver) = watch::channel(pvc);
    tasks.insert(uid.clone(), sender);
    tokio::spawn(manage_claim(client.clone(), Arc::clone(handler), receiver, uid));
}

async fn manage_claim<H: ProvisioningHandler>(
    client: Client,
    handler: Arc<H>,
    mut receiver: watch::Receiver<PersistentVolumeClaim>,
    claim_uid: String,
) {
    let mut previous: Option<ProvisioningState> = None;

    loop {
        let pvc = receiver.borrow().clone();

        match manage_claim_step(&client, handler.as_ref(), &pvc, &mut previous).await {
            Ok(true) => continue,
            Ok(false) => {
                // fixed point; wait for the object to change
                if receiver.changed().await.is_err() {
                    break;
                }
            }
            Err(error) => {
                warn!(claim_uid = %claim_uid, error = ?error, "error while managing claim");
                tokio::time::sleep(HANDLER_RETRY_DELAY).await;
            }
        }
    }

    debug!(claim_uid = %claim_uid, "managing task for claim finished");
}

/// One reconcile step. Returns whether a handler made progress.
async fn manage_claim_step<H: ProvisioningHandler>(
    client: &Client,
    handler: &H,
    pvc: &PersistentVolumeClaim,
    previous: &mut Option<ProvisioningState>,
) -> anyhow::Result<bool> {
    handler.observe_claim(pvc).await?;

    let state_json = match pvc
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(&domain_key("state")))
    {
        Some(json) => json,
        None => return Ok(false),
    };
    let state = ProvisioningState::from_json(state_json)?;

    if previous.as_ref() == Some(&state) || !handler.handles(&state) {
        return Ok(false);
    }

    debug!(state = ?state, claim = %pvc.name(), "running provisioning handler");
    let namespace = pvc.namespace().context("claim has no namespace")?;
    let context = ProvisioningContext::from_claim(client, &pvc.name(), &namespace).await?;
    handler.handle(&context, &state).await?;

    *previous = Some(state);
    Ok(true)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn claim_with(
        state: Option<&ProvisioningState>,
        deletion_requested: bool,
    ) -> PersistentVolumeClaim {
        let mut annotations = serde_json::Map::new();
        if let Some(state) = state {
            annotations.insert(domain_key("state"), json!(state.to_json()));
        }
        if deletion_requested {
            annotations.insert(domain_key("deletion-requested"), json!(""));
        }
        serde_json::from_value(json!({
            "metadata": {
                "name": "claim",
                "namespace": "default",
                "uid": "11111111-2222-3333-4444-555555555555",
                "annotations": annotations,
                "finalizers": [domain_key("delete-volume")],
            },
            "spec": {},
        }))
        .unwrap()
    }

    fn decoded_state(pvc: &PersistentVolumeClaim) -> ProvisioningState {
        let json = pvc.metadata.annotations.as_ref().unwrap()[&domain_key("state")].clone();
        ProvisioningState::from_json(&json).unwrap()
    }

    fn has_finalizer(pvc: &PersistentVolumeClaim) -> bool {
        pvc.metadata
            .finalizers
            .as_ref()
            .map_or(false, |f| f.contains(&domain_key("delete-volume")))
    }

    #[test]
    fn created_is_redirected_under_deletion_request() {
        let mut pvc = claim_with(None, true);
        apply_provisioning_state(
            &mut pvc,
            &ProvisioningState::Created {
                handle: "h".into(),
                capacity: 1,
            },
            None,
        );
        assert_eq!(decoded_state(&pvc), ProvisioningState::LaunchDeletionPod);
        assert!(has_finalizer(&pvc));
    }

    #[test]
    fn creation_failed_drops_the_finalizer() {
        let mut pvc = claim_with(None, false);
        apply_provisioning_state(
            &mut pvc,
            &ProvisioningState::CreationFailed {
                error_code: tonic::Code::InvalidArgument,
                error_details: "boom".into(),
            },
            None,
        );
        assert!(matches!(
            decoded_state(&pvc),
            ProvisioningState::CreationFailed { .. }
        ));
        assert!(!has_finalizer(&pvc));
    }

    #[test]
    fn creation_failed_becomes_deleted_under_deletion_request() {
        let mut pvc = claim_with(None, true);
        apply_provisioning_state(
            &mut pvc,
            &ProvisioningState::CreationFailed {
                error_code: tonic::Code::InvalidArgument,
                error_details: "boom".into(),
            },
            None,
        );
        assert_eq!(decoded_state(&pvc), ProvisioningState::Deleted);
        assert!(!has_finalizer(&pvc));
    }

    #[test]
    fn deleted_drops_the_finalizer() {
        let mut pvc = claim_with(None, false);
        apply_provisioning_state(&mut pvc, &ProvisioningState::Deleted, None);
        assert!(!has_finalizer(&pvc));
    }

    #[test]
    fn unrecoverable_failure_keeps_the_finalizer() {
        let mut pvc = claim_with(None, false);
        apply_provisioning_state(
            &mut pvc,
            &ProvisioningState::UnrecoverableFailure {
                error_code: tonic::Code::InvalidArgument,
                error_details: "boom".into(),
            },
            None,
        );
        assert!(has_finalizer(&pvc));
    }

    #[test]
    fn handler_node_label_tracks_the_argument() {
        let mut pvc = claim_with(None, false);
        apply_provisioning_state(
            &mut pvc,
            &ProvisioningState::AwaitValidationPod {
                validation_pod_namespace: "default".into(),
            },
            Some("node-a"),
        );
        assert_eq!(
            pvc.metadata.labels.as_ref().unwrap()[&domain_key("handler-node")],
            "node-a"
        );

        apply_provisioning_state(&mut pvc, &ProvisioningState::LaunchCreationPod, None);
        assert!(!pvc
            .metadata
            .labels
            .as_ref()
            .unwrap()
            .contains_key(&domain_key("handler-node")));
    }
}
