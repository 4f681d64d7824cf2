//! The engine driving the per-mount staging state machine. Staging runs
//! entirely on node agents: each (client pod, claim) pair found on this node
//! gets its own managing task.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Pod};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use kube_runtime::watcher;
use kube_runtime::watcher::Event;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::{domain_key, HANDLER_RETRY_DELAY, DOMAIN};
use crate::kubernetes::modify_atomically;
use crate::provisioner::{Provisioner, VolumeStagingConfig, VolumeUnstagingConfig};
use crate::state::StagingState;

lazy_static! {
    static ref CLAIM_UID_PATTERN: Regex = Regex::new(&format!(
        r"^{}/(\w{{8}}-\w{{4}}-\w{{4}}-\w{{4}}-\w{{12}})-",
        regex::escape(DOMAIN)
    ))
    .unwrap();
}

/// The claim uids that a client pod carries per-mount annotations for.
pub(crate) fn claim_uids_in_annotations(pod: &Pod) -> HashSet<String> {
    pod.metadata
        .annotations
        .as_ref()
        .map(|annotations| {
            annotations
                .keys()
                .filter_map(|key| CLAIM_UID_PATTERN.captures(key))
                .map(|captures| captures[1].to_owned())
                .collect()
        })
        .unwrap_or_default()
}

/// Everything a staging handler needs to act on one mount. Rebuilt from the
/// live objects before every handler run.
pub(crate) struct StagingContext {
    pub client: Client,
    pub provisioner: Provisioner,
    pub pvc: PersistentVolumeClaim,
    pub pv: PersistentVolume,
    pub node: Node,
    pub client_pod: Pod,
    pub target_path_in_host: PathBuf,
    pub read_only: bool,
    claim_uid: String,
    pod_uid: String,
}

impl StagingContext {
    pub async fn from_client_pod(
        client: &Client,
        client_pod: &Pod,
        claim_uid: &str,
        node_name: &str,
    ) -> anyhow::Result<Self> {
        let annotations = client_pod
            .metadata
            .annotations
            .as_ref()
            .context("client pod has no annotations")?;
        let annotation = |suffix: &str| -> anyhow::Result<&String> {
            let key = domain_key(&format!("{}-{}", claim_uid, suffix));
            annotations
                .get(&key)
                .with_context(|| format!("client pod has no {} annotation", key))
        };

        let pvc_name = annotation("pvc-name")?;
        let pvc_namespace = annotation("pvc-namespace")?;
        let pvc_api: Api<PersistentVolumeClaim> =
            Api::namespaced(client.clone(), pvc_namespace);
        let pvc = pvc_api.get(pvc_name).await?;

        let volume_name = pvc
            .spec
            .as_ref()
            .and_then(|spec| spec.volume_name.as_deref())
            .context("claim is not bound to a volume")?;
        let pv_api: Api<PersistentVolume> = Api::all(client.clone());
        let pv = pv_api.get(volume_name).await?;

        let driver = pv
            .spec
            .as_ref()
            .and_then(|spec| spec.csi.as_ref())
            .map(|csi| csi.driver.clone())
            .context("volume has no CSI source")?;
        let provisioner = Provisioner::get(client, &driver).await?;

        let node_api: Api<Node> = Api::all(client.clone());
        let node = node_api.get(node_name).await?;

        let target_path_in_host = PathBuf::from(annotation("target-path-in-host")?);
        let read_only = match annotation("read-only")?.as_str() {
            "true" => true,
            "false" => false,
            other => anyhow::bail!("invalid read-only annotation value {:?}", other),
        };

        let pod_uid = client_pod.uid().context("client pod has no uid")?;

        Ok(StagingContext {
            client: client.clone(),
            provisioner,
            pvc,
            pv,
            node,
            client_pod: client_pod.clone(),
            target_path_in_host,
            read_only,
            claim_uid: claim_uid.to_owned(),
            pod_uid,
        })
    }

    pub fn claim_uid(&self) -> &str {
        &self.claim_uid
    }

    pub fn pod_uid(&self) -> &str {
        &self.pod_uid
    }

    pub async fn eval_staging_config(&self) -> anyhow::Result<VolumeStagingConfig> {
        self.provisioner
            .eval_staging_config(&self.pvc, &self.pv, &self.node, self.read_only)
            .await
    }

    pub async fn eval_unstaging_config(&self) -> anyhow::Result<VolumeUnstagingConfig> {
        self.provisioner
            .eval_unstaging_config(&self.pvc, &self.pv, &self.node, self.read_only)
            .await
    }

    /// Advance this mount's staging state on the client pod.
    pub async fn set_state(&self, state: StagingState) -> anyhow::Result<()> {
        let namespace = self
            .client_pod
            .namespace()
            .context("client pod has no namespace")?;
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let claim_uid = self.claim_uid.clone();
        modify_atomically(&api, &self.client_pod.name(), |pod| {
            apply_staging_state(pod, &claim_uid, &state);
            Ok(())
        })
        .await?;
        Ok(())
    }
}

/// Write `state` into the client pod's per-mount annotation group, applying
/// the late overrides for concurrent unstage requests: a `Staged` write under
/// a pending unstage request becomes `RemoveStagingPod`, a `StagingFailed`
/// write becomes `Unstaged`, and writes terminal for the staging path drop
/// the per-mount finalizer.
pub(crate) fn apply_staging_state(pod: &mut Pod, claim_uid: &str, state: &StagingState) {
    let key = |suffix: &str| domain_key(&format!("{}-{}", claim_uid, suffix));

    let unstaging_requested = pod.metadata.annotations.as_ref().map_or(false, |a| {
        a.contains_key(&key("unstaging-requested"))
    });

    let mut new_state = state.clone();
    let mut drop_finalizer = false;

    match state {
        StagingState::Staged {
            staging_pod_namespace,
        } if unstaging_requested => {
            new_state = StagingState::RemoveStagingPod {
                staging_pod_namespace: staging_pod_namespace.clone(),
            };
        }
        StagingState::StagingFailed { .. } => {
            drop_finalizer = true;
            if unstaging_requested {
                new_state = StagingState::Unstaged;
            }
        }
        StagingState::Unstaged => {
            drop_finalizer = true;
        }
        _ => {}
    }

    if drop_finalizer {
        if let Some(finalizers) = pod.metadata.finalizers.as_mut() {
            finalizers.retain(|finalizer| finalizer != &key("unstage-volume"));
        }
    }

    pod.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(key("state"), new_state.to_json());
}

/// One agent's side of the staging state machine.
#[async_trait::async_trait]
pub(crate) trait StagingHandler: Send + Sync + 'static {
    /// Whether this agent drives the given state.
    fn handles(&self, state: &StagingState) -> bool;

    async fn handle(&self, context: &StagingContext, state: &StagingState)
        -> anyhow::Result<()>;
}

/// Watch the client pods scheduled to this node that mount provisioned
/// volumes and run one managing task per (pod uid, claim uid) pair.
pub(crate) async fn run_staging_engine<H: StagingHandler>(
    client: Client,
    handler: Arc<H>,
    node_name: String,
) -> anyhow::Result<()> {
    let params = ListParams::default()
        .labels(&domain_key("uses-volumes"))
        .fields(&format!("spec.nodeName={}", node_name));
    let api: Api<Pod> = Api::all(client.clone());

    let mut tasks: HashMap<(String, String), watch::Sender<Pod>> = HashMap::new();
    let mut stream = watcher(api, params).boxed();

    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Applied(pod)) => {
                dispatch_pod(&client, &handler, &node_name, &mut tasks, pod);
            }
            Ok(Event::Deleted(pod)) => {
                if let Some(pod_uid) = pod.uid() {
                    tasks.retain(|(uid, _), _| uid != &pod_uid);
                }
            }
            Ok(Event::Restarted(pods)) => {
                let mut current: HashSet<(String, String)> = HashSet::new();
                for pod in &pods {
                    if let Some(pod_uid) = pod.uid() {
                        for claim_uid in claim_uids_in_annotations(pod) {
                            current.insert((pod_uid.clone(), claim_uid));
                        }
                    }
                }
                tasks.retain(|key, _| current.contains(key));
                for pod in pods {
                    dispatch_pod(&client, &handler, &node_name, &mut tasks, pod);
                }
            }
            Err(error) => {
                warn!(?error, "error streaming client pod events");
            }
        }
    }

    anyhow::bail!("client pod watch ended unexpectedly")
}

fn dispatch_pod<H: StagingHandler>(
    client: &Client,
    handler: &Arc<H>,
    node_name: &str,
    tasks: &mut HashMap<(String, String), watch::Sender<Pod>>,
    pod: Pod,
) {
    let pod_uid = match pod.uid() {
        Some(uid) => uid,
        None => return,
    };

    for claim_uid in claim_uids_in_annotations(&pod) {
        let task_key = (pod_uid.clone(), claim_uid.clone());

        if let Some(sender) = tasks.get(&task_key) {
            if sender.send(pod.clone()).is_ok() {
                continue;
            }
            tasks.remove(&task_key);
        }

        debug!(pod_uid = %pod_uid, claim_uid = %claim_uid, "starting managing task for mount");
        let (sender, receiver) = watch::channel(pod.clone());
        tasks.insert(task_key, sender);
        tokio::spawn(manage_mount(
            client.clone(),
            Arc::clone(handler),
            receiver,
            claim_uid,
            node_name.to_owned(),
        ));
    }
}

async fn manage_mount<H: StagingHandler>(
    client: Client,
    handler: Arc<H>,
    mut receiver: watch::Receiver<Pod>,
    claim_uid: String,
    node_name: String,
) {
    let mut previous: Option<StagingState> = None;

    loop {
        let pod = receiver.borrow().clone();

        match manage_mount_step(&client, handler.as_ref(), &pod, &claim_uid, &node_name, &mut previous)
            .await
        {
            Ok(true) => continue,
            Ok(false) => {
                if receiver.changed().await.is_err() {
                    break;
                }
            }
            Err(error) => {
                warn!(
                    claim_uid = %claim_uid,
                    error = ?error,
                    "error while managing mount"
                );
                tokio::time::sleep(HANDLER_RETRY_DELAY).await;
            }
        }
    }

    debug!(claim_uid = %claim_uid, "managing task for mount finished");
}

/// One reconcile step. Returns whether a handler made progress.
async fn manage_mount_step<H: StagingHandler>(
    client: &Client,
    handler: &H,
    pod: &Pod,
    claim_uid: &str,
    node_name: &str,
    previous: &mut Option<StagingState>,
) -> anyhow::Result<bool> {
    let state_key = domain_key(&format!("{}-state", claim_uid));
    let state_json = match pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(&state_key))
    {
        Some(json) => json,
        None => return Ok(false),
    };
    let state = StagingState::from_json(state_json)?;

    if previous.as_ref() == Some(&state) || !handler.handles(&state) {
        return Ok(false);
    }

    debug!(state = ?state, pod = %pod.name(), claim_uid = %claim_uid, "running staging handler");
    let context = StagingContext::from_client_pod(client, pod, claim_uid, node_name).await?;
    handler.handle(&context, &state).await?;

    *previous = Some(state);
    Ok(true)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use tonic::Code;

    const CLAIM_UID: &str = "11111111-2222-3333-4444-555555555555";

    fn pod_with(annotations: serde_json::Value) -> Pod {
        serde_json::from_value(json!({
            "metadata": {
                "name": "client",
                "namespace": "default",
                "uid": "99999999-8888-7777-6666-555555555555",
                "annotations": annotations,
                "finalizers": [domain_key(&format!("{}-unstage-volume", CLAIM_UID))],
            },
        }))
        .unwrap()
    }

    fn decoded_state(pod: &Pod) -> StagingState {
        let key = domain_key(&format!("{}-state", CLAIM_UID));
        StagingState::from_json(&pod.metadata.annotations.as_ref().unwrap()[&key]).unwrap()
    }

    fn has_finalizer(pod: &Pod) -> bool {
        pod.metadata.finalizers.as_ref().map_or(false, |f| {
            f.contains(&domain_key(&format!("{}-unstage-volume", CLAIM_UID)))
        })
    }

    #[test]
    fn claim_uids_are_extracted_from_annotation_keys() {
        let pod = pod_with(json!({
            domain_key(&format!("{}-state", CLAIM_UID)): "{}",
            domain_key(&format!("{}-pvc-name", CLAIM_UID)): "claim",
            domain_key("unrelated"): "x",
            "some-other-domain.io/11111111-2222-3333-4444-555555555556-state": "{}",
        }));
        assert_eq!(
            claim_uids_in_annotations(&pod),
            HashSet::from([CLAIM_UID.to_owned()])
        );
    }

    #[test]
    fn staged_is_redirected_under_unstage_request() {
        let mut pod = pod_with(json!({
            domain_key(&format!("{}-unstaging-requested", CLAIM_UID)): "",
        }));
        apply_staging_state(
            &mut pod,
            CLAIM_UID,
            &StagingState::Staged {
                staging_pod_namespace: "storage".into(),
            },
        );
        assert_eq!(
            decoded_state(&pod),
            StagingState::RemoveStagingPod {
                staging_pod_namespace: "storage".into()
            }
        );
        assert!(has_finalizer(&pod));
    }

    #[test]
    fn staging_failed_drops_finalizer_and_honors_unstage_request() {
        let mut pod = pod_with(json!({
            domain_key(&format!("{}-unstaging-requested", CLAIM_UID)): "",
        }));
        apply_staging_state(
            &mut pod,
            CLAIM_UID,
            &StagingState::StagingFailed {
                error_code: Code::InvalidArgument,
                error_details: "boom".into(),
            },
        );
        assert_eq!(decoded_state(&pod), StagingState::Unstaged);
        assert!(!has_finalizer(&pod));
    }

    #[test]
    fn unstaged_drops_the_finalizer() {
        let mut pod = pod_with(json!({}));
        apply_staging_state(&mut pod, CLAIM_UID, &StagingState::Unstaged);
        assert_eq!(decoded_state(&pod), StagingState::Unstaged);
        assert!(!has_finalizer(&pod));
    }

    #[test]
    fn unrecoverable_failure_keeps_the_finalizer() {
        let mut pod = pod_with(json!({}));
        apply_staging_state(
            &mut pod,
            CLAIM_UID,
            &StagingState::UnrecoverableFailure {
                error_code: Code::InvalidArgument,
                error_details: "boom".into(),
            },
        );
        assert!(has_finalizer(&pod));
    }

    #[test]
    fn mount_groups_are_independent() {
        let other_uid = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";
        let mut pod = pod_with(json!({
            domain_key(&format!("{}-state", other_uid)): StagingState::LaunchStagingPod.to_json(),
        }));
        apply_staging_state(&mut pod, CLAIM_UID, &StagingState::LaunchStagingPod);

        let annotations = pod.metadata.annotations.as_ref().unwrap();
        assert!(annotations.contains_key(&domain_key(&format!("{}-state", CLAIM_UID))));
        assert_eq!(
            annotations[&domain_key(&format!("{}-state", other_uid))],
            StagingState::LaunchStagingPod.to_json()
        );
    }
}
