//! Helper pods: templates the operator provides, and handles over the pods
//! instantiated from them.
//!
//! Every helper pod gets a side-channel directory on its node, bind-mounted
//! at `/pav` inside all of its containers. The helper writes its results
//! (`error`, `handle`, `capacity`, `ready`, `volume`) into that directory and
//! the node agent reads them back out.

mod handle;
pub mod host;

pub use handle::PodHandle;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, PostParams};
use kube::Client;
use serde_json::{json, Value as JsonValue};

use crate::config::SIDE_CHANNEL_BASE_DIR;

/// An operator-provided helper pod template, validated against the API
/// server. Not the same as Kubernetes' own PodTemplate resource.
#[derive(Clone)]
pub struct PodTemplate {
    client: Client,
    template: JsonValue,
    namespace: String,
}

impl PodTemplate {
    /// Create a template from a value describing a pod's `metadata` and
    /// `spec`.
    ///
    /// The value is checked by asking the API server to dry-run instantiate a
    /// pod built from it; a rejection surfaces as a user-visible validation
    /// error. The given value is never mutated.
    pub async fn new(client: Client, template: &JsonValue) -> anyhow::Result<Self> {
        let fields = template
            .as_object()
            .ok_or_else(|| anyhow::anyhow!("pod template must be a mapping"))?;
        for key in fields.keys() {
            anyhow::ensure!(
                key == "metadata" || key == "spec",
                "pod template may only specify fields 'metadata' and 'spec'"
            );
        }

        let namespace = template_namespace(template);
        let definition = build_dry_run_definition(template);
        let pod: Pod = serde_json::from_value(definition)
            .map_err(|error| anyhow::anyhow!("invalid pod template: {}", error))?;

        let api: Api<Pod> = Api::namespaced(client.clone(), &namespace);
        let params = PostParams {
            dry_run: true,
            ..Default::default()
        };
        match api.create(&params, &pod).await {
            Ok(_) => {}
            Err(kube::Error::Api(response)) if response.code == 400 || response.code == 422 => {
                anyhow::bail!("invalid pod template: {}", response.message);
            }
            Err(error) => return Err(error.into()),
        }

        Ok(PodTemplate {
            client,
            template: template.clone(),
            namespace,
        })
    }

    /// Namespace that pods instantiated from this template will belong to.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Create a pod from this template, or do nothing if a pod with the same
    /// name already exists in the template's namespace.
    ///
    /// `side_channel_name` defaults to the pod name.
    pub async fn create(
        &self,
        pod_name: &str,
        node_name: Option<&str>,
        side_channel_name: Option<&str>,
        bidirectional_mount_propagation: bool,
    ) -> anyhow::Result<PodHandle> {
        let side_channel_name = side_channel_name.unwrap_or(pod_name);
        let definition = instantiate_pod_definition(
            &self.template,
            pod_name,
            node_name,
            side_channel_name,
            bidirectional_mount_propagation,
        );
        let pod: Pod = serde_json::from_value(definition)
            .map_err(|error| anyhow::anyhow!("invalid pod template: {}", error))?;

        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        match api.create(&PostParams::default(), &pod).await {
            Ok(_) => {}
            Err(kube::Error::Api(response)) if response.code == 409 => {
                // pod with the same name and namespace already exists
            }
            Err(error) => return Err(error.into()),
        }

        Ok(PodHandle::new(
            self.client.clone(),
            pod_name,
            &self.namespace,
            side_channel_name,
        ))
    }
}

fn template_namespace(template: &JsonValue) -> String {
    template
        .get("metadata")
        .and_then(|metadata| metadata.get("namespace"))
        .and_then(JsonValue::as_str)
        .unwrap_or("default")
        .to_owned()
}

/// A pod definition for validating the template: a throwaway generated name
/// and an emptyDir in place of the side-channel volume.
fn build_dry_run_definition(template: &JsonValue) -> JsonValue {
    let mut pod = template.clone();
    let root = ensure_object(&mut pod);
    root.insert("apiVersion".to_owned(), json!("v1"));
    root.insert("kind".to_owned(), json!("Pod"));

    let metadata = ensure_object(root.entry("metadata").or_insert_with(|| json!({})));
    metadata.remove("name");
    metadata.insert("generateName".to_owned(), json!("pod-"));

    let spec = ensure_object(root.entry("spec").or_insert_with(|| json!({})));
    prepend_side_channel_volume(spec, json!({"name": "pav", "emptyDir": {}}));
    prepend_side_channel_mounts(spec, false);

    pod
}

/// Instantiate a concrete pod definition from a template.
fn instantiate_pod_definition(
    template: &JsonValue,
    pod_name: &str,
    node_name: Option<&str>,
    side_channel_name: &str,
    bidirectional_mount_propagation: bool,
) -> JsonValue {
    let mut pod = template.clone();
    let root = ensure_object(&mut pod);
    root.insert("apiVersion".to_owned(), json!("v1"));
    root.insert("kind".to_owned(), json!("Pod"));

    let metadata = ensure_object(root.entry("metadata").or_insert_with(|| json!({})));
    metadata.insert("name".to_owned(), json!(pod_name));
    metadata.remove("generateName");

    let spec = ensure_object(root.entry("spec").or_insert_with(|| json!({})));
    if let Some(node_name) = node_name {
        spec.insert("nodeName".to_owned(), json!(node_name));
    }

    let volume = json!({
        "name": "pav",
        "hostPath": {
            "path": format!("{}/{}", SIDE_CHANNEL_BASE_DIR, side_channel_name),
            "type": "DirectoryOrCreate",
        },
    });
    prepend_side_channel_volume(spec, volume);
    prepend_side_channel_mounts(spec, bidirectional_mount_propagation);

    pod
}

fn ensure_object(value: &mut JsonValue) -> &mut serde_json::Map<String, JsonValue> {
    if !value.is_object() {
        *value = json!({});
    }
    value.as_object_mut().unwrap()
}

fn prepend_side_channel_volume(
    spec: &mut serde_json::Map<String, JsonValue>,
    volume: JsonValue,
) {
    let volumes = spec.entry("volumes").or_insert_with(|| json!([]));
    if !volumes.is_array() {
        *volumes = json!([]);
    }
    volumes.as_array_mut().unwrap().insert(0, volume);
}

/// Prepend the `pav -> /pav` mount into every init and main container.
/// Bidirectional mount propagation is only attached to privileged containers.
fn prepend_side_channel_mounts(
    spec: &mut serde_json::Map<String, JsonValue>,
    bidirectional_mount_propagation: bool,
) {
    for section in ["initContainers", "containers"] {
        let containers = match spec.get_mut(section).and_then(JsonValue::as_array_mut) {
            Some(containers) => containers,
            None => continue,
        };
        for container in containers {
            let privileged = container
                .get("securityContext")
                .and_then(|context| context.get("privileged"))
                .and_then(JsonValue::as_bool)
                .unwrap_or(false);

            let mut mount = json!({"name": "pav", "mountPath": "/pav"});
            if bidirectional_mount_propagation && privileged {
                mount
                    .as_object_mut()
                    .unwrap()
                    .insert("mountPropagation".to_owned(), json!("Bidirectional"));
            }

            let container = ensure_object(container);
            let mounts = container.entry("volumeMounts").or_insert_with(|| json!([]));
            if !mounts.is_array() {
                *mounts = json!([]);
            }
            mounts.as_array_mut().unwrap().insert(0, mount);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn template() -> JsonValue {
        json!({
            "metadata": {"namespace": "storage"},
            "spec": {
                "initContainers": [{"name": "prepare", "image": "busybox"}],
                "containers": [
                    {"name": "work", "image": "busybox"},
                    {
                        "name": "privileged-work",
                        "image": "busybox",
                        "securityContext": {"privileged": true},
                        "volumeMounts": [{"name": "data", "mountPath": "/data"}],
                    },
                ],
                "volumes": [{"name": "data", "emptyDir": {}}],
            },
        })
    }

    #[test]
    fn instantiation_pins_identity_and_node() {
        let pod = instantiate_pod_definition(&template(), "helper-1", Some("node-a"), "helper-1", false);
        assert_eq!(pod["apiVersion"], "v1");
        assert_eq!(pod["kind"], "Pod");
        assert_eq!(pod["metadata"]["name"], "helper-1");
        assert_eq!(pod["spec"]["nodeName"], "node-a");
    }

    #[test]
    fn side_channel_volume_is_prepended() {
        let pod = instantiate_pod_definition(&template(), "helper-1", None, "side-1", false);
        let volumes = pod["spec"]["volumes"].as_array().unwrap();
        assert_eq!(volumes[0]["name"], "pav");
        assert_eq!(
            volumes[0]["hostPath"]["path"],
            "/var/lib/kubernetes-pav/side-1"
        );
        assert_eq!(volumes[0]["hostPath"]["type"], "DirectoryOrCreate");
        assert_eq!(volumes[1]["name"], "data");
    }

    #[test]
    fn every_container_gets_the_side_channel_mount() {
        let pod = instantiate_pod_definition(&template(), "helper-1", None, "helper-1", false);
        for container in [
            &pod["spec"]["initContainers"][0],
            &pod["spec"]["containers"][0],
            &pod["spec"]["containers"][1],
        ] {
            let mounts = container["volumeMounts"].as_array().unwrap();
            assert_eq!(mounts[0]["name"], "pav");
            assert_eq!(mounts[0]["mountPath"], "/pav");
        }
        // existing mounts are preserved after the prepended one
        assert_eq!(
            pod["spec"]["containers"][1]["volumeMounts"][1]["name"],
            "data"
        );
    }

    #[test]
    fn bidirectional_propagation_requires_privilege() {
        let pod = instantiate_pod_definition(&template(), "helper-1", None, "helper-1", true);
        let unprivileged = &pod["spec"]["containers"][0]["volumeMounts"][0];
        assert!(unprivileged.get("mountPropagation").is_none());
        let privileged = &pod["spec"]["containers"][1]["volumeMounts"][0];
        assert_eq!(privileged["mountPropagation"], "Bidirectional");
    }

    #[test]
    fn dry_run_definition_uses_a_generated_name() {
        let mut with_name = template();
        with_name["metadata"]["name"] = json!("fixed");
        let pod = build_dry_run_definition(&with_name);
        assert!(pod["metadata"].get("name").is_none());
        assert_eq!(pod["metadata"]["generateName"], "pod-");
        assert_eq!(pod["spec"]["volumes"][0]["name"], "pav");
        assert!(pod["spec"]["volumes"][0].get("emptyDir").is_some());
    }

    #[test]
    fn template_namespace_defaults() {
        assert_eq!(template_namespace(&template()), "storage");
        assert_eq!(template_namespace(&json!({"spec": {}})), "default");
    }
}
