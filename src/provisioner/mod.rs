//! Access to Provisioner objects and evaluation of the helper-pod
//! configurations they define.
//!
//! A Provisioner's spec holds one templated section per volume lifecycle step
//! (`volumeValidation`, `volumeCreation`, `volumeDeletion`, `volumeStaging`,
//! `volumeUnstaging`). Evaluating a section renders its templates over a
//! context assembled from the objects involved and produces a typed config.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use anyhow::Context;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind};
use kube::{Client, ResourceExt};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

use crate::config::{PROVISIONER_GROUP, PROVISIONER_KIND, PROVISIONER_VERSION};
use crate::kubernetes::quantity::{parse_quantity, Rounding};
use crate::pod::PodTemplate;
use crate::template;

#[derive(Debug, Error)]
#[allow(clippy::enum_variant_names)]
enum VolumeError {
    #[error("bad volume mode")]
    BadVolumeMode,
    #[error("bad access mode")]
    BadAccessMode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum VolumeMode {
    Filesystem,
    Block,
}

impl FromStr for VolumeMode {
    type Err = anyhow::Error;

    // The "Filesystem" mode is implied when not included in the claim spec.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Filesystem" | "" => Ok(VolumeMode::Filesystem),
            "Block" => Ok(VolumeMode::Block),
            _ => Err(VolumeError::BadVolumeMode.into()),
        }
    }
}

impl fmt::Display for VolumeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeMode::Filesystem => write!(f, "Filesystem"),
            VolumeMode::Block => write!(f, "Block"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[allow(clippy::enum_variant_names)]
pub enum AccessMode {
    ReadWriteOnce,
    ReadOnlyMany,
    ReadWriteMany,
}

impl FromStr for AccessMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ReadWriteOnce" => Ok(AccessMode::ReadWriteOnce),
            "ReadOnlyMany" => Ok(AccessMode::ReadOnlyMany),
            "ReadWriteMany" => Ok(AccessMode::ReadWriteMany),
            _ => Err(VolumeError::BadAccessMode.into()),
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::ReadWriteOnce => write!(f, "ReadWriteOnce"),
            AccessMode::ReadOnlyMany => write!(f, "ReadOnlyMany"),
            AccessMode::ReadWriteMany => write!(f, "ReadWriteMany"),
        }
    }
}

/// The volume properties a claim asks for.
#[derive(Clone, Debug)]
pub struct RequestedVolumeProperties {
    pub volume_mode: VolumeMode,
    pub access_modes: BTreeSet<AccessMode>,
    pub min_capacity: i64,
    pub max_capacity: Option<i64>,
}

impl RequestedVolumeProperties {
    pub fn from_claim(pvc: &PersistentVolumeClaim) -> anyhow::Result<Self> {
        let spec = pvc.spec.as_ref().context("claim has no spec")?;

        let volume_mode = spec.volume_mode.as_deref().unwrap_or_default().parse()?;

        let access_modes = spec
            .access_modes
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|mode| mode.parse())
            .collect::<anyhow::Result<BTreeSet<AccessMode>>>()?;

        let resources = spec.resources.as_ref().context("claim has no resources")?;
        let min_capacity = resources
            .requests
            .as_ref()
            .and_then(|requests| requests.get("storage"))
            .context("claim requests no storage")?;
        let min_capacity = parse_quantity(&min_capacity.0, Rounding::HalfEven)?;
        let max_capacity = resources
            .limits
            .as_ref()
            .and_then(|limits| limits.get("storage"))
            .map(|limit| parse_quantity(&limit.0, Rounding::HalfEven))
            .transpose()?;

        Ok(RequestedVolumeProperties {
            volume_mode,
            access_modes,
            min_capacity,
            max_capacity,
        })
    }
}

pub struct VolumeValidationConfig {
    pub volume_modes: BTreeSet<VolumeMode>,
    pub access_modes: BTreeSet<AccessMode>,
    pub min_capacity: i64,
    pub max_capacity: Option<i64>,
    pub pod_template: Option<PodTemplate>,
}

pub struct VolumeCreationConfig {
    pub handle: Option<String>,
    pub capacity: Option<i64>,
    pub pod_template: Option<PodTemplate>,
}

pub struct VolumeDeletionConfig {
    pub pod_template: Option<PodTemplate>,
}

pub struct VolumeStagingConfig {
    pub pod_template: PodTemplate,
}

pub struct VolumeUnstagingConfig {
    pub pod_template: Option<PodTemplate>,
}

/// A Provisioner object fetched from the cluster.
#[derive(Clone)]
pub struct Provisioner {
    client: Client,
    name: String,
    uid: String,
    marked_for_deletion: bool,
    spec: JsonValue,
}

impl Provisioner {
    pub fn api_resource() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk(
            PROVISIONER_GROUP,
            PROVISIONER_VERSION,
            PROVISIONER_KIND,
        ))
    }

    pub async fn get(client: &Client, name: &str) -> anyhow::Result<Self> {
        let api: Api<DynamicObject> = Api::all_with(client.clone(), &Self::api_resource());
        let object = api.get(name).await?;
        Self::from_object(client.clone(), &object)
    }

    pub fn from_object(client: Client, object: &DynamicObject) -> anyhow::Result<Self> {
        let uid = object.uid().context("provisioner has no uid")?;
        let spec = object
            .data
            .get("spec")
            .cloned()
            .unwrap_or_else(|| json!({}));
        Ok(Provisioner {
            client,
            name: object.name(),
            uid,
            marked_for_deletion: object.metadata.deletion_timestamp.is_some(),
            spec,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.marked_for_deletion
    }

    /// Check the syntax of every template this provisioner defines.
    pub fn validate(&self) -> anyhow::Result<()> {
        let sections = self
            .spec
            .as_object()
            .context("provisioner spec must be a mapping")?;
        for (name, section) in sections {
            if name == "provisioningModes" {
                continue;
            }
            template::validate(section)
                .with_context(|| format!("in 'spec.{}'", name))?;
        }
        Ok(())
    }

    pub async fn eval_validation_config(
        &self,
        sc: &StorageClass,
        pvc: &PersistentVolumeClaim,
    ) -> anyhow::Result<VolumeValidationConfig> {
        let context = dynamic_validation_context(sc, pvc)?;
        let section = self.eval_spec_section("volumeValidation", &context)?;

        let volume_modes = string_set(&section, "volumeModes", &["Filesystem"])?
            .iter()
            .map(|mode| mode.parse())
            .collect::<anyhow::Result<BTreeSet<VolumeMode>>>()
            .context("in 'spec.volumeValidation.volumeModes'")?;

        let access_modes = string_set(
            &section,
            "accessModes",
            &["ReadWriteOnce", "ReadOnlyMany", "ReadWriteMany"],
        )?
        .iter()
        .map(|mode| mode.parse())
        .collect::<anyhow::Result<BTreeSet<AccessMode>>>()
        .context("in 'spec.volumeValidation.accessModes'")?;

        let min_capacity = match section.get("minCapacity") {
            Some(value) => positive_capacity(value, Rounding::Floor)
                .context("in 'spec.volumeValidation.minCapacity'")?,
            None => 1,
        };
        let max_capacity = section
            .get("maxCapacity")
            .map(|value| positive_capacity(value, Rounding::Ceiling))
            .transpose()
            .context("in 'spec.volumeValidation.maxCapacity'")?;

        if let Some(max_capacity) = max_capacity {
            anyhow::ensure!(
                min_capacity <= max_capacity,
                "'spec.volumeValidation.minCapacity' must not be greater than \
                 'spec.volumeValidation.maxCapacity'"
            );
        }

        let pod_template = self.pod_template_from(&section).await?;

        Ok(VolumeValidationConfig {
            volume_modes,
            access_modes,
            min_capacity,
            max_capacity,
            pod_template,
        })
    }

    pub async fn eval_creation_config(
        &self,
        sc: &StorageClass,
        pvc: &PersistentVolumeClaim,
    ) -> anyhow::Result<VolumeCreationConfig> {
        let context = creation_and_deletion_context(sc, pvc)?;
        let section = self.eval_spec_section("volumeCreation", &context)?;

        let handle = match section.get("handle") {
            Some(value) => Some(
                value
                    .as_str()
                    .context("'spec.volumeCreation.handle' must be a string")?
                    .to_owned(),
            ),
            None => None,
        };

        let capacity = section
            .get("capacity")
            .map(|value| positive_capacity(value, Rounding::Floor))
            .transpose()
            .context("in 'spec.volumeCreation.capacity'")?;

        if self.provisioning_modes().contains(&"Dynamic".to_owned())
            && capacity.is_none()
            && section.get("podTemplate").is_none()
        {
            anyhow::bail!(
                "at least one of 'spec.volumeCreation.capacity' or \
                 'spec.volumeCreation.podTemplate' must be specified when \
                 'spec.provisioningModes' contains 'Dynamic'"
            );
        }

        let pod_template = self.pod_template_from(&section).await?;

        Ok(VolumeCreationConfig {
            handle,
            capacity,
            pod_template,
        })
    }

    pub async fn eval_deletion_config(
        &self,
        sc: &StorageClass,
        pvc: &PersistentVolumeClaim,
    ) -> anyhow::Result<VolumeDeletionConfig> {
        let context = creation_and_deletion_context(sc, pvc)?;
        let section = self.eval_spec_section("volumeDeletion", &context)?;
        let pod_template = self.pod_template_from(&section).await?;
        Ok(VolumeDeletionConfig { pod_template })
    }

    pub async fn eval_staging_config(
        &self,
        pvc: &PersistentVolumeClaim,
        pv: &PersistentVolume,
        node: &Node,
        read_only: bool,
    ) -> anyhow::Result<VolumeStagingConfig> {
        let context = staging_and_unstaging_context(pvc, pv, node, read_only)?;
        let section = self.eval_spec_section("volumeStaging", &context)?;
        let pod_template = self
            .pod_template_from(&section)
            .await?
            .context("'spec.volumeStaging.podTemplate' must be specified")?;
        Ok(VolumeStagingConfig { pod_template })
    }

    pub async fn eval_unstaging_config(
        &self,
        pvc: &PersistentVolumeClaim,
        pv: &PersistentVolume,
        node: &Node,
        read_only: bool,
    ) -> anyhow::Result<VolumeUnstagingConfig> {
        let context = staging_and_unstaging_context(pvc, pv, node, read_only)?;
        let section = self.eval_spec_section("volumeUnstaging", &context)?;
        let pod_template = self.pod_template_from(&section).await?;
        Ok(VolumeUnstagingConfig { pod_template })
    }

    fn provisioning_modes(&self) -> Vec<String> {
        self.spec
            .get("provisioningModes")
            .and_then(JsonValue::as_array)
            .map(|modes| {
                modes
                    .iter()
                    .filter_map(JsonValue::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn eval_spec_section(&self, name: &str, context: &JsonValue) -> anyhow::Result<JsonValue> {
        let raw = self.spec.get(name).cloned().unwrap_or_else(|| json!({}));
        let evaluated = template::evaluate(&raw, context)
            .with_context(|| format!("while evaluating 'spec.{}'", name))?;
        anyhow::ensure!(
            evaluated.is_object(),
            "'spec.{}' must evaluate to a mapping",
            name
        );
        Ok(evaluated)
    }

    async fn pod_template_from(&self, section: &JsonValue) -> anyhow::Result<Option<PodTemplate>> {
        match section.get("podTemplate") {
            Some(template) => Ok(Some(PodTemplate::new(self.client.clone(), template).await?)),
            None => Ok(None),
        }
    }
}

fn string_set(
    section: &JsonValue,
    field: &str,
    default: &[&str],
) -> anyhow::Result<Vec<String>> {
    match section.get(field) {
        None => Ok(default.iter().map(|s| s.to_string()).collect()),
        Some(JsonValue::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_owned)
                    .with_context(|| format!("'{}' entries must be strings", field))
            })
            .collect(),
        Some(_) => anyhow::bail!("'{}' must be a list", field),
    }
}

fn positive_capacity(value: &JsonValue, rounding: Rounding) -> anyhow::Result<i64> {
    let text = match value {
        JsonValue::String(text) => text.clone(),
        JsonValue::Number(number) => number.to_string(),
        _ => anyhow::bail!("capacity values must be strings or numbers"),
    };
    let capacity = parse_quantity(&text, rounding)?;
    anyhow::ensure!(capacity > 0, "capacity values must be positive");
    Ok(capacity)
}

fn dynamic_validation_context(
    sc: &StorageClass,
    pvc: &PersistentVolumeClaim,
) -> anyhow::Result<JsonValue> {
    let requested = RequestedVolumeProperties::from_claim(pvc)?;
    Ok(json!({
        "requestedVolumeMode": requested.volume_mode.to_string(),
        "requestedAccessModes": requested
            .access_modes
            .iter()
            .map(|mode| mode.to_string())
            .collect::<Vec<_>>(),
        "requestedMinCapacity": requested.min_capacity,
        "requestedMaxCapacity": requested.max_capacity,
        "params": sc.parameters.clone().unwrap_or_default(),
        "sc": serde_json::to_value(sc)?,
        "pvc": serde_json::to_value(pvc)?,
    }))
}

fn creation_and_deletion_context(
    sc: &StorageClass,
    pvc: &PersistentVolumeClaim,
) -> anyhow::Result<JsonValue> {
    let mut context = dynamic_validation_context(sc, pvc)?;
    let uid = pvc.metadata.uid.as_deref().context("claim has no uid")?;
    context
        .as_object_mut()
        .unwrap()
        .insert("defaultHandle".to_owned(), json!(format!("pvc-{}", uid)));
    Ok(context)
}

// "accessModes" comes from the claim and not from the volume, since mounts of
// the volume can only use the access modes specified in the claim.
fn staging_and_unstaging_context(
    pvc: &PersistentVolumeClaim,
    pv: &PersistentVolume,
    node: &Node,
    read_only: bool,
) -> anyhow::Result<JsonValue> {
    let pv_spec = pv.spec.as_ref().context("volume has no spec")?;
    let csi = pv_spec.csi.as_ref().context("volume has no CSI source")?;

    let capacity = pv_spec
        .capacity
        .as_ref()
        .and_then(|capacity| capacity.get("storage"))
        .context("volume has no storage capacity")?;
    let capacity = parse_quantity(&capacity.0, Rounding::HalfEven)?;

    let access_modes = pvc
        .spec
        .as_ref()
        .and_then(|spec| spec.access_modes.clone())
        .unwrap_or_default();

    Ok(json!({
        "volumeMode": pv_spec.volume_mode.clone().unwrap_or_else(|| "Filesystem".to_owned()),
        "accessModes": access_modes,
        "capacity": capacity,
        "params": csi.volume_attributes.clone().unwrap_or_default(),
        "handle": csi.volume_handle,
        "readOnly": read_only,
        "pvc": serde_json::to_value(pvc)?,
        "pv": serde_json::to_value(pv)?,
        "node": serde_json::to_value(node)?,
    }))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn claim(volume_mode: &str, access_modes: &[&str], request: &str) -> PersistentVolumeClaim {
        serde_json::from_value(json!({
            "metadata": {"name": "claim", "namespace": "default", "uid": "11111111-2222-3333-4444-555555555555"},
            "spec": {
                "volumeMode": volume_mode,
                "accessModes": access_modes,
                "resources": {"requests": {"storage": request}},
            },
        }))
        .unwrap()
    }

    #[test]
    fn requested_properties_come_from_the_claim() {
        let requested =
            RequestedVolumeProperties::from_claim(&claim("Block", &["ReadWriteOnce"], "10Gi"))
                .unwrap();
        assert_eq!(requested.volume_mode, VolumeMode::Block);
        assert_eq!(
            requested.access_modes,
            BTreeSet::from([AccessMode::ReadWriteOnce])
        );
        assert_eq!(requested.min_capacity, 10_737_418_240);
        assert_eq!(requested.max_capacity, None);
    }

    #[test]
    fn unknown_modes_are_rejected() {
        assert!(
            RequestedVolumeProperties::from_claim(&claim("Tape", &["ReadWriteOnce"], "1Gi"))
                .is_err()
        );
        assert!(
            RequestedVolumeProperties::from_claim(&claim("Block", &["ReadWriteTwice"], "1Gi"))
                .is_err()
        );
    }

    #[test]
    fn capacities_must_be_positive() {
        assert!(positive_capacity(&json!("1Gi"), Rounding::Floor).is_ok());
        assert!(positive_capacity(&json!(1), Rounding::Floor).is_ok());
        assert!(positive_capacity(&json!("0"), Rounding::Floor).is_err());
        assert!(positive_capacity(&json!([]), Rounding::Floor).is_err());
    }

    #[test]
    fn validation_context_carries_requested_properties() {
        let sc: StorageClass = serde_json::from_value(json!({
            "metadata": {"name": "fast"},
            "provisioner": "my-provisioner",
            "parameters": {"pool": "tank"},
        }))
        .unwrap();
        let context =
            dynamic_validation_context(&sc, &claim("Filesystem", &["ReadWriteOnce"], "1Gi"))
                .unwrap();
        assert_eq!(context["requestedVolumeMode"], "Filesystem");
        assert_eq!(context["requestedMinCapacity"], 1_073_741_824i64);
        assert!(context["requestedMaxCapacity"].is_null());
        assert_eq!(context["params"]["pool"], "tank");
    }
}
