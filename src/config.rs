//! Constants shared by the agents and the CSI plugin.

use std::time::Duration;

/// Used as the API group of the Provisioner custom resource and as the prefix
/// of every label, annotation, and finalizer this system writes.
pub const DOMAIN: &str = "kubernetes-pav.io";

pub const PROVISIONER_GROUP: &str = DOMAIN;
pub const PROVISIONER_VERSION: &str = "v1alpha1";
pub const PROVISIONER_KIND: &str = "Provisioner";

/// Namespace holding the per-provisioner CSI plugin workloads deployed by the
/// controller agent.
pub const INTERNAL_NAMESPACE: &str = "kubernetes-pav";

/// Path of the CSI Unix domain socket inside plugin containers.
pub const CSI_SOCKET_PATH: &str = "/csi/socket";

/// Host directory under which helper-pod side-channel directories are created.
/// Each side-channel directory is bind-mounted at `/pav` inside every
/// container of its helper pod.
pub const SIDE_CHANNEL_BASE_DIR: &str = "/var/lib/kubernetes-pav";

/// How long a managing task sleeps before retrying after an internal failure.
pub const HANDLER_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Vendor version reported by the CSI identity service.
pub const VENDOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Sidecar images for the per-provisioner CSI plugin workloads.
pub const CSI_PROVISIONER_IMAGE: &str = "k8s.gcr.io/sig-storage/csi-provisioner:v3.0.0";
pub const CSI_NODE_DRIVER_REGISTRAR_IMAGE: &str =
    "k8s.gcr.io/sig-storage/csi-node-driver-registrar:v2.3.0";

/// A label, annotation, or finalizer name under this system's domain.
pub fn domain_key(suffix: &str) -> String {
    format!("{}/{}", DOMAIN, suffix)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn domain_keys_are_prefixed() {
        assert_eq!(domain_key("state"), "kubernetes-pav.io/state");
        assert_eq!(
            domain_key("deletion-requested"),
            "kubernetes-pav.io/deletion-requested"
        );
    }
}
