//! A handle over a helper pod and its side-channel directory.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::Client;

use crate::config::SIDE_CHANNEL_BASE_DIR;
use crate::kubernetes::{synchronously_delete_pod, watch_object};
use crate::pod::host::find_top_level_mounts;

pub struct PodHandle {
    client: Client,
    name: String,
    namespace: String,
    side_channel_path: PathBuf,
}

impl PodHandle {
    pub fn new(client: Client, name: &str, namespace: &str, side_channel_name: &str) -> Self {
        PodHandle {
            client,
            name: name.to_owned(),
            namespace: namespace.to_owned(),
            side_channel_path: Path::new(SIDE_CHANNEL_BASE_DIR).join(side_channel_name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Host path of the pod's side-channel directory, visible at `/pav`
    /// inside the pod.
    pub fn side_channel_path(&self) -> &Path {
        &self.side_channel_path
    }

    /// Read a UTF-8 file from the side-channel directory, or `None` if it
    /// does not exist or is not (a symlink to) a regular file.
    ///
    /// Must only be called from the node agent of the pod's node.
    pub async fn read_side_channel_file(&self, name: &str) -> Option<String> {
        let path = self.side_channel_path.join(name);
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => {}
            _ => return None,
        }
        tokio::fs::read_to_string(&path).await.ok()
    }

    /// Wait until the pod is scheduled to a node, returning that node's name.
    pub async fn wait_until_scheduled(&self) -> anyhow::Result<String> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        watch_object(api, &self.name, |pod: &Pod| {
            Ok(pod.spec.as_ref().and_then(|spec| spec.node_name.clone()))
        })
        .await
    }

    /// Wait until the pod terminates. Returns whether it succeeded.
    pub async fn wait_until_terminated(&self) -> anyhow::Result<bool> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        watch_object(api, &self.name, |pod: &Pod| {
            Ok(match phase(pod) {
                Some("Succeeded") => Some(true),
                Some("Failed") => Some(false),
                _ => None,
            })
        })
        .await
    }

    /// Wait until the pod terminates or creates `/pav/ready`. Returns `false`
    /// only when the pod terminated in failure.
    ///
    /// Must only be called from the node agent of the pod's node.
    pub async fn wait_until_terminated_or_ready(&self) -> anyhow::Result<bool> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let ready_file = self.side_channel_path.join("ready");

        loop {
            let pod = api.get(&self.name).await?;
            if phase(&pod) == Some("Succeeded") || ready_file.exists() {
                return Ok(true);
            }
            if phase(&pod) == Some("Failed") {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Delete the pod and its side-channel directory, ignoring a pod that no
    /// longer exists.
    ///
    /// Must only be called from the node agent of the pod's node.
    pub async fn delete(&self) -> anyhow::Result<()> {
        synchronously_delete_pod(&self.client, &self.name, &self.namespace).await?;

        // The helper may have left mounts behind in the side channel. Mounts
        // can hide other mounts, so keep unmounting top-level mount points
        // until none remain.
        loop {
            let mount_points = find_top_level_mounts(&self.side_channel_path)?;
            if mount_points.is_empty() {
                break;
            }
            for mount_point in mount_points {
                unmount(&mount_point).await?;
            }
        }

        if tokio::fs::metadata(&self.side_channel_path).await.is_ok() {
            tokio::fs::remove_dir_all(&self.side_channel_path).await?;
        }

        Ok(())
    }
}

fn phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|status| status.phase.as_deref())
}

/// Unmount a mount point left behind by a helper pod.
///
/// `--force` aborts pending requests that may never be served because the
/// backing remote or FUSE process is gone. The path came from
/// /proc/self/mountinfo and is already canonical, so `--no-canonicalize`
/// keeps umount from issuing further file system requests.
async fn unmount(mount_point: &Path) -> anyhow::Result<()> {
    let output = tokio::process::Command::new("/bin/umount")
        .arg("--force")
        .arg("--no-canonicalize")
        .arg("--recursive")
        .arg(mount_point)
        .stdin(Stdio::null())
        .output()
        .await?;

    anyhow::ensure!(
        output.status.success(),
        "umount of {} failed: {}",
        mount_point.display(),
        String::from_utf8_lossy(&output.stderr).trim()
    );
    Ok(())
}
