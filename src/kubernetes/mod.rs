//! Thin primitives over the Kubernetes API: single-object watches,
//! read-modify-replace, and synchronous foreground deletion. Everything else
//! in this system is built on these.

pub mod quantity;

use std::fmt::Debug;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, PostParams, PropagationPolicy};
use kube::{Client, Resource, ResourceExt};
use kube_runtime::watcher;
use kube_runtime::watcher::Event;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A namespaced object pinned by uid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRef {
    pub name: String,
    pub namespace: String,
    pub uid: String,
}

/// A cluster-scoped object pinned by uid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterObjectRef {
    pub name: String,
    pub uid: String,
}

/// Observe a single object until the callback produces a result.
///
/// The object is listed once and then streamed, so the callback must be
/// idempotent: it may see the same version more than once, and it may miss
/// intermediate versions, but it always eventually sees the latest one. If
/// the watch cursor ages out the underlying watcher relists transparently.
///
/// Fails if the object is deleted while being watched, or if an object with a
/// different uid takes its name.
pub async fn watch_object<K, T, F>(api: Api<K>, name: &str, mut callback: F) -> anyhow::Result<T>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    F: FnMut(&K) -> anyhow::Result<Option<T>>,
{
    let params = ListParams::default().fields(&format!("metadata.name={}", name));
    let mut stream = watcher(api, params).boxed();
    let mut uid: Option<String> = None;

    while let Some(event) = stream.try_next().await? {
        let objects = match event {
            Event::Applied(object) => vec![object],
            Event::Deleted(_) => anyhow::bail!("object {} was deleted", name),
            Event::Restarted(objects) => {
                if objects.is_empty() && uid.is_some() {
                    anyhow::bail!("object {} was deleted", name);
                }
                objects
            }
        };

        for object in objects {
            match &uid {
                None => uid = object.uid(),
                Some(uid) => {
                    anyhow::ensure!(
                        object.uid().as_ref() == Some(uid),
                        "received events for more than one object named {}",
                        name
                    );
                }
            }
            if let Some(result) = callback(&object)? {
                return Ok(result);
            }
        }
    }

    anyhow::bail!("watch of object {} ended unexpectedly", name)
}

/// Atomically apply an arbitrary modification to an object. Use when patching
/// is insufficient.
///
/// Works by reading and replacing the object, retrying from the read whenever
/// the replace fails with a version conflict. The replace is skipped entirely
/// when the modifier leaves the serialized object unchanged. Returns the
/// resulting object.
pub async fn modify_atomically<K, F>(api: &Api<K>, name: &str, mut modifier: F) -> anyhow::Result<K>
where
    K: Clone + Serialize + DeserializeOwned + Debug,
    F: FnMut(&mut K) -> anyhow::Result<()>,
{
    loop {
        let mut object = api.get(name).await?;
        let original = serde_json::to_value(&object)?;

        modifier(&mut object)?;

        if serde_json::to_value(&object)? == original {
            return Ok(object);
        }

        match api.replace(name, &PostParams::default(), &object).await {
            Ok(object) => return Ok(object),
            Err(kube::Error::Api(response)) if response.code == 409 => continue,
            Err(error) => return Err(error.into()),
        }
    }
}

/// Delete an object with foreground cascading and wait until it is gone.
/// An object that does not exist to begin with is a success.
pub async fn synchronously_delete<K>(api: Api<K>, name: &str) -> anyhow::Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let params = DeleteParams {
        propagation_policy: Some(PropagationPolicy::Foreground),
        ..Default::default()
    };

    match api.delete(name, &params).await {
        Ok(_) => {}
        Err(kube::Error::Api(response)) if response.code == 404 => return Ok(()),
        Err(error) => return Err(error.into()),
    }

    let list_params = ListParams::default().fields(&format!("metadata.name={}", name));
    let mut stream = watcher(api, list_params).boxed();

    while let Some(event) = stream.try_next().await? {
        match event {
            Event::Deleted(_) => return Ok(()),
            Event::Restarted(objects) if objects.is_empty() => return Ok(()),
            _ => {}
        }
    }

    anyhow::bail!("watch for deletion of object {} ended unexpectedly", name)
}

pub async fn synchronously_delete_pod(
    client: &Client,
    name: &str,
    namespace: &str,
) -> anyhow::Result<()> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    synchronously_delete(api, name).await
}
