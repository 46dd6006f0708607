//! kedit kubehub – discovery and single-object watch wiring

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};

use futures::TryStreamExt;
use kedit_core::ObjectIdentity;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use tokio::sync::mpsc;

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client")
}

/// Parse a `v1/Kind` or `group/v1/Kind` key.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// `apiVersion` as written in manifests for a GVK.
pub fn api_version_of(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() { gvk.version.clone() } else { format!("{}/{}", gvk.group, gvk.version) }
}

pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Dynamic API handle for the object an identity names.
pub async fn api_for(client: Client, identity: &ObjectIdentity) -> Result<Api<DynamicObject>> {
    let (group, version) = identity.group_version();
    let gvk = GroupVersionKind { group: group.to_string(), version: version.to_string(), kind: identity.kind.clone() };
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
    let api = if namespaced {
        match identity.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(client, ns, &ar),
            None => return Err(anyhow!("namespace required for namespaced kind {}", identity.kind)),
        }
    } else {
        Api::all_with(client, &ar)
    };
    Ok(api)
}

/// Serialize a live object the way drafts are shown: YAML via JSON.
pub fn object_to_yaml(obj: &DynamicObject) -> Result<String> {
    let json = serde_json::to_value(obj).context("serializing DynamicObject")?;
    serde_yaml::to_string(&json).context("rendering object as YAML")
}

/// List+watch one object and publish each applied revision as YAML text.
///
/// Returns when the receiver is dropped or the stream ends.
pub async fn watch_object(client: Client, identity: &ObjectIdentity, tx: mpsc::Sender<String>) -> Result<()> {
    let api = api_for(client, identity).await?;
    let cfg = watcher::Config::default().fields(&format!("metadata.name={}", identity.name));
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    info!(object = %identity, "watcher started");
    while let Some(ev) = stream.try_next().await? {
        let latest = match ev {
            Event::Applied(o) => Some(o),
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                list.into_iter().find(|o| o.metadata.name.as_deref() == Some(identity.name.as_str()))
            }
            Event::Deleted(_) => {
                warn!(object = %identity, "watched object deleted");
                None
            }
        };
        let Some(obj) = latest else { continue };
        counter!("baseline_revisions_total", 1u64);
        let text = object_to_yaml(&obj)?;
        if tx.send(text).await.is_err() {
            debug!("baseline receiver dropped; stopping watcher");
            return Ok(());
        }
    }
    warn!("watcher stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_keys_round_trip_to_api_version() {
        let core = parse_gvk_key("v1/ConfigMap").unwrap();
        assert_eq!(api_version_of(&core), "v1");
        let apps = parse_gvk_key("apps/v1/Deployment").unwrap();
        assert_eq!(apps.group, "apps");
        assert_eq!(api_version_of(&apps), "apps/v1");
        assert!(parse_gvk_key("Deployment").is_err());
    }

    #[test]
    fn dynamic_object_renders_as_yaml() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "x", "namespace": "ns", "resourceVersion": "3" },
            "data": { "k": "v" }
        }))
        .unwrap();
        let y = object_to_yaml(&obj).unwrap();
        let id = kedit_apply::parse_identity(&y).unwrap();
        assert_eq!(id.kind, "ConfigMap");
        assert_eq!(id.resource_version.as_deref(), Some("3"));
    }
}
