use crate::{json, Body};
use hyper::{Response, StatusCode};
use kube_gateway_core::{ClusterClient, DynamicObject, Error, ResourceDescriptor, Result};
use kube_gateway_k8s_api::ResourceExt;
use serde_json::{Map, Value};
use tracing::info;

pub(crate) async fn create(
    client: &dyn ClusterClient,
    mut resource: ResourceDescriptor,
    body: &[u8],
) -> Result<Response<Body>> {
    let object = prepare(&mut resource, body)?;
    let created = client.create(&resource, object).await?;
    done(&resource, &created, "created")
}

pub(crate) async fn update(
    client: &dyn ClusterClient,
    mut resource: ResourceDescriptor,
    body: &[u8],
) -> Result<Response<Body>> {
    let object = prepare(&mut resource, body)?;
    let updated = client.update(&resource, object).await?;
    done(&resource, &updated, "updated")
}

/// Applies a merge patch to the current object. The object is fetched first
/// so that a missing object is reported as such.
pub(crate) async fn patch(
    client: &dyn ClusterClient,
    resource: ResourceDescriptor,
    body: &[u8],
) -> Result<Response<Body>> {
    client.get(&resource).await?;
    let patch = match serde_json::from_slice::<Value>(body) {
        Ok(patch @ Value::Object(_)) => patch,
        Ok(_) => return Err(Error::BadRequest("patch must be a JSON object".to_string())),
        Err(error) => return Err(Error::BadRequest(format!("invalid patch: {error}"))),
    };
    let patched = client.patch(&resource, patch).await?;
    done(&resource, &patched, "patched")
}

pub(crate) async fn delete(
    client: &dyn ClusterClient,
    resource: ResourceDescriptor,
) -> Result<Response<Body>> {
    let current = client.get(&resource).await?;
    client.delete(&resource).await?;
    done(&resource, &current, "deleted")
}

fn done(
    resource: &ResourceDescriptor,
    object: &DynamicObject,
    action: &str,
) -> Result<Response<Body>> {
    let msg = format!("{}/{} {action}", resource.kind, object.name_any());
    info!(ns = ?object.namespace(), "{msg}");
    json(StatusCode::OK, &serde_json::json!({ "msg": msg }))
}

/// Parses a request body into an object of the resolved kind.
///
/// Type information and the namespace are filled in from the request path
/// when the body omits them and must match it otherwise. A body namespace on
/// a path without one scopes the request to that namespace. On named paths,
/// the body's name must be absent or equal to the path's.
fn prepare(resource: &mut ResourceDescriptor, body: &[u8]) -> Result<DynamicObject> {
    let mut value = serde_json::from_slice::<Value>(body)
        .map_err(|error| Error::BadRequest(format!("invalid object: {error}")))?;
    let fields = value
        .as_object_mut()
        .ok_or_else(|| Error::BadRequest("object must be a JSON object".to_string()))?;

    fill(fields, "apiVersion", &resource.api_version())?;
    fill(fields, "kind", &resource.kind)?;

    let metadata = fields
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| Error::BadRequest("metadata must be a JSON object".to_string()))?;

    match (resource.namespace.clone(), metadata.get("namespace").cloned()) {
        (Some(ns), _) => fill(metadata, "namespace", &ns)?,
        (None, Some(Value::String(ns))) => resource.namespace = Some(ns),
        (None, None | Some(Value::Null)) => {}
        (None, Some(_)) => {
            return Err(Error::BadRequest("namespace must be a string".to_string()));
        }
    }

    if let Some(name) = resource.name.as_deref() {
        fill(metadata, "name", name)?;
    }

    serde_json::from_value(value)
        .map_err(|error| Error::BadRequest(format!("invalid object: {error}")))
}

/// Sets `key` to `expected` when absent, and otherwise requires that it
/// already equals `expected`.
fn fill(fields: &mut Map<String, Value>, key: &str, expected: &str) -> Result<()> {
    match fields.get(key) {
        None | Some(Value::Null) => {
            fields.insert(key.to_string(), Value::String(expected.to_string()));
            Ok(())
        }
        Some(Value::String(actual)) if actual == expected => Ok(()),
        Some(actual) => Err(Error::BadRequest(format!(
            "{key} {actual} does not match {expected:?}"
        ))),
    }
}
