use crate::{
    core::{
        ClusterClient, DynamicObject, Error, GenericList, ListOptions, ResourceDescriptor, Result,
    },
    k8s::{self, Api, DeleteParams, Patch, PatchParams, PostParams, ResourceExt},
};
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use tracing::{debug, trace};


type KindKey = (String, String, String);

/// A cluster client backed by the Kubernetes API.
///
/// Discovered kinds are cached for the life of the process; misses are not.
pub struct KubeCluster {
    client: k8s::Client,
    kinds: RwLock<HashMap<KindKey, String>>,
}

// === impl KubeCluster ===

impl KubeCluster {
    pub fn new(client: k8s::Client) -> Self {
        Self {
            client,
            kinds: RwLock::new(HashMap::new()),
        }
    }

    fn api(&self, resource: &ResourceDescriptor) -> Api<DynamicObject> {
        let ar = resource.api_resource();
        match resource.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubeCluster {
    async fn discover(&self, group: &str, version: &str, resource: &str) -> Result<Option<String>> {
        let key = (group.to_string(), version.to_string(), resource.to_string());
        if let Some(kind) = self.kinds.read().get(&key) {
            return Ok(Some(kind.clone()));
        }

        let api_version = match group {
            "" => version.to_string(),
            group => format!("{group}/{version}"),
        };
        let listed = if group.is_empty() {
            self.client.list_core_api_resources(version).await
        } else {
            self.client.list_api_group_resources(&api_version).await
        };
        let resources = match listed {
            Ok(list) => list.resources,
            Err(error) => match api_error(error, &api_version) {
                Error::NotFound(_) => {
                    debug!(%api_version, "API group version not served");
                    return Ok(None);
                }
                error => return Err(error),
            },
        };

        // Subresources are listed as `<resource>/<subresource>`.
        let kind = resources
            .into_iter()
            .find(|r| r.name == resource && !r.name.contains('/'))
            .map(|r| r.kind);
        if let Some(kind) = kind.as_ref() {
            trace!(%api_version, %resource, %kind, "Discovered");
            self.kinds.write().insert(key, kind.clone());
        }
        Ok(kind)
    }

    async fn get(&self, resource: &ResourceDescriptor) -> Result<DynamicObject> {
        let name = required_name(resource)?;
        self.api(resource)
            .get(name)
            .await
            .map_err(|error| api_error(error, resource.reference()))
    }

    async fn list(
        &self,
        resource: &ResourceDescriptor,
        options: &ListOptions,
    ) -> Result<GenericList> {
        let listed = self
            .api(resource)
            .list(&options.to_params())
            .await
            .map_err(|error| api_error(error, resource.reference()))?;
        let mut list = resource.generic_list();
        list.metadata = listed.metadata;
        list.items = listed.items;
        Ok(list)
    }

    async fn create(
        &self,
        resource: &ResourceDescriptor,
        object: DynamicObject,
    ) -> Result<DynamicObject> {
        self.api(resource)
            .create(&PostParams::default(), &object)
            .await
            .map_err(|error| {
                let reference = format!("{}/{}", resource.kind, object.name_any());
                api_error(error, reference)
            })
    }

    async fn update(
        &self,
        resource: &ResourceDescriptor,
        object: DynamicObject,
    ) -> Result<DynamicObject> {
        let name = required_name(resource)?;
        self.api(resource)
            .replace(name, &PostParams::default(), &object)
            .await
            .map_err(|error| api_error(error, resource.reference()))
    }

    async fn patch(
        &self,
        resource: &ResourceDescriptor,
        patch: serde_json::Value,
    ) -> Result<DynamicObject> {
        let name = required_name(resource)?;
        self.api(resource)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|error| api_error(error, resource.reference()))
    }

    async fn delete(&self, resource: &ResourceDescriptor) -> Result<()> {
        let name = required_name(resource)?;
        self.api(resource)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|error| api_error(error, resource.reference()))?;
        Ok(())
    }
}

fn required_name(resource: &ResourceDescriptor) -> Result<&str> {
    resource
        .name
        .as_deref()
        .ok_or_else(|| Error::BadRequest(format!("{} requires a name", resource.reference())))
}

/// Classifies a Kubernetes API failure by the status code of the upstream
/// response.
pub(crate) fn api_error(error: k8s::Error, reference: impl Into<String>) -> Error {
    let response = match &error {
        k8s::Error::Api(response) => Some((response.code, response.message.clone())),
        _ => None,
    };
    match response {
        Some((400, message)) => Error::BadRequest(message),
        Some((404, _)) => Error::NotFound(reference.into()),
        Some((409, message)) => Error::Conflict(message),
        Some((422, message)) => Error::Invalid(message),
        _ => Error::Server(error.into()),
    }
}
