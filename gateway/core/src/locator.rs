use crate::{Error, Result};
use kube_gateway_k8s_api::{
    ApiResource, DynamicObject, GroupVersionKind, ListMeta, ListParams, Selector, TypeMeta,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;


/// The maximum number of items returned by a list when no limit is given.
pub const DEFAULT_LIST_LIMIT: u32 = 500;

/// Identifies a resource from request path parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourcePath {
    /// Empty for the core group.
    pub group: String,
    pub version: String,
    pub resource: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

/// A resource resolved against the cluster's discovery information.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub group: String,
    pub version: String,
    pub kind: String,

    /// The plural resource name, as it appears in request paths.
    pub resource: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

/// A schema-less list of objects, tagged with its API version and kind.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenericList {
    #[serde(flatten)]
    pub types: TypeMeta,
    #[serde(default)]
    pub metadata: ListMeta,
    pub items: Vec<DynamicObject>,
}

/// Parameters of a list request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListOptions {
    pub limit: u32,
    pub label_selector: Selector,
}

/// Models the cluster API.
///
/// Resource-scoped operations act on a descriptor's namespace when one is
/// set and on the cluster scope otherwise.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Maps a group/version/resource to its kind, if the cluster serves it.
    async fn discover(&self, group: &str, version: &str, resource: &str)
        -> Result<Option<String>>;

    async fn get(&self, resource: &ResourceDescriptor) -> Result<DynamicObject>;

    async fn list(
        &self,
        resource: &ResourceDescriptor,
        options: &ListOptions,
    ) -> Result<GenericList>;

    async fn create(
        &self,
        resource: &ResourceDescriptor,
        object: DynamicObject,
    ) -> Result<DynamicObject>;

    /// Replaces the named object.
    async fn update(
        &self,
        resource: &ResourceDescriptor,
        object: DynamicObject,
    ) -> Result<DynamicObject>;

    /// Applies a JSON merge patch to the named object.
    async fn patch(
        &self,
        resource: &ResourceDescriptor,
        patch: serde_json::Value,
    ) -> Result<DynamicObject>;

    async fn delete(&self, resource: &ResourceDescriptor) -> Result<()>;
}

/// Resolves request paths into resource descriptors.
#[derive(Clone)]
pub struct Locator {
    client: Arc<dyn ClusterClient>,
}

// === impl ResourcePath ===

impl std::fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

// === impl ResourceDescriptor ===

impl ResourceDescriptor {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(&self.group, &self.version, &self.kind);
        ApiResource::from_gvk_with_plural(&gvk, &self.resource)
    }

    /// A short `Kind/name` reference used in responses and logs.
    pub fn reference(&self) -> String {
        format!("{}/{}", self.kind, self.name.as_deref().unwrap_or_default())
    }

    /// Returns an empty object tagged with this resource's API version and kind.
    pub fn generic_object(&self) -> DynamicObject {
        let mut obj = DynamicObject::new(
            self.name.as_deref().unwrap_or_default(),
            &self.api_resource(),
        );
        obj.metadata.namespace = self.namespace.clone();
        obj
    }

    /// Returns an empty list tagged with this resource's API version and kind.
    pub fn generic_list(&self) -> GenericList {
        GenericList {
            types: TypeMeta {
                api_version: self.api_version(),
                kind: format!("{}List", self.kind),
            },
            metadata: ListMeta::default(),
            items: Vec::new(),
        }
    }
}

// === impl ListOptions ===

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIST_LIMIT,
            label_selector: Selector::default(),
        }
    }
}

impl ListOptions {
    /// Parses the `limit` and `labelSelector` query parameters.
    pub fn parse(limit: Option<&str>, label_selector: Option<&str>) -> Result<Self> {
        let limit = match limit {
            None | Some("") => DEFAULT_LIST_LIMIT,
            Some(limit) => limit
                .parse()
                .map_err(|_| Error::BadRequest(format!("invalid limit: {limit:?}")))?,
        };
        let label_selector = Selector::parse(label_selector.unwrap_or_default())
            .map_err(|error| Error::BadRequest(error.to_string()))?;
        Ok(Self {
            limit,
            label_selector,
        })
    }

    pub fn to_params(&self) -> ListParams {
        let params = ListParams::default().limit(self.limit);
        if self.label_selector.is_empty() {
            return params;
        }
        params.labels(&self.label_selector.to_string())
    }
}

// === impl Locator ===

impl Locator {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }

    /// Resolves the kind served at a group/version/resource.
    pub async fn resolve(&self, group: &str, version: &str, resource: &str) -> Result<String> {
        self.client
            .discover(group, version, resource)
            .await?
            .ok_or_else(|| {
                Error::UnknownResource(
                    ResourcePath {
                        group: group.to_string(),
                        version: version.to_string(),
                        resource: resource.to_string(),
                        ..Default::default()
                    }
                    .to_string(),
                )
            })
    }

    pub async fn descriptor(&self, path: ResourcePath) -> Result<ResourceDescriptor> {
        let kind = self
            .resolve(&path.group, &path.version, &path.resource)
            .await?;
        let ResourcePath {
            group,
            version,
            resource,
            namespace,
            name,
        } = path;
        Ok(ResourceDescriptor {
            group,
            version,
            kind,
            resource,
            namespace,
            name,
        })
    }
}
