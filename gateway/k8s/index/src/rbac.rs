use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use kube_gateway_core::{
    authz::{Binding, RbacSource, RoleRef},
    PolicyRule, Result,
};
use kube_gateway_k8s_api::{ClusterRole, ClusterRoleBinding, ResourceExt, Role, RoleBinding};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info_span, warn};


pub type SharedIndex = Arc<RwLock<Index>>;

/// Holds the cluster's RBAC state.
#[derive(Debug, Default)]
pub struct Index {
    bindings: HashMap<BindingKey, Binding>,
    by_subject: HashMap<String, HashSet<BindingKey>>,
    roles: HashMap<(String, String), Vec<PolicyRule>>,
    cluster_roles: HashMap<String, Vec<PolicyRule>>,
}

/// Serves authorization lookups from a shared index.
#[derive(Clone, Debug)]
pub struct RbacIndex(SharedIndex);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum BindingKey {
    Namespaced { namespace: String, name: String },
    Cluster(String),
}

// === impl Index ===

impl Index {
    pub fn shared() -> SharedIndex {
        Arc::new(RwLock::new(Self::default()))
    }

    fn apply_binding(&mut self, key: BindingKey, binding: Binding) {
        self.remove_binding(&key);
        for subject in &binding.subjects {
            self.by_subject
                .entry(subject.clone())
                .or_default()
                .insert(key.clone());
        }
        debug!(subjects = binding.subjects.len(), role = ?binding.role, "Indexed binding");
        self.bindings.insert(key, binding);
    }

    fn remove_binding(&mut self, key: &BindingKey) {
        let Some(binding) = self.bindings.remove(key) else {
            return;
        };
        for subject in &binding.subjects {
            if let Some(keys) = self.by_subject.get_mut(subject) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_subject.remove(subject);
                }
            }
        }
    }

    /// Returns the bindings that name `subject`, limited to RoleBindings in
    /// `namespace` or to ClusterRoleBindings.
    fn bindings_for(&self, subject: &str, namespace: Option<&str>) -> Vec<Binding> {
        let Some(keys) = self.by_subject.get(subject) else {
            return Vec::new();
        };
        keys.iter()
            .filter(|key| match (key, namespace) {
                (BindingKey::Namespaced { namespace: ns, .. }, Some(namespace)) => ns == namespace,
                (BindingKey::Cluster(_), None) => true,
                _ => false,
            })
            .filter_map(|key| self.bindings.get(key).cloned())
            .collect()
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }
}

fn subjects(subjects: Option<&Vec<kube_gateway_k8s_api::Subject>>) -> Vec<String> {
    subjects
        .into_iter()
        .flatten()
        .map(|s| s.name.clone())
        .collect()
}

fn role_ref(kind: &str, name: String) -> Option<RoleRef> {
    match kind {
        "Role" => Some(RoleRef::Role(name)),
        "ClusterRole" => Some(RoleRef::ClusterRole(name)),
        _ => None,
    }
}

fn rules(rules: Option<&Vec<kube_gateway_k8s_api::PolicyRule>>) -> Vec<PolicyRule> {
    rules.into_iter().flatten().map(PolicyRule::from).collect()
}

impl kubert::index::IndexNamespacedResource<RoleBinding> for Index {
    fn apply(&mut self, rb: RoleBinding) {
        let namespace = rb.namespace().unwrap_or_default();
        let name = rb.name_unchecked();
        let _span = info_span!("apply", ns = %namespace, %name).entered();

        let Some(role) = role_ref(&rb.role_ref.kind, rb.role_ref.name.clone()) else {
            warn!(kind = %rb.role_ref.kind, "Unsupported role reference");
            return;
        };
        let binding = Binding {
            name: name.clone(),
            namespace: Some(namespace.clone()),
            subjects: subjects(rb.subjects.as_ref()),
            role,
        };
        self.apply_binding(BindingKey::Namespaced { namespace, name }, binding);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let _span = info_span!("delete", ns = %namespace, %name).entered();
        self.remove_binding(&BindingKey::Namespaced { namespace, name });
    }
}

impl kubert::index::IndexClusterResource<ClusterRoleBinding> for Index {
    fn apply(&mut self, crb: ClusterRoleBinding) {
        let name = crb.name_unchecked();
        let _span = info_span!("apply", %name).entered();

        // ClusterRoleBindings may only reference ClusterRoles.
        if crb.role_ref.kind != "ClusterRole" {
            warn!(kind = %crb.role_ref.kind, "Unsupported role reference");
            return;
        }
        let binding = Binding {
            name: name.clone(),
            namespace: None,
            subjects: subjects(crb.subjects.as_ref()),
            role: RoleRef::ClusterRole(crb.role_ref.name.clone()),
        };
        self.apply_binding(BindingKey::Cluster(name), binding);
    }

    fn delete(&mut self, name: String) {
        let _span = info_span!("delete", %name).entered();
        self.remove_binding(&BindingKey::Cluster(name));
    }
}

impl kubert::index::IndexNamespacedResource<Role> for Index {
    fn apply(&mut self, role: Role) {
        let namespace = role.namespace().unwrap_or_default();
        let name = role.name_unchecked();
        let rules = rules(role.rules.as_ref());
        debug!(ns = %namespace, %name, rules = rules.len(), "Indexed Role");
        self.roles.insert((namespace, name), rules);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.roles.remove(&(namespace, name));
    }
}

impl kubert::index::IndexClusterResource<ClusterRole> for Index {
    fn apply(&mut self, role: ClusterRole) {
        let name = role.name_unchecked();
        let rules = rules(role.rules.as_ref());
        debug!(%name, rules = rules.len(), "Indexed ClusterRole");
        self.cluster_roles.insert(name, rules);
    }

    fn delete(&mut self, name: String) {
        self.cluster_roles.remove(&name);
    }
}

// === impl RbacIndex ===

impl RbacIndex {
    pub fn new(index: SharedIndex) -> Self {
        Self(index)
    }
}

#[async_trait::async_trait]
impl RbacSource for RbacIndex {
    async fn role_bindings(&self, subject: &str, namespace: &str) -> Result<Vec<Binding>> {
        Ok(self.0.read().bindings_for(subject, Some(namespace)))
    }

    async fn cluster_role_bindings(&self, subject: &str) -> Result<Vec<Binding>> {
        Ok(self.0.read().bindings_for(subject, None))
    }

    async fn role(&self, namespace: &str, name: &str) -> Result<Option<Vec<PolicyRule>>> {
        Ok(self
            .0
            .read()
            .roles
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn cluster_role(&self, name: &str) -> Result<Option<Vec<PolicyRule>>> {
        Ok(self.0.read().cluster_roles.get(name).cloned())
    }
}
