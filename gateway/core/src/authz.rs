use crate::{Identity, ResourcePath, Result};
use ahash::AHashSet as HashSet;
use http::Method;
use tracing::{debug, trace};


const WILDCARD: &str = "*";

/// The RBAC verb a request is checked against.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Watch,
    Create,
    Update,
    Patch,
    Delete,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// Grants a set of verbs over a set of resources within a set of API groups.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyRule {
    pub api_groups: HashSet<String>,
    pub resources: HashSet<String>,
    pub verbs: HashSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoleRef {
    Role(String),
    ClusterRole(String),
}

/// Associates subjects with a role.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub name: String,

    /// Set for RoleBindings; `None` for ClusterRoleBindings.
    pub namespace: Option<String>,
    pub subjects: Vec<String>,
    pub role: RoleRef,
}

/// The union of all rules gathered for one authorization decision.
///
/// Each rule carries the namespace of the binding that granted it. Rules from
/// a RoleBinding only apply to resources in that namespace; rules from a
/// ClusterRoleBinding apply everywhere.
#[derive(Clone, Debug, Default)]
pub struct EffectiveRuleSet(Vec<ScopedRule>);

#[derive(Clone, Debug)]
struct ScopedRule {
    namespace: Option<String>,
    rule: PolicyRule,
}

/// Models the source of RBAC bindings and roles.
#[async_trait::async_trait]
pub trait RbacSource: Send + Sync {
    /// Returns the RoleBindings in `namespace` that name `subject`.
    async fn role_bindings(&self, subject: &str, namespace: &str) -> Result<Vec<Binding>>;

    /// Returns the ClusterRoleBindings that name `subject`.
    async fn cluster_role_bindings(&self, subject: &str) -> Result<Vec<Binding>>;

    /// Returns the rules of a namespaced Role, if it exists.
    async fn role(&self, namespace: &str, name: &str) -> Result<Option<Vec<PolicyRule>>>;

    /// Returns the rules of a ClusterRole, if it exists.
    async fn cluster_role(&self, name: &str) -> Result<Option<Vec<PolicyRule>>>;
}

/// Evaluates requests against the RBAC state exposed by an `RbacSource`.
#[derive(Clone)]
pub struct Authorizer {
    source: std::sync::Arc<dyn RbacSource>,
}

// === impl Verb ===

impl Verb {
    /// Derives the verb of a request.
    ///
    /// A watch request is always `watch`; a `GET` without a resource name is
    /// `list`.
    pub fn from_request(method: &Method, has_name: bool, watch: bool) -> Option<Self> {
        if watch {
            return Some(Self::Watch);
        }
        match *method {
            Method::GET if !has_name => Some(Self::List),
            Method::GET => Some(Self::Get),
            Method::POST => Some(Self::Create),
            Method::PUT => Some(Self::Update),
            Method::PATCH => Some(Self::Patch),
            Method::DELETE => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::List => "list",
            Self::Watch => "watch",
            Self::Create => "create",
            Self::Update => "update",
            Self::Patch => "patch",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl PolicyRule ===

impl PolicyRule {
    pub fn new<'a>(
        api_groups: impl IntoIterator<Item = &'a str>,
        resources: impl IntoIterator<Item = &'a str>,
        verbs: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            api_groups: api_groups.into_iter().map(Into::into).collect(),
            resources: resources.into_iter().map(Into::into).collect(),
            verbs: verbs.into_iter().map(Into::into).collect(),
        }
    }

    /// Indicates whether this rule grants `verb` on `resource` in `group`.
    pub fn matches(&self, group: &str, resource: &str, verb: Verb) -> bool {
        self.matches_group(group) && self.matches_verb(verb) && self.matches_resource(resource)
    }

    fn matches_group(&self, group: &str) -> bool {
        self.api_groups.contains(group) || self.api_groups.contains(WILDCARD)
    }

    fn matches_verb(&self, verb: Verb) -> bool {
        self.verbs.contains(verb.as_str()) || self.verbs.contains(WILDCARD)
    }

    // Singular and plural forms are matched loosely: `pod` grants `pods` and
    // `pods` grants `pod`.
    fn matches_resource(&self, resource: &str) -> bool {
        self.resources.iter().any(|r| {
            r == WILDCARD
                || r == resource
                || r.strip_suffix('s') == Some(resource)
                || resource.strip_suffix('s') == Some(r.as_str())
        })
    }
}

impl From<&kube_gateway_k8s_api::PolicyRule> for PolicyRule {
    fn from(rule: &kube_gateway_k8s_api::PolicyRule) -> Self {
        Self {
            api_groups: rule.api_groups.iter().flatten().cloned().collect(),
            resources: rule.resources.iter().flatten().cloned().collect(),
            verbs: rule.verbs.iter().cloned().collect(),
        }
    }
}

// === impl EffectiveRuleSet ===

impl EffectiveRuleSet {
    /// Adds rules granted by a binding in `namespace`, or by a cluster binding
    /// when `namespace` is `None`.
    pub fn extend(
        &mut self,
        namespace: Option<&str>,
        rules: impl IntoIterator<Item = PolicyRule>,
    ) {
        self.0.extend(rules.into_iter().map(|rule| ScopedRule {
            namespace: namespace.map(Into::into),
            rule,
        }));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Allows the request if any single rule in scope matches it.
    ///
    /// `namespace` is the namespace of the requested resource; `None` for
    /// cluster-wide paths, which only cluster bindings may reach.
    pub fn decide(
        &self,
        namespace: Option<&str>,
        group: &str,
        resource: &str,
        verb: Verb,
    ) -> Decision {
        let allowed = self.0.iter().any(|scoped| {
            scoped.applies_in(namespace) && scoped.rule.matches(group, resource, verb)
        });
        if allowed {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }
}

/// Collects cluster-wide rules.
impl std::iter::FromIterator<PolicyRule> for EffectiveRuleSet {
    fn from_iter<T: IntoIterator<Item = PolicyRule>>(iter: T) -> Self {
        let mut rules = Self::default();
        rules.extend(None, iter);
        rules
    }
}

impl ScopedRule {
    fn applies_in(&self, namespace: Option<&str>) -> bool {
        match self.namespace.as_deref() {
            None => true,
            Some(ns) => namespace == Some(ns),
        }
    }
}

// === impl Authorizer ===

impl Authorizer {
    pub fn new(source: std::sync::Arc<dyn RbacSource>) -> Self {
        Self { source }
    }

    /// Decides whether `identity` may perform `verb` on the resource named by
    /// `resource`.
    ///
    /// Only the path is consulted, so a request can be decided before its kind
    /// is discovered. Failures to read bindings or roles are returned as
    /// errors rather than being treated as a decision.
    pub async fn authorize(
        &self,
        identity: &Identity,
        resource: &ResourcePath,
        verb: Verb,
    ) -> Result<Decision> {
        let rules = self.effective_rules(identity).await?;
        let decision = rules.decide(
            resource.namespace.as_deref(),
            &resource.group,
            &resource.resource,
            verb,
        );
        debug!(
            %identity,
            ns = ?resource.namespace,
            group = %resource.group,
            resource = %resource.resource,
            %verb,
            rules = rules.len(),
            ?decision,
        );
        Ok(decision)
    }

    /// Gathers the rules of every role bound to `identity`, each scoped to
    /// its binding's namespace.
    ///
    /// Bindings that reference a missing role are skipped.
    pub async fn effective_rules(&self, identity: &Identity) -> Result<EffectiveRuleSet> {
        let mut bindings = self
            .source
            .role_bindings(&identity.name, &identity.namespace)
            .await?;
        bindings.extend(self.source.cluster_role_bindings(&identity.name).await?);

        let mut rules = EffectiveRuleSet::default();
        for binding in bindings {
            let role = match (&binding.role, binding.namespace.as_deref()) {
                (RoleRef::Role(name), Some(ns)) => self.source.role(ns, name).await?,
                (RoleRef::Role(name), None) => {
                    trace!(binding = %binding.name, role = %name, "Cluster binding cannot reference a Role");
                    None
                }
                (RoleRef::ClusterRole(name), _) => self.source.cluster_role(name).await?,
            };
            match role {
                Some(role) => rules.extend(binding.namespace.as_deref(), role),
                None => trace!(binding = %binding.name, role = ?binding.role, "Skipping missing role"),
            }
        }
        Ok(rules)
    }
}
