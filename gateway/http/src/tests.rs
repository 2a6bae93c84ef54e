use super::*;
use kube_gateway_core::{
    authn::{fingerprint, Verification, VerifyCredential},
    authz::{Binding, RbacSource, RoleRef},
    watch::{DeregisterBackoff, HandleNotification, Notification, SubscriptionId},
    CredentialCache, DynamicObject, GenericList, Identity, ListOptions, PolicyRule,
    ResourceDescriptor,
};
use kube_gateway_k8s_api::{ApiResource, GroupVersionKind, ResourceExt};
use maplit::{btreemap, hashmap};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};
use tokio::time;
use tower::ServiceExt;

const ALICE_TOKEN: &str = "alice-0123456789abcdef0123456789abcdef";
const BOB_TOKEN: &str = "bob-0123456789abcdef0123456789abcdef";
const BROKEN_TOKEN: &str = "broken-0123456789abcdef0123456789abcdef";

// === Fakes ===

#[derive(Default)]
struct FakeVerifier {
    principals: HashMap<&'static str, &'static str>,
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl VerifyCredential for FakeVerifier {
    async fn verify(&self, credential: &str) -> anyhow::Result<Verification> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if credential == BROKEN_TOKEN {
            anyhow::bail!("identity provider unavailable");
        }
        Ok(match self.principals.get(credential) {
            Some(principal) => Verification {
                authenticated: true,
                principal: principal.to_string(),
            },
            None => Verification {
                authenticated: false,
                principal: String::new(),
            },
        })
    }
}

type ObjectKey = (String, Option<String>, String);

#[derive(Default)]
struct FakeCluster {
    objects: Mutex<BTreeMap<ObjectKey, DynamicObject>>,
    gets: AtomicUsize,
}

#[async_trait::async_trait]
impl ClusterClient for FakeCluster {
    async fn discover(&self, group: &str, version: &str, resource: &str) -> Result<Option<String>> {
        Ok(match (group, version, resource) {
            ("", "v1", "pods") => Some("Pod".to_string()),
            ("", "v1", "namespaces") => Some("Namespace".to_string()),
            ("apps", "v1", "deployments") => Some("Deployment".to_string()),
            _ => None,
        })
    }

    async fn get(&self, resource: &ResourceDescriptor) -> Result<DynamicObject> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .get(&key(resource))
            .cloned()
            .ok_or_else(|| Error::NotFound(resource.reference()))
    }

    async fn list(
        &self,
        resource: &ResourceDescriptor,
        options: &ListOptions,
    ) -> Result<GenericList> {
        let selector = options.to_params().label_selector.unwrap_or_default();
        let mut list = resource.generic_list();
        list.items = self
            .objects
            .lock()
            .iter()
            .filter(|((r, ns, _), _)| {
                *r == resource.resource
                    && (resource.namespace.is_none() || *ns == resource.namespace)
            })
            .filter(|(_, obj)| {
                selector.split(',').filter(|t| !t.is_empty()).all(|term| {
                    term.split_once('=')
                        .is_some_and(|(k, v)| obj.labels().get(k).map(String::as_str) == Some(v))
                })
            })
            .map(|(_, obj)| obj.clone())
            .take(options.limit as usize)
            .collect();
        Ok(list)
    }

    async fn create(
        &self,
        resource: &ResourceDescriptor,
        object: DynamicObject,
    ) -> Result<DynamicObject> {
        let key = (resource.resource.clone(), object.namespace(), object.name_any());
        let mut objects = self.objects.lock();
        if objects.contains_key(&key) {
            return Err(Error::Conflict(object.name_any()));
        }
        objects.insert(key, object.clone());
        Ok(object)
    }

    async fn update(
        &self,
        resource: &ResourceDescriptor,
        object: DynamicObject,
    ) -> Result<DynamicObject> {
        let mut objects = self.objects.lock();
        let current = objects
            .get_mut(&key(resource))
            .ok_or_else(|| Error::NotFound(resource.reference()))?;
        *current = object.clone();
        Ok(object)
    }

    async fn patch(&self, resource: &ResourceDescriptor, patch: Value) -> Result<DynamicObject> {
        let mut objects = self.objects.lock();
        let current = objects
            .get_mut(&key(resource))
            .ok_or_else(|| Error::NotFound(resource.reference()))?;
        let mut value = serde_json::to_value(&*current).map_err(|e| Error::Server(e.into()))?;
        merge(&mut value, &patch);
        *current = serde_json::from_value(value).map_err(|e| Error::Server(e.into()))?;
        Ok(current.clone())
    }

    async fn delete(&self, resource: &ResourceDescriptor) -> Result<()> {
        self.objects
            .lock()
            .remove(&key(resource))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(resource.reference()))
    }
}

impl FakeCluster {
    fn insert(&self, object: DynamicObject) {
        let key = ("pods".to_string(), object.namespace(), object.name_any());
        self.objects.lock().insert(key, object);
    }

    fn remove(&self, ns: &str, name: &str) -> Option<DynamicObject> {
        let key = ("pods".to_string(), Some(ns.to_string()), name.to_string());
        self.objects.lock().remove(&key)
    }

    fn pod(&self, ns: &str, name: &str) -> Option<DynamicObject> {
        let key = ("pods".to_string(), Some(ns.to_string()), name.to_string());
        self.objects.lock().get(&key).cloned()
    }
}

fn key(resource: &ResourceDescriptor) -> ObjectKey {
    (
        resource.resource.clone(),
        resource.namespace.clone(),
        resource.name.clone().unwrap_or_default(),
    )
}

fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (k, v) in patch {
                if v.is_null() {
                    target.remove(k);
                } else {
                    merge(target.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

#[derive(Default)]
struct FakeRbac {
    bindings: Vec<Binding>,
    roles: HashMap<String, Vec<PolicyRule>>,
}

#[async_trait::async_trait]
impl RbacSource for FakeRbac {
    async fn role_bindings(&self, subject: &str, namespace: &str) -> Result<Vec<Binding>> {
        Ok(self
            .bindings
            .iter()
            .filter(|b| b.namespace.as_deref() == Some(namespace))
            .filter(|b| b.subjects.iter().any(|s| s == subject))
            .cloned()
            .collect())
    }

    async fn cluster_role_bindings(&self, subject: &str) -> Result<Vec<Binding>> {
        Ok(self
            .bindings
            .iter()
            .filter(|b| b.namespace.is_none())
            .filter(|b| b.subjects.iter().any(|s| s == subject))
            .cloned()
            .collect())
    }

    async fn role(&self, _: &str, name: &str) -> Result<Option<Vec<PolicyRule>>> {
        Ok(self.roles.get(name).cloned())
    }

    async fn cluster_role(&self, name: &str) -> Result<Option<Vec<PolicyRule>>> {
        Ok(self.roles.get(name).cloned())
    }
}

#[derive(Default)]
struct FakeIssuer {
    issued: Mutex<Vec<String>>,
    revoked: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl IssueCredential for FakeIssuer {
    async fn issue(&self, name: &str) -> Result<String> {
        self.issued.lock().push(name.to_string());
        Ok(format!("issued-{name}-0123456789abcdef0123456789abcdef"))
    }

    async fn revoke(&self, name: &str) -> Result<()> {
        if !self.issued.lock().iter().any(|n| n == name) {
            return Err(Error::NotFound(format!("ServiceAccount/{name}")));
        }
        self.revoked.lock().push(name.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct FakeSubscriptions {
    handlers: Mutex<HashMap<SubscriptionId, Arc<dyn HandleNotification>>>,
    next_id: AtomicU64,
    deregistered: Mutex<Vec<SubscriptionId>>,
    attempts: AtomicUsize,
    failures: AtomicUsize,
}

#[async_trait::async_trait]
impl Subscribe for FakeSubscriptions {
    async fn subscribe(
        &self,
        _: &ResourceDescriptor,
        handler: Arc<dyn HandleNotification>,
    ) -> Result<SubscriptionId> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.handlers.lock().insert(id, handler);
        Ok(id)
    }

    async fn deregister(&self, id: SubscriptionId) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::Server(anyhow::anyhow!("informer unavailable")));
        }
        self.handlers
            .lock()
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("subscription {}", id.0)))?;
        self.deregistered.lock().push(id);
        Ok(())
    }
}

impl FakeSubscriptions {
    fn notify(&self, notification: Notification) {
        for handler in self.handlers.lock().values() {
            handler.handle(&notification);
        }
    }

    fn count(&self) -> usize {
        self.handlers.lock().len()
    }
}

// === Fixture ===

struct Fixture {
    gateway: Gateway,
    cache: Arc<CredentialCache>,
    verifier: Arc<FakeVerifier>,
    cluster: Arc<FakeCluster>,
    issuer: Arc<FakeIssuer>,
    subscriptions: Arc<FakeSubscriptions>,
    metrics: HttpMetrics,
    registry: prometheus_client::registry::Registry,
    signal: Option<drain::Signal>,
}

fn pod(ns: &str, name: &str, version: &str, labels: BTreeMap<String, String>) -> DynamicObject {
    let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "Pod"));
    let mut obj = DynamicObject::new(name, &ar).within(ns);
    obj.metadata.resource_version = Some(version.to_string());
    obj.metadata.labels = Some(labels);
    obj
}

fn bind(namespace: Option<&str>, subject: &str, role: &str) -> Binding {
    Binding {
        name: format!("{subject}-{role}"),
        namespace: namespace.map(Into::into),
        subjects: vec![subject.to_string()],
        role: match namespace {
            Some(_) => RoleRef::Role(role.to_string()),
            None => RoleRef::ClusterRole(role.to_string()),
        },
    }
}

fn fixture() -> Fixture {
    let verifier = Arc::new(FakeVerifier {
        principals: hashmap! {
            ALICE_TOKEN => "system:serviceaccount:team-a:alice",
            BOB_TOKEN => "system:serviceaccount:team-b:bob",
        },
        ..Default::default()
    });
    let rbac = FakeRbac {
        bindings: vec![
            bind(Some("team-a"), "alice", "pod-reader"),
            bind(None, "admin", "cluster-admin"),
            bind(Some("team-b"), "bob", "pod-editor"),
        ],
        roles: hashmap! {
            "pod-reader".to_string() => vec![PolicyRule::new([""], ["pods"], ["get", "list", "watch"])],
            "pod-editor".to_string() => vec![PolicyRule::new([""], ["pod"], ["*"])],
            "cluster-admin".to_string() => vec![PolicyRule::new(["*"], ["*"], ["*"])],
        },
    };

    let cluster = Arc::new(FakeCluster::default());
    cluster.insert(pod("team-a", "x", "1", btreemap! { "app".to_string() => "web".to_string() }));
    cluster.insert(pod("team-a", "y", "1", btreemap! { "app".to_string() => "db".to_string() }));
    cluster.insert(pod("team-b", "z", "1", BTreeMap::new()));

    let cache = Arc::new(CredentialCache::default());
    let issuer = Arc::new(FakeIssuer::default());
    let subscriptions = Arc::new(FakeSubscriptions::default());
    let mut registry = prometheus_client::registry::Registry::default();
    let metrics = HttpMetrics::register(&mut registry);
    let (signal, drain) = drain::channel();

    let gateway = Gateway::new(
        Collaborators {
            authn: Authenticator::new(cache.clone(), verifier.clone()),
            authz: Authorizer::new(Arc::new(rbac)),
            client: cluster.clone(),
            subscriptions: subscriptions.clone(),
            issuer: issuer.clone(),
        },
        Login {
            namespace: "default".to_string(),
            user: "admin".to_string(),
            password: "password".to_string(),
        },
        drain,
    )
    .with_metrics(metrics.clone());

    Fixture {
        gateway,
        cache,
        verifier,
        cluster,
        issuer,
        subscriptions,
        metrics,
        registry,
        signal: Some(signal),
    }
}

impl Fixture {
    async fn call(&self, method: Method, uri: &str, token: Option<&str>, body: Value) -> Response<Body> {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let body = match body {
            Value::Null => Bytes::new(),
            body => Bytes::from(serde_json::to_vec(&body).unwrap()),
        };
        let req = req.body(Full::new(body)).unwrap();
        self.gateway.clone().oneshot(req).await.unwrap()
    }

    async fn login(&self) -> String {
        let rsp = self
            .call(
                Method::POST,
                "/user/login",
                None,
                json!({"name": "admin", "password": "password"}),
            )
            .await;
        assert_eq!(rsp.status(), StatusCode::OK);
        let body = read_json(rsp).await;
        body["token"].as_str().expect("token must be set").to_string()
    }
}

async fn read_json(rsp: Response<Body>) -> Value {
    let bytes = rsp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).expect("body must be JSON")
}

async fn next_event(body: &mut Body) -> Option<String> {
    let frame = body.frame().await?.expect("body must not fail");
    let data = frame.into_data().expect("frame must carry data");
    Some(String::from_utf8(data.to_vec()).expect("event must be UTF-8"))
}

fn event_json(event: &str) -> Value {
    let data = event
        .strip_prefix("event:message\ndata:")
        .and_then(|e| e.strip_suffix("\n\n"))
        .expect("event must be framed");
    serde_json::from_str(data).expect("event data must be JSON")
}

// === Login ===

#[tokio::test]
async fn login_rejects_wrong_password() {
    let fx = fixture();
    let rsp = fx
        .call(
            Method::POST,
            "/user/login",
            None,
            json!({"name": "admin", "password": "hunter2"}),
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        read_json(rsp).await,
        json!({"msg": "invalid username or password"})
    );
    assert!(fx.issuer.issued.lock().is_empty(), "no identity may be minted");
}

#[tokio::test]
async fn login_requires_name_and_password() {
    let fx = fixture();
    let rsp = fx
        .call(Method::POST, "/user/login", None, json!({"name": "admin"}))
        .await;
    assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
    assert!(fx.issuer.issued.lock().is_empty());
}

#[tokio::test]
async fn login_token_is_trusted_without_verification() {
    let fx = fixture();
    let token = fx.login().await;
    assert_eq!(*fx.issuer.issued.lock(), vec!["admin".to_string()]);

    let rsp = fx
        .call(Method::GET, "/api/v1/namespaces/team-a/pods", Some(&token), Value::Null)
        .await;
    assert_eq!(rsp.status(), StatusCode::OK);
    assert_eq!(
        fx.verifier.calls.load(Ordering::SeqCst),
        0,
        "a freshly issued credential must not be verified"
    );
}

#[tokio::test]
async fn logout_revokes_and_forgets() {
    let fx = fixture();
    let token = fx.login().await;
    assert!(fx.cache.lookup(fingerprint(&token)).is_some());

    let rsp = fx
        .call(Method::DELETE, "/user/logout/admin", Some(&token), Value::Null)
        .await;
    assert_eq!(rsp.status(), StatusCode::OK);
    assert_eq!(read_json(rsp).await, json!({"msg": "success"}));
    assert_eq!(*fx.issuer.revoked.lock(), vec!["admin".to_string()]);
    assert!(fx.cache.lookup(fingerprint(&token)).is_none());
}

#[tokio::test]
async fn logout_requires_authentication() {
    let fx = fixture();
    let rsp = fx
        .call(Method::DELETE, "/user/logout/admin", None, Value::Null)
        .await;
    assert_eq!(rsp.status(), StatusCode::UNAUTHORIZED);
    assert!(fx.issuer.revoked.lock().is_empty());
}

#[tokio::test]
async fn logout_of_unknown_identity_is_not_found() {
    let fx = fixture();
    let rsp = fx
        .call(Method::DELETE, "/user/logout/nobody", Some(ALICE_TOKEN), Value::Null)
        .await;
    assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
}

// === Pipeline ===

#[tokio::test]
async fn rejects_unauthenticated_requests() {
    let fx = fixture();
    let rsp = fx
        .call(Method::GET, "/api/v1/namespaces/team-a/pods", None, Value::Null)
        .await;
    assert_eq!(rsp.status(), StatusCode::UNAUTHORIZED);

    let rsp = fx
        .call(
            Method::GET,
            "/api/v1/namespaces/team-a/pods",
            Some("not-a-known-token"),
            Value::Null,
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn verifier_failures_are_hidden() {
    let fx = fixture();
    let rsp = fx
        .call(
            Method::GET,
            "/api/v1/namespaces/team-a/pods",
            Some(BROKEN_TOKEN),
            Value::Null,
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(read_json(rsp).await, json!({"msg": "server error"}));
}

#[tokio::test]
async fn alice_may_list_but_not_delete() {
    let fx = fixture();

    let rsp = fx
        .call(
            Method::DELETE,
            "/api/v1/namespaces/team-a/pods/x",
            Some(ALICE_TOKEN),
            Value::Null,
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::FORBIDDEN);
    assert!(fx.cluster.pod("team-a", "x").is_some(), "nothing may be deleted");

    let rsp = fx
        .call(
            Method::GET,
            "/api/v1/namespaces/team-a/pods",
            Some(ALICE_TOKEN),
            Value::Null,
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::OK);
    let list = read_json(rsp).await;
    assert_eq!(list["kind"], "PodList");
    assert_eq!(list["apiVersion"], "v1");
    assert_eq!(list["items"].as_array().map(Vec::len), Some(2));

    // The second request is served from the credential cache.
    assert_eq!(fx.verifier.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn alice_may_not_read_other_namespaces() {
    let fx = fixture();
    let rsp = fx
        .call(
            Method::GET,
            "/api/v1/namespaces/team-b/pods/z",
            Some(ALICE_TOKEN),
            Value::Null,
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::FORBIDDEN);
    assert_eq!(read_json(rsp).await, json!({"msg": "forbidden"}));
}

#[tokio::test]
async fn gets_single_objects() {
    let fx = fixture();
    let rsp = fx
        .call(
            Method::GET,
            "/api/v1/namespaces/team-a/pods/x",
            Some(ALICE_TOKEN),
            Value::Null,
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::OK);
    let obj = read_json(rsp).await;
    assert_eq!(obj["kind"], "Pod");
    assert_eq!(obj["metadata"]["name"], "x");

    let rsp = fx
        .call(
            Method::GET,
            "/api/v1/namespaces/team-a/pods/missing",
            Some(ALICE_TOKEN),
            Value::Null,
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn filters_lists_by_label() {
    let fx = fixture();
    let rsp = fx
        .call(
            Method::GET,
            "/api/v1/namespaces/team-a/pods?labelSelector=app%3Dweb&limit=10",
            Some(ALICE_TOKEN),
            Value::Null,
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::OK);
    let list = read_json(rsp).await;
    let names = list["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["metadata"]["name"].as_str().unwrap().to_string())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["x".to_string()]);
}

#[tokio::test]
async fn rejects_malformed_label_selectors() {
    let fx = fixture();
    let rsp = fx
        .call(
            Method::GET,
            "/api/v1/namespaces/team-a/pods?labelSelector=bad",
            Some(ALICE_TOKEN),
            Value::Null,
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_routes_and_resources() {
    let fx = fixture();

    let rsp = fx.call(Method::GET, "/healthz", None, Value::Null).await;
    assert_eq!(rsp.status(), StatusCode::NOT_FOUND);

    let rsp = fx
        .call(Method::PUT, "/api/v1/namespaces/team-a/pods", None, Value::Null)
        .await;
    assert_eq!(rsp.status(), StatusCode::METHOD_NOT_ALLOWED);

    let admin = fx.login().await;
    let rsp = fx
        .call(
            Method::GET,
            "/apis/example.com/v1/widgets",
            Some(&admin),
            Value::Null,
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn denied_callers_cannot_discover_resources() {
    let fx = fixture();
    for path in [
        "/apis/example.com/v1/widgets",
        "/apis/apps/v1/namespaces/team-a/deployments",
    ] {
        let rsp = fx
            .call(Method::GET, path, Some(ALICE_TOKEN), Value::Null)
            .await;
        assert_eq!(rsp.status(), StatusCode::FORBIDDEN, "{path}");
    }
}

#[tokio::test]
async fn watch_requires_get() {
    let fx = fixture();
    let rsp = fx
        .call(
            Method::POST,
            "/api/v1/namespaces/team-b/pods?watch=true",
            Some(BOB_TOKEN),
            json!({"metadata": {"name": "w"}}),
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
    assert!(fx.cluster.pod("team-b", "w").is_none());
}

// === CRUD ===

#[tokio::test]
async fn creates_objects_of_the_resolved_kind() {
    let fx = fixture();
    let rsp = fx
        .call(
            Method::POST,
            "/api/v1/namespaces/team-b/pods",
            Some(BOB_TOKEN),
            json!({"metadata": {"name": "new"}, "spec": {"containers": []}}),
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::OK);
    assert_eq!(read_json(rsp).await, json!({"msg": "Pod/new created"}));

    let created = fx.cluster.pod("team-b", "new").expect("pod must be created");
    let types = created.types.expect("pod must be typed");
    assert_eq!(types.kind, "Pod");
    assert_eq!(types.api_version, "v1");
    assert_eq!(created.data["spec"], json!({"containers": []}));

    let rsp = fx
        .call(
            Method::POST,
            "/api/v1/namespaces/team-b/pods",
            Some(BOB_TOKEN),
            json!({"metadata": {"name": "new"}}),
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn rejects_mismatched_objects() {
    let fx = fixture();
    for body in [
        json!({"kind": "Service", "metadata": {"name": "new"}}),
        json!({"apiVersion": "apps/v1", "metadata": {"name": "new"}}),
        json!({"metadata": {"name": "new", "namespace": "team-a"}}),
        json!(["not", "an", "object"]),
    ] {
        let rsp = fx
            .call(
                Method::POST,
                "/api/v1/namespaces/team-b/pods",
                Some(BOB_TOKEN),
                body.clone(),
            )
            .await;
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST, "{body}");
    }
    assert!(fx.cluster.pod("team-b", "new").is_none());

    let rsp = fx
        .call(
            Method::PUT,
            "/api/v1/namespaces/team-b/pods/z",
            Some(BOB_TOKEN),
            json!({"metadata": {"name": "other"}}),
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn updates_objects() {
    let fx = fixture();
    let rsp = fx
        .call(
            Method::PUT,
            "/api/v1/namespaces/team-b/pods/z",
            Some(BOB_TOKEN),
            json!({"metadata": {"labels": {"tier": "web"}}}),
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::OK);
    assert_eq!(read_json(rsp).await, json!({"msg": "Pod/z updated"}));

    let updated = fx.cluster.pod("team-b", "z").unwrap();
    assert_eq!(updated.labels().get("tier").map(String::as_str), Some("web"));
}

#[tokio::test]
async fn patches_existing_objects() {
    let fx = fixture();
    let rsp = fx
        .call(
            Method::PATCH,
            "/api/v1/namespaces/team-b/pods/z",
            Some(BOB_TOKEN),
            json!({"metadata": {"labels": {"patched": "true"}}}),
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::OK);
    assert_eq!(read_json(rsp).await, json!({"msg": "Pod/z patched"}));
    let patched = fx.cluster.pod("team-b", "z").unwrap();
    assert_eq!(patched.labels().get("patched").map(String::as_str), Some("true"));

    let rsp = fx
        .call(
            Method::PATCH,
            "/api/v1/namespaces/team-b/pods/missing",
            Some(BOB_TOKEN),
            json!({"metadata": {"labels": {"patched": "true"}}}),
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::NOT_FOUND);

    let rsp = fx
        .call(
            Method::PATCH,
            "/api/v1/namespaces/team-b/pods/z",
            Some(BOB_TOKEN),
            json!("not an object"),
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn deletes_after_fetching() {
    let fx = fixture();
    let rsp = fx
        .call(
            Method::DELETE,
            "/api/v1/namespaces/team-b/pods/z",
            Some(BOB_TOKEN),
            Value::Null,
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::OK);
    assert_eq!(read_json(rsp).await, json!({"msg": "Pod/z deleted"}));
    assert!(fx.cluster.pod("team-b", "z").is_none());

    let gets = fx.cluster.gets.load(Ordering::SeqCst);
    let rsp = fx
        .call(
            Method::DELETE,
            "/api/v1/namespaces/team-b/pods/z",
            Some(BOB_TOKEN),
            Value::Null,
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
    assert_eq!(fx.cluster.gets.load(Ordering::SeqCst), gets + 1);
}

#[tokio::test]
async fn role_bindings_do_not_reach_other_namespaces() {
    let fx = fixture();
    let rsp = fx
        .call(
            Method::DELETE,
            "/api/v1/namespaces/team-a/pods/x",
            Some(BOB_TOKEN),
            Value::Null,
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::FORBIDDEN);
    assert!(fx.cluster.pod("team-a", "x").is_some());

    // Cluster-wide paths are out of reach of namespaced bindings too.
    let rsp = fx
        .call(Method::GET, "/api/v1/pods", Some(BOB_TOKEN), Value::Null)
        .await;
    assert_eq!(rsp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn rejects_oversized_bodies() {
    let fx = fixture();
    let req = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/namespaces/team-b/pods")
        .header(header::AUTHORIZATION, format!("Bearer {BOB_TOKEN}"))
        .body(Full::new(Bytes::from(vec![b' '; MAX_BODY_BYTES + 1])))
        .unwrap();
    let rsp = fx.gateway.clone().oneshot(req).await.unwrap();
    assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        read_json(rsp).await,
        json!({"msg": "bad request: request body too large"})
    );
    assert_eq!(fx.verifier.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn records_request_metrics() {
    let fx = fixture();
    fx.call(Method::GET, "/healthz", None, Value::Null).await;
    fx.call(
        Method::GET,
        "/api/v1/namespaces/team-a/pods",
        Some(ALICE_TOKEN),
        Value::Null,
    )
    .await;
    fx.call(
        Method::DELETE,
        "/api/v1/namespaces/team-a/pods/x",
        Some(ALICE_TOKEN),
        Value::Null,
    )
    .await;

    let mut metrics = String::new();
    prometheus_client::encoding::text::encode(&mut metrics, &fx.registry).unwrap();
    for line in [
        r#"requests_total{verb="unknown",status="404"} 1"#,
        r#"requests_total{verb="list",status="200"} 1"#,
        r#"requests_total{verb="delete",status="403"} 1"#,
        "watch_streams 0",
    ] {
        assert!(metrics.contains(line), "missing {line:?} in:\n{metrics}");
    }
}

// === Watch ===

#[tokio::test(start_paused = true)]
async fn watch_delivers_initial_state() {
    let fx = fixture();
    let rsp = fx
        .call(
            Method::GET,
            "/api/v1/namespaces/team-a/pods/x?watch=true",
            Some(ALICE_TOKEN),
            Value::Null,
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::OK);
    assert_eq!(rsp.headers()[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(rsp.headers()[header::CACHE_CONTROL], "no-cache");
    assert_eq!(rsp.headers()[header::CONNECTION], "keep-alive");
    assert_eq!(fx.subscriptions.count(), 1);
    assert_eq!(fx.metrics.open_streams(), 1);

    // The informer replays existing state; only the watched object counts.
    let z = fx.cluster.pod("team-b", "z").unwrap();
    let x = fx.cluster.pod("team-a", "x").unwrap();
    fx.subscriptions.notify(Notification::Add {
        object: z,
        initial: true,
    });
    fx.subscriptions.notify(Notification::Add {
        object: x,
        initial: true,
    });

    let mut body = rsp.into_body();
    let event = next_event(&mut body).await.expect("stream must emit");
    let obj = event_json(&event);
    assert_eq!(obj["metadata"]["name"], "x");
    assert_eq!(fx.metrics.events_sent(), 1);
}

#[tokio::test(start_paused = true)]
async fn watch_coalesces_rapid_changes() {
    let fx = fixture();
    let rsp = fx
        .call(
            Method::GET,
            "/api/v1/namespaces/team-a/pods/x?watch=true",
            Some(ALICE_TOKEN),
            Value::Null,
        )
        .await;
    let mut body = rsp.into_body();
    let x = fx.cluster.pod("team-a", "x").unwrap();
    fx.subscriptions.notify(Notification::Add {
        object: x.clone(),
        initial: true,
    });
    next_event(&mut body).await.expect("initial event");

    let mut old = x;
    for version in 2..=6 {
        let mut new = old.clone();
        new.metadata.resource_version = Some(version.to_string());
        fx.cluster.insert(new.clone());
        fx.subscriptions.notify(Notification::Update {
            old,
            new: new.clone(),
        });
        old = new;
    }

    let event = next_event(&mut body).await.expect("stream must emit");
    assert_eq!(event_json(&event)["metadata"]["resourceVersion"], "6");

    let next = time::timeout(Duration::from_millis(100), next_event(&mut body)).await;
    assert!(next.is_err(), "changes must collapse into a single event");
}

#[tokio::test(start_paused = true)]
async fn watch_ignores_unchanged_updates() {
    let fx = fixture();
    let rsp = fx
        .call(
            Method::GET,
            "/api/v1/namespaces/team-a/pods?watch=true",
            Some(ALICE_TOKEN),
            Value::Null,
        )
        .await;
    let mut body = rsp.into_body();
    let x = fx.cluster.pod("team-a", "x").unwrap();
    fx.subscriptions.notify(Notification::Add {
        object: x.clone(),
        initial: true,
    });
    let list = event_json(&next_event(&mut body).await.expect("initial event"));
    assert_eq!(list["kind"], "PodList");
    assert_eq!(list["items"].as_array().map(Vec::len), Some(2));

    fx.subscriptions.notify(Notification::Update {
        old: x.clone(),
        new: x,
    });
    let next = time::timeout(Duration::from_secs(5), next_event(&mut body)).await;
    assert!(next.is_err(), "no-op updates must not wake the stream");
}

#[tokio::test(start_paused = true)]
async fn watch_ends_after_delete() {
    let fx = fixture();
    let rsp = fx
        .call(
            Method::GET,
            "/api/v1/namespaces/team-a/pods/x?watch=true",
            Some(ALICE_TOKEN),
            Value::Null,
        )
        .await;
    let mut body = rsp.into_body();

    let x = fx.cluster.remove("team-a", "x").unwrap();
    fx.subscriptions.notify(Notification::Delete { object: x });

    let event = next_event(&mut body).await.expect("stream must emit");
    assert_eq!(event, "event:message\ndata:\n\n");
    assert!(next_event(&mut body).await.is_none(), "stream must end");

    drop(body);
    time::sleep(Duration::from_millis(1)).await;
    assert_eq!(*fx.subscriptions.deregistered.lock(), vec![SubscriptionId(1)]);
    assert_eq!(fx.metrics.open_streams(), 0);
}

#[tokio::test(start_paused = true)]
async fn dropped_watch_deregisters() {
    let fx = fixture();
    let rsp = fx
        .call(
            Method::GET,
            "/api/v1/namespaces/team-a/pods?watch=true",
            Some(ALICE_TOKEN),
            Value::Null,
        )
        .await;
    assert_eq!(fx.subscriptions.count(), 1);

    drop(rsp);
    time::sleep(Duration::from_millis(1)).await;
    assert_eq!(fx.subscriptions.count(), 0);
    assert_eq!(fx.subscriptions.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(fx.metrics.open_streams(), 0);
}

#[tokio::test(start_paused = true)]
async fn watch_ends_on_shutdown() {
    let mut fx = fixture();
    let rsp = fx
        .call(
            Method::GET,
            "/api/v1/namespaces/team-a/pods?watch=true",
            Some(ALICE_TOKEN),
            Value::Null,
        )
        .await;
    let mut body = rsp.into_body();

    let signal = fx.signal.take().unwrap();
    tokio::spawn(signal.drain());
    assert!(next_event(&mut body).await.is_none(), "stream must end");
}

#[tokio::test]
async fn watch_is_authorized_as_watch() {
    let fx = fixture();
    let rsp = fx
        .call(
            Method::GET,
            "/api/v1/namespaces/team-a/pods?watch=true",
            Some(BOB_TOKEN),
            Value::Null,
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::FORBIDDEN);
    assert_eq!(fx.subscriptions.count(), 0);
}

// === Deregistration ===

#[tokio::test(start_paused = true)]
async fn deregistration_retries_failures() {
    let subscriptions = Arc::new(FakeSubscriptions::default());
    let id = subscriptions
        .subscribe(
            &ResourceDescriptor {
                group: String::new(),
                version: "v1".to_string(),
                kind: "Pod".to_string(),
                resource: "pods".to_string(),
                namespace: None,
                name: None,
            },
            Arc::new(kube_gateway_core::watch::SubscriptionHandler::new(
                Default::default(),
                Default::default(),
            )),
        )
        .await
        .unwrap();
    subscriptions.failures.store(2, Ordering::SeqCst);

    watch::deregister(subscriptions.clone(), id, DeregisterBackoff::default()).await;
    assert_eq!(subscriptions.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(*subscriptions.deregistered.lock(), vec![id]);
}

#[tokio::test(start_paused = true)]
async fn deregistration_gives_up() {
    let subscriptions = Arc::new(FakeSubscriptions::default());
    subscriptions.failures.store(usize::MAX, Ordering::SeqCst);

    let backoff = DeregisterBackoff::default();
    let start = time::Instant::now();
    watch::deregister(subscriptions.clone(), SubscriptionId(1), backoff).await;
    assert_eq!(
        subscriptions.attempts.load(Ordering::SeqCst),
        backoff.max_attempts
    );
    assert!(start.elapsed() <= Duration::from_secs(60));
    assert!(subscriptions.deregistered.lock().is_empty());
}

#[test]
fn identities_are_namespaced() {
    let identity = Identity {
        name: "alice".to_string(),
        namespace: "team-a".to_string(),
    };
    assert_eq!(identity.to_string(), "team-a/alice");
}
