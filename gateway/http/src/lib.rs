//! The gateway's HTTP surface.
//!
//! Every request flows through the same pipeline: the path is routed, the
//! caller is authenticated, the path is authorized and its resource resolved,
//! and the request is then executed against the cluster or turned into a watch
//! stream. The login route is public; the logout route is authenticated but
//! not authorized.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod login;
pub mod metrics;
mod resource;
mod routes;
mod watch;

#[cfg(test)]
mod tests;

pub use self::{login::Login, metrics::HttpMetrics};
use self::{
    routes::{Query, Route, RouteError},
    watch::WatchStream,
};
use bytes::Bytes;
use futures::future;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::{header, Method, Request, Response, StatusCode};
use kube_gateway_core::{
    watch::Subscribe, Authenticator, Authorizer, ClusterClient, Decision, Error, IssueCredential,
    Locator, Result, Verb,
};
use std::{convert::Infallible, sync::Arc};
use tokio::time::Duration;
use tracing::{debug, info, trace, warn};

/// The body of every gateway response.
pub type Body = http_body_util::combinators::UnsyncBoxBody<Bytes, Infallible>;

/// Default idle wait between wake-signal checks on a watch stream.
pub const DEFAULT_WATCH_IDLE: Duration = Duration::from_secs(1);

/// The largest request body the gateway reads.
pub const MAX_BODY_BYTES: usize = 3 * 1024 * 1024;

#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

/// The collaborators that back the gateway.
pub struct Collaborators {
    pub authn: Authenticator,
    pub authz: Authorizer,
    pub client: Arc<dyn ClusterClient>,
    pub subscriptions: Arc<dyn Subscribe>,
    pub issuer: Arc<dyn IssueCredential>,
}

struct Inner {
    authn: Authenticator,
    authz: Authorizer,
    locator: Locator,
    client: Arc<dyn ClusterClient>,
    subscriptions: Arc<dyn Subscribe>,
    issuer: Arc<dyn IssueCredential>,
    login: Login,
    watch_idle: Duration,
    metrics: HttpMetrics,
    drain: drain::Watch,
}

// === impl Gateway ===

impl Gateway {
    pub fn new(collaborators: Collaborators, login: Login, drain: drain::Watch) -> Self {
        let Collaborators {
            authn,
            authz,
            client,
            subscriptions,
            issuer,
        } = collaborators;
        Self {
            inner: Arc::new(Inner {
                authn,
                authz,
                locator: Locator::new(client.clone()),
                client,
                subscriptions,
                issuer,
                login,
                watch_idle: DEFAULT_WATCH_IDLE,
                metrics: HttpMetrics::default(),
                drain,
            }),
        }
    }

    pub fn with_watch_idle(mut self, idle: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.watch_idle = idle;
        }
        self
    }

    pub fn with_metrics(mut self, metrics: HttpMetrics) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.metrics = metrics;
        }
        self
    }

    async fn handle(
        self,
        method: Method,
        uri: http::Uri,
        auth: String,
        body: Bytes,
    ) -> Response<Body> {
        let route = match Route::parse(&method, uri.path()) {
            Ok(route) => route,
            Err(error) => {
                debug!(%method, path = %uri.path(), ?error, "No route");
                let status = match error {
                    RouteError::NotFound => StatusCode::NOT_FOUND,
                    RouteError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
                };
                let rsp = message(status, status.canonical_reason().unwrap_or_default());
                self.inner.metrics.request("unknown", rsp.status());
                return rsp;
            }
        };

        let (verb, result) = match route {
            Route::Login => ("login", self.login(&body).await),
            Route::Logout { name } => ("logout", self.logout(&auth, &name).await),
            Route::Resource(path) => {
                let query = match Query::parse(uri.query()) {
                    Ok(query) => query,
                    Err(error) => return self.respond("unknown", Err(error)),
                };
                let Some(verb) = Verb::from_request(&method, path.name.is_some(), query.is_watch())
                else {
                    let error = Error::BadRequest(format!("unsupported method {method}"));
                    return self.respond("unknown", Err(error));
                };
                (
                    verb.as_str(),
                    self.resource(&method, verb, path, query, &auth, body).await,
                )
            }
        };
        self.respond(verb, result)
    }

    fn respond(&self, verb: &'static str, result: Result<Response<Body>>) -> Response<Body> {
        let rsp = result.unwrap_or_else(|error| error_response(&error));
        self.inner.metrics.request(verb, rsp.status());
        rsp
    }

    /// Authenticates, resolves, and authorizes a resource request before
    /// executing it.
    async fn resource(
        &self,
        method: &Method,
        verb: Verb,
        path: kube_gateway_core::ResourcePath,
        query: Query,
        auth: &str,
        body: Bytes,
    ) -> Result<Response<Body>> {
        if query.is_watch() && method != Method::GET {
            return Err(Error::BadRequest(format!(
                "watch is not supported for {method} requests"
            )));
        }

        // Authorize against the requested path before discovery so that a
        // denied caller cannot learn which resources exist.
        let identity = self.inner.authn.authenticate(auth).await?;
        if self.inner.authz.authorize(&identity, &path, verb).await? == Decision::Deny {
            info!(%identity, %verb, resource = %path.resource, "Forbidden");
            return Err(Error::Forbidden);
        }
        let resource = self.inner.locator.descriptor(path).await?;
        debug!(%identity, %verb, resource = %resource.reference(), "Authorized");

        let client = &*self.inner.client;
        match verb {
            Verb::Watch => {
                WatchStream {
                    client: self.inner.client.clone(),
                    subscriptions: self.inner.subscriptions.clone(),
                    options: query.list_options()?,
                    resource,
                    idle: self.inner.watch_idle,
                    metrics: self.inner.metrics.clone(),
                    drain: self.inner.drain.clone(),
                }
                .start()
                .await
            }
            Verb::Get => json(StatusCode::OK, &client.get(&resource).await?),
            Verb::List => {
                let options = query.list_options()?;
                json(StatusCode::OK, &client.list(&resource, &options).await?)
            }
            Verb::Create => resource::create(client, resource, &body).await,
            Verb::Update => resource::update(client, resource, &body).await,
            Verb::Patch => resource::patch(client, resource, &body).await,
            Verb::Delete => resource::delete(client, resource).await,
        }
    }
}

impl<B> tower::Service<Request<B>> for Gateway
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Infallible>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        trace!(method = %req.method(), uri = %req.uri());
        let gateway = self.clone();
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let auth = parts
                .headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
                Ok(body) => body.to_bytes(),
                Err(error) if error.is::<LengthLimitError>() => {
                    debug!(limit = MAX_BODY_BYTES, "Request body too large");
                    return Ok(error_response(&Error::BadRequest(
                        "request body too large".to_string(),
                    )));
                }
                Err(error) => {
                    warn!(%error, "Failed to read request body");
                    return Ok(error_response(&Error::BadRequest(
                        "failed to read request body".to_string(),
                    )));
                }
            };
            Ok(gateway.handle(parts.method, parts.uri, auth, body).await)
        })
    }
}

/// Maps an error onto its response. Server errors are logged and never
/// described to the client.
fn error_response(error: &Error) -> Response<Body> {
    let status = match error {
        Error::BadRequest(_) => StatusCode::BAD_REQUEST,
        Error::Unauthenticated => StatusCode::UNAUTHORIZED,
        Error::Forbidden => StatusCode::FORBIDDEN,
        Error::NotFound(_) | Error::UnknownResource(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Server(error) => {
            warn!(error = %format_args!("{error:#}"), "Request failed");
            return message(StatusCode::INTERNAL_SERVER_ERROR, "server error");
        }
    };
    debug!(%error, %status);
    message(status, &error.to_string())
}

fn message(status: StatusCode, msg: &str) -> Response<Body> {
    json(status, &serde_json::json!({ "msg": msg }))
        .unwrap_or_else(|_| Response::new(Full::default().boxed_unsync()))
}

fn json<T: serde::Serialize>(status: StatusCode, value: &T) -> Result<Response<Body>> {
    let body = serde_json::to_vec(value).map_err(|error| Error::Server(error.into()))?;
    Ok(Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).boxed_unsync())
        .expect("json response must be valid"))
}
