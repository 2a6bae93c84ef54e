//! Kubernetes API gateway core
//!
//! The gateway re-exposes the cluster's resource model over a simplified REST
//! surface. Every request is authenticated against a short-lived credential
//! cache, authorized in-process against the cluster's RBAC bindings, and then
//! either executed against the cluster or handed to a watch subscription:
//!
//! ```text
//! [ credential ] -> [ Authenticator ] -> [ Authorizer ] -> [ cluster client ]
//!                          |                   |                 ^
//!                  [ CredentialCache ]   [ RbacSource ]          |
//!                                                         [ watch handler ] <- [ Subscribe ]
//! ```
//!
//! This crate holds the domain types and the algorithms; the collaborators
//! (identity verification, cluster access, RBAC state, notification sources)
//! are modeled as traits so that they may be backed by Kubernetes or faked in
//! tests.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod authn;
pub mod authz;
mod error;
pub mod locator;
pub mod watch;

pub use self::{
    authn::{Authenticator, CredentialCache, Identity},
    authz::{Authorizer, Decision, PolicyRule, Verb},
    error::{Error, Result},
    locator::{
        ClusterClient, GenericList, ListOptions, Locator, ResourceDescriptor, ResourcePath,
    },
};
pub use kube_gateway_k8s_api::{DynamicObject, Selector};

/// Issues and revokes the short-lived service identities handed out by login.
#[async_trait::async_trait]
pub trait IssueCredential: Send + Sync {
    /// Mints a fresh credential for `name`, replacing any prior identity.
    async fn issue(&self, name: &str) -> Result<String>;

    /// Revokes the identity minted for `name`.
    async fn revoke(&self, name: &str) -> Result<()>;
}
