//! Watch-fed cluster state.
//!
//! - The RBAC [`rbac::Index`] holds every RoleBinding, ClusterRoleBinding,
//!   Role, and ClusterRole, with bindings indexed by subject name so that the
//!   authorizer never has to list bindings against the API server.
//! - The [`informer::Informers`] registry holds one shared informer per
//!   watched kind. Watch streams register handlers with the informer of their
//!   kind instead of each opening a watch against the API server.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod informer;
pub mod rbac;

pub use self::{
    informer::Informers,
    rbac::{RbacIndex, SharedIndex},
};
