#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use kube_gateway_core as core;
pub use kube_gateway_http as http;
pub use kube_gateway_k8s_api as k8s;
pub use kube_gateway_k8s_index as index;

mod args;
mod cluster;
mod identity;
mod server;

pub use self::{
    args::Args,
    cluster::KubeCluster,
    identity::{ServiceAccountIssuer, TokenReviewer},
};
