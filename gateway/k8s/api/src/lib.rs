#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;
mod watch;

pub use self::{
    labels::Selector,
    watch::{Event, Watch},
};
pub use k8s_openapi::{
    api::{
        authentication::v1::{
            TokenRequest, TokenRequestSpec, TokenReview, TokenReviewSpec, UserInfo,
        },
        core::v1::ServiceAccount,
        rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, Subject},
    },
    apimachinery::pkg::apis::meta::v1::ListMeta,
};
pub use kube::{
    api::{
        Api, DeleteParams, ListParams, ObjectList, ObjectMeta, Patch, PatchParams, PostParams,
        ResourceExt,
    },
    core::{ApiResource, DynamicObject, ErrorResponse, GroupVersionKind, TypeMeta},
    runtime::watcher,
    Client, Error, Resource,
};
