use http::Method;
use kube_gateway_core::{Error, ListOptions, ResourcePath, Result};
use serde::Deserialize;

/// A request path matched against the gateway's routing table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Route {
    Login,
    Logout { name: String },
    Resource(ResourcePath),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum RouteError {
    NotFound,
    MethodNotAllowed,
}

/// Query parameters understood by resource routes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Query {
    watch: Option<String>,
    limit: Option<String>,
    label_selector: Option<String>,
}

// === impl Route ===

impl Route {
    pub(crate) fn parse(method: &Method, path: &str) -> Result<Self, RouteError> {
        let path = path.strip_prefix('/').ok_or(RouteError::NotFound)?;
        let path = path.strip_suffix('/').unwrap_or(path);
        let segments = path.split('/').collect::<Vec<_>>();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(RouteError::NotFound);
        }

        match segments.as_slice() {
            ["user", "login"] => {
                allow(method, &[Method::POST])?;
                Ok(Self::Login)
            }
            ["user", "logout", name] => {
                allow(method, &[Method::DELETE])?;
                Ok(Self::Logout {
                    name: name.to_string(),
                })
            }
            ["api", version, rest @ ..] => Self::resource(method, "", version, rest),
            ["apis", group, version, rest @ ..] => Self::resource(method, group, version, rest),
            _ => Err(RouteError::NotFound),
        }
    }

    fn resource(
        method: &Method,
        group: &str,
        version: &str,
        rest: &[&str],
    ) -> Result<Self, RouteError> {
        let (namespace, resource, name) = match rest {
            [resource] => (None, *resource, None),
            [resource, name] => (None, *resource, Some(*name)),
            ["namespaces", ns, resource] => (Some(*ns), *resource, None),
            ["namespaces", ns, resource, name] => (Some(*ns), *resource, Some(*name)),
            _ => return Err(RouteError::NotFound),
        };

        if name.is_some() {
            allow(
                method,
                &[Method::GET, Method::PUT, Method::PATCH, Method::DELETE],
            )?;
        } else {
            allow(method, &[Method::GET, Method::POST])?;
        }

        Ok(Self::Resource(ResourcePath {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
            namespace: namespace.map(Into::into),
            name: name.map(Into::into),
        }))
    }
}

fn allow(method: &Method, allowed: &[Method]) -> Result<(), RouteError> {
    if allowed.contains(method) {
        Ok(())
    } else {
        Err(RouteError::MethodNotAllowed)
    }
}

// === impl Query ===

impl Query {
    pub(crate) fn parse(query: Option<&str>) -> Result<Self> {
        match query {
            None | Some("") => Ok(Self::default()),
            Some(query) => serde_urlencoded::from_str(query)
                .map_err(|error| Error::BadRequest(format!("invalid query: {error}"))),
        }
    }

    pub(crate) fn is_watch(&self) -> bool {
        self.watch.as_deref() == Some("true")
    }

    pub(crate) fn list_options(&self) -> Result<ListOptions> {
        ListOptions::parse(self.limit.as_deref(), self.label_selector.as_deref())
    }
}
