use crate::{json, message, Body, Gateway};
use hyper::{Response, StatusCode};
use kube_gateway_core::{Error, Identity, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// The accepted login credentials and the namespace in which login mints
/// service identities.
#[derive(Clone, Debug)]
pub struct Login {
    pub namespace: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    name: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    token: String,
}

impl Gateway {
    /// Mints a credential for the configured user.
    ///
    /// Rejected logins have no side effects. The minted credential is cached
    /// so that it is trusted without verification for the freshness window.
    pub(crate) async fn login(&self, body: &[u8]) -> Result<Response<Body>> {
        let LoginRequest { name, password } = serde_json::from_slice(body)
            .map_err(|error| Error::BadRequest(format!("invalid login request: {error}")))?;

        let login = &self.inner.login;
        if name != login.user || password != login.password {
            info!(%name, "Rejected login");
            return Ok(message(StatusCode::FORBIDDEN, "invalid username or password"));
        }

        let token = self.inner.issuer.issue(&name).await?;
        let identity = Identity {
            name,
            namespace: login.namespace.clone(),
        };
        info!(%identity, "Logged in");
        self.inner.authn.remember(&token, identity);
        json(StatusCode::OK, &LoginResponse { token })
    }

    /// Revokes the named identity and forgets the caller's credential.
    pub(crate) async fn logout(&self, auth: &str, name: &str) -> Result<Response<Body>> {
        let identity = self.inner.authn.authenticate(auth).await?;
        self.inner.issuer.revoke(name).await?;
        let forgotten = self.inner.authn.forget(auth);
        info!(%identity, %name, forgotten, "Logged out");
        Ok(message(StatusCode::OK, "success"))
    }
}
