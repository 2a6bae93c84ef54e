use crate::{
    cluster::api_error,
    core::{
        authn::{Verification, VerifyCredential},
        Error, IssueCredential, Result,
    },
    k8s::{
        self, Api, DeleteParams, ObjectMeta, PostParams, ServiceAccount, TokenRequest,
        TokenRequestSpec, TokenReview, TokenReviewSpec,
    },
};
use anyhow::Context;
use tracing::{debug, info};

/// Verifies credentials with the cluster's `TokenReview` API.
pub struct TokenReviewer {
    api: Api<TokenReview>,
}

/// Mints login credentials as tokens of a dedicated ServiceAccount per user.
pub struct ServiceAccountIssuer {
    accounts: Api<ServiceAccount>,
    namespace: String,
    expiration_secs: i64,
}

// === impl TokenReviewer ===

impl TokenReviewer {
    pub fn new(client: k8s::Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait::async_trait]
impl VerifyCredential for TokenReviewer {
    async fn verify(&self, credential: &str) -> anyhow::Result<Verification> {
        let review = TokenReview {
            metadata: ObjectMeta::default(),
            spec: TokenReviewSpec {
                token: Some(credential.to_string()),
                ..Default::default()
            },
            status: None,
        };
        let review = self
            .api
            .create(&PostParams::default(), &review)
            .await
            .context("failed to create TokenReview")?;

        let status = review.status.unwrap_or_default();
        Ok(Verification {
            authenticated: status.authenticated.unwrap_or(false),
            principal: status
                .user
                .and_then(|user| user.username)
                .unwrap_or_default(),
        })
    }
}

// === impl ServiceAccountIssuer ===

impl ServiceAccountIssuer {
    pub fn new(client: k8s::Client, namespace: String, expiration_secs: i64) -> Self {
        Self {
            accounts: Api::namespaced(client, &namespace),
            namespace,
            expiration_secs,
        }
    }

    fn reference(name: &str) -> String {
        format!("ServiceAccount/{name}")
    }
}

#[async_trait::async_trait]
impl IssueCredential for ServiceAccountIssuer {
    /// Replaces any existing ServiceAccount for `name` so that previously
    /// minted tokens stop working, then requests a token for the new one.
    async fn issue(&self, name: &str) -> Result<String> {
        match self.accounts.delete(name, &DeleteParams::default()).await {
            Ok(_) => debug!(ns = %self.namespace, %name, "Deleted prior ServiceAccount"),
            Err(error) => match api_error(error, Self::reference(name)) {
                Error::NotFound(_) => {}
                error => return Err(error),
            },
        }

        let account = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        self.accounts
            .create(&PostParams::default(), &account)
            .await
            .map_err(|error| api_error(error, Self::reference(name)))?;

        let request = TokenRequest {
            metadata: ObjectMeta::default(),
            spec: TokenRequestSpec {
                expiration_seconds: Some(self.expiration_secs),
                ..Default::default()
            },
            status: None,
        };
        let issued = self
            .accounts
            .create_token_request(name, &PostParams::default(), &request)
            .await
            .map_err(|error| api_error(error, Self::reference(name)))?;

        let token = issued
            .status
            .map(|status| status.token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| Error::Server(anyhow::anyhow!("no token issued for {name}")))?;
        info!(ns = %self.namespace, %name, "Issued token");
        Ok(token)
    }

    async fn revoke(&self, name: &str) -> Result<()> {
        self.accounts
            .get(name)
            .await
            .map_err(|error| api_error(error, Self::reference(name)))?;
        self.accounts
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|error| api_error(error, Self::reference(name)))?;
        info!(ns = %self.namespace, %name, "Revoked ServiceAccount");
        Ok(())
    }
}
