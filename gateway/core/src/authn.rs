use crate::{Error, Result};
use ahash::AHashMap as HashMap;
use anyhow::Context;
use parking_lot::RwLock;
use std::{str::FromStr, sync::Arc};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};


/// How long a verified credential is trusted before it is verified again.
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(5);

/// Number of leading credential characters used as the cache key.
pub const FINGERPRINT_LEN: usize = 32;

const BEARER_PREFIX: &str = "Bearer ";

/// The principal a request is made on behalf of.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity {
    pub name: String,
    pub namespace: String,
}

/// The result of verifying a raw credential with the cluster's identity
/// provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verification {
    pub authenticated: bool,

    /// A principal of the form `scheme:kind:namespace:name`.
    pub principal: String,
}

/// Models the cluster's identity-verification capability.
#[async_trait::async_trait]
pub trait VerifyCredential: Send + Sync {
    async fn verify(&self, credential: &str) -> anyhow::Result<Verification>;
}

#[derive(Clone, Debug)]
struct CachedCredential {
    identity: Identity,
    last_verified_at: Instant,
}

/// Maps credential fingerprints to the identities they were last verified as.
///
/// Entries are only removed by explicit invalidation.
#[derive(Debug)]
pub struct CredentialCache {
    freshness: Duration,
    entries: RwLock<HashMap<String, CachedCredential>>,
}

/// Validates inbound credentials, consulting the cache before the verifier.
#[derive(Clone)]
pub struct Authenticator {
    cache: Arc<CredentialCache>,
    verifier: Arc<dyn VerifyCredential>,
}

/// Strips the bearer scheme marker from an `Authorization` header value.
pub fn bearer_token(header: &str) -> &str {
    header.strip_prefix(BEARER_PREFIX).unwrap_or(header).trim()
}

/// Returns the leading `FINGERPRINT_LEN` characters of a credential.
pub fn fingerprint(credential: &str) -> &str {
    match credential.char_indices().nth(FINGERPRINT_LEN) {
        Some((idx, _)) => &credential[..idx],
        None => credential,
    }
}

// === impl Identity ===

impl FromStr for Identity {
    type Err = Error;

    /// Parses a `scheme:kind:namespace:name` principal.
    fn from_str(principal: &str) -> Result<Self> {
        let mut parts = principal.splitn(4, ':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(_), Some(_), Some(namespace), Some(name))
                if !namespace.is_empty() && !name.is_empty() =>
            {
                Ok(Self {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                })
            }
            _ => Err(Error::Unauthenticated),
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl CredentialCache ===

impl Default for CredentialCache {
    fn default() -> Self {
        Self::new(FRESHNESS_WINDOW)
    }
}

impl CredentialCache {
    pub fn new(freshness: Duration) -> Self {
        Self {
            freshness,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the cached identity and whether it is still fresh.
    pub fn lookup(&self, fingerprint: &str) -> Option<(Identity, bool)> {
        let entries = self.entries.read();
        let entry = entries.get(fingerprint)?;
        let fresh = entry.last_verified_at.elapsed() < self.freshness;
        Some((entry.identity.clone(), fresh))
    }

    pub fn store(&self, fingerprint: &str, identity: Identity) {
        let now = Instant::now();
        let mut entries = self.entries.write();
        match entries.get_mut(fingerprint) {
            Some(entry) => {
                entry.identity = identity;
                entry.last_verified_at = entry.last_verified_at.max(now);
            }
            None => {
                entries.insert(
                    fingerprint.to_string(),
                    CachedCredential {
                        identity,
                        last_verified_at: now,
                    },
                );
            }
        }
    }

    pub fn invalidate(&self, fingerprint: &str) -> bool {
        self.entries.write().remove(fingerprint).is_some()
    }

    #[cfg(test)]
    fn get(&self, fingerprint: &str) -> Option<CachedCredential> {
        self.entries.read().get(fingerprint).cloned()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

// === impl Authenticator ===

impl Authenticator {
    pub fn new(cache: Arc<CredentialCache>, verifier: Arc<dyn VerifyCredential>) -> Self {
        Self { cache, verifier }
    }

    #[cfg(test)]
    fn cache(&self) -> &Arc<CredentialCache> {
        &self.cache
    }

    /// Resolves the identity of an `Authorization` header value.
    ///
    /// A fresh cache hit never reaches the verifier. Failed verifications are
    /// not cached.
    pub async fn authenticate(&self, header: &str) -> Result<Identity> {
        let credential = bearer_token(header);
        if credential.is_empty() {
            return Err(Error::Unauthenticated);
        }

        let fp = fingerprint(credential);
        if let Some((identity, true)) = self.cache.lookup(fp) {
            debug!(%identity, "Credential cache hit");
            return Ok(identity);
        }

        let Verification {
            authenticated,
            principal,
        } = self
            .verifier
            .verify(credential)
            .await
            .context("failed to verify credential")?;
        if !authenticated {
            info!("Credential rejected");
            return Err(Error::Unauthenticated);
        }

        let identity = principal.parse::<Identity>().map_err(|error| {
            warn!(%principal, "Malformed principal");
            error
        })?;
        debug!(%identity, "Credential verified");
        self.cache.store(fp, identity.clone());
        Ok(identity)
    }

    /// Seeds the cache with a credential that was just issued.
    pub fn remember(&self, credential: &str, identity: Identity) {
        self.cache.store(fingerprint(credential), identity);
    }

    /// Drops the cached identity of an `Authorization` header value.
    pub fn forget(&self, header: &str) -> bool {
        self.cache.invalidate(fingerprint(bearer_token(header)))
    }
}
