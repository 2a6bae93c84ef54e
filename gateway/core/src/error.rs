use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures surfaced to gateway clients.
#[derive(Debug, Error)]
pub enum Error {
    /// The request's path, query, or body is malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The request carries no credential or an invalid one.
    #[error("unauthenticated")]
    Unauthenticated,

    /// The caller is authenticated but no rule grants the request.
    #[error("forbidden")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(String),

    /// The group/version/resource does not map to a known kind.
    #[error("unknown resource: {0}")]
    UnknownResource(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid: {0}")]
    Invalid(String),

    /// Any unexpected failure in a collaborator or in internal bookkeeping.
    #[error("server error: {0:#}")]
    Server(#[source] anyhow::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<anyhow::Error> for Error {
    fn from(error: anyhow::Error) -> Self {
        Self::Server(error)
    }
}
