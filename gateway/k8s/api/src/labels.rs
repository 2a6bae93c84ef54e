use std::collections::BTreeMap;
use thiserror::Error;

/// An equality-only label selector, as accepted by the `labelSelector` query
/// parameter.
///
/// An empty selector matches every object.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Selector(BTreeMap<String, String>);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid label selector term: {0:?}")]
pub struct InvalidSelector(String);

// === Selector ===

impl Selector {
    /// Parses a comma-separated list of `key=value` terms.
    ///
    /// Each term must split into exactly two tokens on `=`.
    pub fn parse(s: &str) -> Result<Self, InvalidSelector> {
        if s.is_empty() {
            return Ok(Self::default());
        }

        let mut terms = BTreeMap::new();
        for term in s.split(',') {
            let mut tokens = term.split('=');
            match (tokens.next(), tokens.next(), tokens.next()) {
                (Some(key), Some(value), None) => {
                    terms.insert(key.to_string(), value.to_string());
                }
                _ => return Err(InvalidSelector(term.to_string())),
            }
        }
        Ok(Self(terms))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}
