//! Server-generated identifiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;

/// Fencing token regenerated every time a job is enqueued.
///
/// A queue delivery whose embedded token differs from the record's current
/// token is stale.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerJobId(Uuid);

impl ServerJobId {
    /// Create a new token.
    ///
    /// Uses UUIDv7 (time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ServerJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for ServerJobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for ServerJobId {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s)
            .map_err(|e| JobError::invalid_envelope(format!("ServerJobId: {e}")))?;
        Ok(Self(uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique_and_parse_back() {
        let a = ServerJobId::new();
        let b = ServerJobId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().parse::<ServerJobId>().unwrap(), a);
    }

    #[test]
    fn malformed_token_is_rejected() {
        assert!("not-a-uuid".parse::<ServerJobId>().is_err());
    }
}
