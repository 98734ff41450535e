//! Shared-secret gate in front of the recovery sweep.

use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use super::recovery::RecoverySweep;
use super::types::RecoveryReport;
use crate::errors::{RelayError, Result};

/// Authenticates operators before triggering a recovery sweep.
///
/// Secrets are compared as SHA-256 digests so the comparison time does not
/// depend on where the presented secret first differs.
pub struct OperatorGate {
    digest: Option<[u8; 32]>,
    sweep: Arc<RecoverySweep>,
}

impl fmt::Debug for OperatorGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorGate")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

impl OperatorGate {
    /// Creates a gate. With no secret configured every trigger is refused.
    #[must_use]
    pub fn new(secret: Option<&str>, sweep: Arc<RecoverySweep>) -> Self {
        Self {
            digest: secret.filter(|s| !s.is_empty()).map(digest),
            sweep,
        }
    }

    /// Short hex fingerprint of the configured secret, for logs.
    #[must_use]
    pub fn fingerprint(&self) -> Option<String> {
        self.digest.map(|d| hex::encode(&d[..4]))
    }

    /// Checks a presented secret.
    pub fn authorize(&self, presented: Option<&str>) -> Result<()> {
        let (Some(expected), Some(presented)) = (self.digest, presented) else {
            warn!("Recovery trigger refused: missing secret");
            return Err(RelayError::Unauthorized);
        };

        let actual = digest(presented);
        let diff = expected
            .iter()
            .zip(actual.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff == 0 {
            Ok(())
        } else {
            warn!("Recovery trigger refused: secret mismatch");
            Err(RelayError::Unauthorized)
        }
    }

    /// Authenticates and runs one recovery sweep.
    pub async fn trigger_recovery(&self, presented: Option<&str>) -> Result<Vec<RecoveryReport>> {
        self.authorize(presented)?;
        self.sweep.run().await
    }
}

fn digest(secret: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(secret.as_bytes()));
    out
}
