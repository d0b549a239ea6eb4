//! Certificate renewal collaborator

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;

/// How the node obtains its TLS certificate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertMode {
    #[default]
    None,
    File,
    Http,
    Dns,
}

impl CertMode {
    /// Only ACME-backed modes are renewed by the controller.
    pub fn needs_renewal(&self) -> bool {
        matches!(self, CertMode::Http | CertMode::Dns)
    }
}

/// Issues and renews certificates; backed by an ACME client in a real
/// deployment. Renewal failures are logged by the controller and never
/// abort a reconciliation tick.
#[async_trait]
pub trait CertManager: Send + Sync {
    async fn renew_cert(
        &self,
        domain: &str,
        email: &str,
        mode: CertMode,
        provider: &str,
        dns_env: &HashMap<String, String>,
    ) -> Result<()>;
}
