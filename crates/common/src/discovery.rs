//! DNS-alias based peer discovery.
//!
//! Nodes resolve a well-known service alias; round-robin DNS returns the
//! addresses of every instance registered under it. Results are deduplicated
//! and sorted so repeated resolutions are comparable.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use tokio::net::lookup_host;

pub async fn resolve_service(alias: &str, port: u16) -> Result<Vec<String>> {
    let resolved = lookup_host((alias, port))
        .await
        .with_context(|| format!("DNS resolution failed for service alias '{alias}'"))?;

    let unique: BTreeSet<String> = resolved
        .filter(|addr| addr.is_ipv4())
        .map(|addr| addr.to_string())
        .collect();

    Ok(unique.into_iter().collect())
}

/// Like [`resolve_service`] but treats resolution failure as an empty peer
/// set. Background refresh loops use this; bootstrap uses the strict form.
pub async fn resolve_service_lenient(alias: &str, port: u16) -> Vec<String> {
    resolve_service(alias, port).await.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn localhost_resolves_to_loopback() {
        let peers = resolve_service("localhost", 8000).await.unwrap();
        assert!(peers.contains(&"127.0.0.1:8000".to_string()));
    }

    #[tokio::test]
    async fn unknown_alias_errors_strictly_and_empties_leniently() {
        assert!(resolve_service("redcloud-no-such-alias.invalid", 8000)
            .await
            .is_err());
        assert!(resolve_service_lenient("redcloud-no-such-alias.invalid", 8000)
            .await
            .is_empty());
    }
}
