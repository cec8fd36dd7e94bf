//! Cached answer to "is this CRD established?".
//!
//! Backs soft-dependency gating in the patcher and the watch set computed at
//! startup. Positive and negative answers are both cached for a short TTL so
//! a reconciliation burst does not hammer the apiserver with CRD gets.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

use crate::engine::applier::ResourceClient;
use crate::error::Error;
use crate::CRD_CACHE_TTL;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    established: bool,
    checked_at: Instant,
}

/// TTL cache over CRD establishment lookups.
pub struct CrdPresence {
    client: Arc<dyn ResourceClient>,
    ttl: Duration,
    cache: DashMap<String, CacheEntry>,
}

impl CrdPresence {
    /// Create an oracle with the default TTL.
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self::with_ttl(client, CRD_CACHE_TTL)
    }

    /// Create an oracle with an explicit TTL (tests).
    pub fn with_ttl(client: Arc<dyn ResourceClient>, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            cache: DashMap::new(),
        }
    }

    /// True when the named CRD exists and reports the Established condition.
    pub async fn is_established(&self, crd_name: &str) -> Result<bool, Error> {
        if let Some(entry) = self.cache.get(crd_name) {
            if entry.checked_at.elapsed() < self.ttl {
                return Ok(entry.established);
            }
        }

        let established = match self.client.get_crd(crd_name).await? {
            Some(crd) => crd_is_established(&crd),
            None => false,
        };

        self.cache.insert(
            crd_name.to_string(),
            CacheEntry {
                established,
                checked_at: Instant::now(),
            },
        );
        Ok(established)
    }
}

/// Check the Established condition on a CRD status.
pub fn crd_is_established(crd: &CustomResourceDefinition) -> bool {
    crd.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Established" && c.status == "True")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::applier::MockResourceClient;
    use serde_json::json;

    fn crd(established: bool) -> CustomResourceDefinition {
        serde_json::from_value(json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {"name": "widgets.example.io"},
            "spec": {
                "group": "example.io",
                "names": {"kind": "Widget", "plural": "widgets"},
                "scope": "Namespaced",
                "versions": []
            },
            "status": {
                "conditions": [{
                    "type": "Established",
                    "status": if established { "True" } else { "False" },
                    "reason": "InitialNamesAccepted",
                    "message": ""
                }],
                "acceptedNames": {"kind": "", "plural": ""},
                "storedVersions": []
            }
        }))
        .unwrap()
    }

    #[test]
    fn established_condition_is_detected() {
        assert!(crd_is_established(&crd(true)));
        assert!(!crd_is_established(&crd(false)));

        let no_status = CustomResourceDefinition::default();
        assert!(!crd_is_established(&no_status));
    }

    #[tokio::test]
    async fn missing_crd_is_not_established() {
        let mut mock = MockResourceClient::new();
        mock.expect_get_crd().times(1).returning(|_| Ok(None));

        let oracle = CrdPresence::new(Arc::new(mock));
        assert!(!oracle.is_established("widgets.example.io").await.unwrap());
    }

    #[tokio::test]
    async fn answers_are_cached_within_ttl() {
        let mut mock = MockResourceClient::new();
        mock.expect_get_crd()
            .times(1)
            .returning(|_| Ok(Some(crd(true))));

        let oracle = CrdPresence::with_ttl(Arc::new(mock), Duration::from_secs(300));
        assert!(oracle.is_established("widgets.example.io").await.unwrap());
        // Second call must be served from cache; the mock allows one get only.
        assert!(oracle.is_established("widgets.example.io").await.unwrap());
    }

    #[tokio::test]
    async fn expired_entries_are_refreshed() {
        let mut mock = MockResourceClient::new();
        let mut answers = vec![Ok(Some(crd(true))), Ok(None)];
        mock.expect_get_crd()
            .times(2)
            .returning(move |_| answers.remove(0));

        let oracle = CrdPresence::with_ttl(Arc::new(mock), Duration::ZERO);
        assert!(oracle.is_established("widgets.example.io").await.unwrap());
        assert!(!oracle.is_established("widgets.example.io").await.unwrap());
    }
}
