use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::warn;

use domwatch_core::{normalize_domain, CheckResult};

use crate::lookup::{LookupClient, LookupVerdict};

/// Largest number of domains sent to the status API in one request.
pub const MAX_BATCH_DOMAINS: usize = 10;

/// Per-domain status lookup that never fails.
///
/// Transport errors, timeouts and missing verdicts all collapse into
/// [`CheckResult::unreachable`]; callers decide whether to skip or retry.
#[async_trait]
pub trait StatusChecker: Send + Sync {
    async fn check(&self, domain: &str) -> CheckResult;

    /// Checks several domains; the default issues one [`check`](Self::check) per domain.
    async fn check_many(&self, domains: &[String]) -> HashMap<String, CheckResult> {
        let mut results = HashMap::with_capacity(domains.len());
        for domain in domains {
            results.insert(domain.clone(), self.check(domain).await);
        }
        results
    }
}

/// [`StatusChecker`] backed by the HTTP status API with a bounded timeout.
#[derive(Clone)]
pub struct HttpStatusChecker {
    client: LookupClient,
    timeout: Duration,
}

impl HttpStatusChecker {
    pub fn new(client: LookupClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn lookup_bounded(&self, domains: &[&str]) -> Option<HashMap<String, LookupVerdict>> {
        match timeout(self.timeout, self.client.lookup(domains)).await {
            Ok(Ok(verdicts)) => Some(verdicts),
            Ok(Err(err)) => {
                warn!(stage = "lookup", domains = %domains.join(","), error = %err, "status lookup failed");
                None
            }
            Err(_) => {
                warn!(
                    stage = "lookup",
                    domains = %domains.join(","),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "status lookup timed out"
                );
                None
            }
        }
    }
}

#[async_trait]
impl StatusChecker for HttpStatusChecker {
    async fn check(&self, domain: &str) -> CheckResult {
        let Some(verdicts) = self.lookup_bounded(&[domain]).await else {
            return CheckResult::unreachable();
        };

        match normalize_domain(domain).and_then(|key| verdicts.get(&key).copied()) {
            Some(verdict) => CheckResult::observed(verdict.blocked),
            None => {
                warn!(stage = "lookup", %domain, "status api returned no verdict");
                CheckResult::unreachable()
            }
        }
    }

    async fn check_many(&self, domains: &[String]) -> HashMap<String, CheckResult> {
        let mut results = HashMap::with_capacity(domains.len());
        for chunk in domains.chunks(MAX_BATCH_DOMAINS) {
            let batch: Vec<&str> = chunk.iter().map(String::as_str).collect();
            let verdicts = self.lookup_bounded(&batch).await.unwrap_or_default();
            for domain in chunk {
                let result = normalize_domain(domain)
                    .and_then(|key| verdicts.get(&key))
                    .map(|verdict| CheckResult::observed(verdict.blocked))
                    .unwrap_or_else(CheckResult::unreachable);
                results.insert(domain.clone(), result);
            }
        }
        results
    }
}
