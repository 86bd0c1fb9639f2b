//! SPF evaluation of the connecting client.
//!
//! The engine only cares whether a check passed. Lookup failures surface as
//! `TempError` and are treated like any other non-pass result.

use async_trait::async_trait;
use mail_auth::{spf::verify::SpfParameters, MessageAuthenticator, SpfResult};
use miette::{IntoDiagnostic, Result};
use moka::future::Cache;
use std::{borrow::Cow, net::IpAddr, sync::Arc, time::Duration};
use tracing::debug;

#[async_trait]
pub trait SpfResolver: Send + Sync {
    /// Evaluates the SPF policy for `sender` connecting from `ip`.
    async fn check_host(&self, ip: IpAddr, helo: &str, sender: &str) -> SpfResult;
}

/// DNS backed resolver.
pub struct MailAuthResolver {
    authenticator: MessageAuthenticator,
    hostname: String,
}

impl MailAuthResolver {
    /// Uses the system's resolver configuration.
    pub fn from_system_conf(hostname: &str) -> Result<Self> {
        let authenticator = MessageAuthenticator::new_system_conf().into_diagnostic()?;
        Ok(MailAuthResolver {
            authenticator,
            hostname: hostname.to_string(),
        })
    }
}

/// The identity checked for a sender. Senders without a domain part, like the
/// null sender, are checked as `postmaster@<helo>`.
fn spf_sender<'a>(sender: &'a str, helo: &str) -> Cow<'a, str> {
    if sender.contains('@') {
        Cow::Borrowed(sender)
    } else {
        Cow::Owned(format!("postmaster@{helo}"))
    }
}

#[async_trait]
impl SpfResolver for MailAuthResolver {
    async fn check_host(&self, ip: IpAddr, helo: &str, sender: &str) -> SpfResult {
        let sender = spf_sender(sender, helo);
        let output = self
            .authenticator
            .verify_spf(SpfParameters::verify_mail_from(
                ip,
                helo,
                &self.hostname,
                &sender,
            ))
            .await;
        output.result()
    }
}

type SpfKey = (IpAddr, String, String);

/// Remembers verdicts for a short while, so that several recipients of one
/// message cause a single DNS evaluation.
pub struct CachedResolver<R> {
    inner: R,
    cache: Cache<SpfKey, SpfResult>,
}

impl<R: SpfResolver> CachedResolver<R> {
    pub fn new(inner: R, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(ttl)
            .build();
        CachedResolver { inner, cache }
    }
}

#[async_trait]
impl<R: SpfResolver> SpfResolver for CachedResolver<R> {
    async fn check_host(&self, ip: IpAddr, helo: &str, sender: &str) -> SpfResult {
        let key = (ip, helo.to_string(), sender.to_string());
        if let Some(result) = self.cache.get(&key).await {
            debug!(%ip, sender, ?result, "SPF cache hit");
            return result;
        }

        let result = self.inner.check_host(ip, helo, sender).await;
        // Transient failures are retried on the next request.
        if result != SpfResult::TempError {
            self.cache.insert(key, result).await;
        }
        result
    }
}

/// Builds the resolver used by the engine. A zero TTL disables caching.
pub fn build_resolver(hostname: &str, cache_ttl: i64) -> Result<Arc<dyn SpfResolver>> {
    let resolver = MailAuthResolver::from_system_conf(hostname)?;
    if cache_ttl > 0 {
        let ttl = Duration::from_secs(cache_ttl as u64);
        Ok(Arc::new(CachedResolver::new(resolver, ttl)))
    } else {
        Ok(Arc::new(resolver))
    }
}

#[cfg(test)]
pub mod stub {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{Mutex, Notify};

    /// Resolver answering from a fixed table, `None` by default.
    #[derive(Default)]
    pub struct StubResolver {
        results: Mutex<HashMap<(IpAddr, String), SpfResult>>,
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl StubResolver {
        pub fn new() -> Self {
            Self::default()
        }

        /// Every lookup waits for a `notify_one` on `gate` before answering.
        pub fn gated(gate: Arc<Notify>) -> Self {
            StubResolver {
                gate: Some(gate),
                ..Self::default()
            }
        }

        pub async fn set(&self, ip: &str, sender: &str, result: SpfResult) {
            let ip = ip.parse().unwrap();
            self.results
                .lock()
                .await
                .insert((ip, sender.to_string()), result);
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SpfResolver for StubResolver {
        async fn check_host(&self, ip: IpAddr, _helo: &str, sender: &str) -> SpfResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.results
                .lock()
                .await
                .get(&(ip, sender.to_string()))
                .copied()
                .unwrap_or(SpfResult::None)
        }
    }

    #[async_trait]
    impl SpfResolver for Arc<StubResolver> {
        async fn check_host(&self, ip: IpAddr, helo: &str, sender: &str) -> SpfResult {
            self.as_ref().check_host(ip, helo, sender).await
        }
    }
}
