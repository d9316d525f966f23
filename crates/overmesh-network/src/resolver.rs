//! Address resolvers
//!
//! Turn a network name into a set of node addresses. The resolve loop
//! merges these records with the configured seed nodes.

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Resolver errors
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Name did not resolve to any address
    #[error("failed to resolve {0}")]
    NotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A resolved node address
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    /// Node address
    pub address: String,
}

/// Resolves a network name to node addresses
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve a name
    async fn resolve(&self, name: &str) -> Result<Vec<Record>, ResolveError>;
}

/// Resolver returning a fixed record set regardless of name
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    records: Vec<Record>,
}

impl StaticResolver {
    /// Create a resolver over a fixed address list
    pub fn new(addresses: Vec<String>) -> Self {
        Self {
            records: addresses
                .into_iter()
                .map(|address| Record { address })
                .collect(),
        }
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, _name: &str) -> Result<Vec<Record>, ResolveError> {
        Ok(self.records.clone())
    }
}

/// Resolver using DNS host lookup; the name is resolved with a fixed port
#[derive(Clone, Debug)]
pub struct DnsResolver {
    port: u16,
}

impl DnsResolver {
    /// Create a DNS resolver appending the given port to each address
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, name: &str) -> Result<Vec<Record>, ResolveError> {
        let records: Vec<Record> = tokio::net::lookup_host((name, self.port))
            .await?
            .map(|addr| Record {
                address: addr.to_string(),
            })
            .collect();

        if records.is_empty() {
            return Err(ResolveError::NotFound(name.to_string()));
        }
        debug!("resolved {} to {} records", name, records.len());
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_resolver_ignores_name() {
        let resolver = StaticResolver::new(vec!["10.0.0.1:8085".to_string()]);
        let records = resolver.resolve("anything").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].address, "10.0.0.1:8085");
    }

    #[tokio::test]
    async fn test_dns_resolver_localhost() {
        let resolver = DnsResolver::new(8085);
        let records = resolver.resolve("localhost").await.unwrap();
        assert!(!records.is_empty());
        assert!(records.iter().all(|r| r.address.ends_with(":8085")));
    }
}
