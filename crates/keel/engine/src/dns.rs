//! Service-discovery cache interface

use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsAction {
    Add,
    Remove,
}

/// Cluster DNS record store
#[async_trait]
pub trait DnsCache: Send + Sync {
    async fn propose(&self, domain: &str, ip: IpAddr, action: DnsAction) -> Result<()>;
}

/// In-memory DNS cache
#[derive(Debug, Default)]
pub struct InMemoryDnsCache {
    records: DashMap<String, BTreeSet<IpAddr>>,
}

impl InMemoryDnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, domain: &str) -> Vec<IpAddr> {
        self.records
            .get(domain)
            .map(|ips| ips.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DnsCache for InMemoryDnsCache {
    async fn propose(&self, domain: &str, ip: IpAddr, action: DnsAction) -> Result<()> {
        match action {
            DnsAction::Add => {
                self.records.entry(domain.to_string()).or_default().insert(ip);
            }
            DnsAction::Remove => {
                let now_empty = match self.records.get_mut(domain) {
                    Some(mut ips) => {
                        ips.remove(&ip);
                        ips.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    self.records.remove(domain);
                }
            }
        }
        Ok(())
    }
}
