use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Arc,
};

use async_trait::async_trait;

use crate::wstun::tunnel::address::{Destination, Host};

/// Per-record-type name lookups.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn lookup_a(&self, name: &str) -> io::Result<Vec<Ipv4Addr>>;
    async fn lookup_aaaa(&self, name: &str) -> io::Result<Vec<Ipv6Addr>>;

    /// A and AAAA records together. The default runs both queries concurrently; a resolver that
    /// gets both families from a single query should override it.
    async fn lookup_both(&self, name: &str) -> (io::Result<Vec<Ipv4Addr>>, io::Result<Vec<Ipv6Addr>>) {
        tokio::join!(self.lookup_a(name), self.lookup_aaaa(name))
    }
}

pub type SharedResolver = Arc<dyn Resolver>;

/// Resolver backed by the operating system (`getaddrinfo` through Tokio), filtered by family.
#[derive(Debug, Default)]
pub struct SystemResolver;

impl SystemResolver {
    pub fn new() -> Self {
        Self
    }

    async fn lookup(name: &str) -> io::Result<(Vec<Ipv4Addr>, Vec<Ipv6Addr>)> {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        for addr in tokio::net::lookup_host((name, 0)).await? {
            match addr.ip() {
                IpAddr::V4(ip) => v4.push(ip),
                IpAddr::V6(ip) => v6.push(ip),
            }
        }
        Ok((v4, v6))
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_a(&self, name: &str) -> io::Result<Vec<Ipv4Addr>> {
        Ok(Self::lookup(name).await?.0)
    }

    async fn lookup_aaaa(&self, name: &str) -> io::Result<Vec<Ipv6Addr>> {
        Ok(Self::lookup(name).await?.1)
    }

    // getaddrinfo returns both families at once.
    async fn lookup_both(&self, name: &str) -> (io::Result<Vec<Ipv4Addr>>, io::Result<Vec<Ipv6Addr>>) {
        match Self::lookup(name).await {
            Ok((v4, v6)) => (Ok(v4), Ok(v6)),
            Err(err) => {
                let v6_err = io::Error::new(err.kind(), err.to_string());
                (Err(err), Err(v6_err))
            }
        }
    }
}

/// Resolves `name` with A and AAAA queried concurrently.
///
/// The first A record wins, then the first AAAA record. When neither query yields a record the
/// name itself is returned so the connector can retry with the system resolver.
pub async fn resolve_host(resolver: &dyn Resolver, name: &str) -> Host {
    let name = name.trim();
    if name.is_empty() {
        return Host::Domain(String::new());
    }

    let (v4, v6) = resolver.lookup_both(name).await;

    let v4 = match v4 {
        Ok(list) => list.into_iter().next(),
        Err(err) => {
            tracing::debug!(name = %name, err = %err, "dns: A lookup failed");
            None
        }
    };
    let v6 = match v6 {
        Ok(list) => list.into_iter().next(),
        Err(err) => {
            tracing::debug!(name = %name, err = %err, "dns: AAAA lookup failed");
            None
        }
    };

    match (v4, v6) {
        (Some(ip), _) => Host::Ip(IpAddr::V4(ip)),
        (None, Some(ip)) => Host::Ip(IpAddr::V6(ip)),
        (None, None) => {
            tracing::debug!(name = %name, "dns: no records, using name as-is");
            Host::Domain(name.to_string())
        }
    }
}

/// Replaces a domain host with its resolved address. IP hosts pass through untouched.
pub async fn resolve(resolver: &dyn Resolver, dest: Destination) -> Destination {
    match &dest.host {
        Host::Ip(_) => dest,
        Host::Domain(name) => {
            let host = resolve_host(resolver, name).await;
            Destination { host, ..dest }
        }
    }
}
