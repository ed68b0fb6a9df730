//! Placement client configuration and address handling

use std::net::SocketAddr;
use std::time::Duration;

use placement_commons::DEFAULT_REPLICATION_FACTOR;
use tonic::transport::{ClientTlsConfig, Endpoint};

use crate::error::{ClientError, Result};

/// Scheme that asks the resolver for a DNS lookup
pub const DNS_RESOLVER_PREFIX: &str = "dns:///";

#[derive(Debug, Clone)]
pub struct PlacementClientConfig {
    /// Placement peers, tried round-robin
    pub addresses: Vec<String>,

    /// This host's `host:port` identity
    pub host_name: String,
    pub app_id: String,
    pub port: u32,

    /// Actor types hosted here
    pub entities: Vec<String>,

    pub heartbeat_interval: Duration,

    /// Must match the placement cluster
    pub replication_factor: usize,

    /// Ceiling of the reconnect backoff
    pub max_backoff: Duration,

    pub tls: Option<ClientTlsConfig>,
}

impl Default for PlacementClientConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            host_name: String::new(),
            app_id: String::new(),
            port: 0,
            entities: Vec::new(),
            heartbeat_interval: Duration::from_secs(1),
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            max_backoff: Duration::from_secs(5),
            tls: None,
        }
    }
}

/// Prefix non-IP addresses with [`DNS_RESOLVER_PREFIX`]; literal
/// `ip:port` entries pass through unchanged.
pub fn add_dns_resolver_prefix(addresses: &[String]) -> Vec<String> {
    addresses
        .iter()
        .map(|addr| {
            if addr.parse::<SocketAddr>().is_ok() || addr.starts_with(DNS_RESOLVER_PREFIX) {
                addr.clone()
            } else {
                format!("{}{}", DNS_RESOLVER_PREFIX, addr)
            }
        })
        .collect()
}

/// Build a tonic endpoint for a (possibly prefixed) placement address.
/// Host names are resolved by the connector when dialing.
pub(crate) fn endpoint_for(address: &str, tls: Option<&ClientTlsConfig>) -> Result<Endpoint> {
    let authority = address.strip_prefix(DNS_RESOLVER_PREFIX).unwrap_or(address);
    let scheme = if tls.is_some() { "https" } else { "http" };

    let mut endpoint = Endpoint::from_shared(format!("{}://{}", scheme, authority))
        .map_err(|_| ClientError::InvalidAddress(address.to_string()))?
        .connect_timeout(Duration::from_secs(2))
        .tcp_nodelay(true);
    if let Some(tls) = tls {
        endpoint = endpoint.tls_config(tls.clone())?;
    }
    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_dns_resolver_prefix() {
        let names: Vec<String> = ["placement1:50005", "placement2:50005", "placement3:50005"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            add_dns_resolver_prefix(&names),
            vec![
                "dns:///placement1:50005",
                "dns:///placement2:50005",
                "dns:///placement3:50005"
            ]
        );

        let ips: Vec<String> = ["192.168.0.100:50005", "192.168.0.101:50005", "192.168.0.102:50005"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(add_dns_resolver_prefix(&ips), ips);
    }

    #[test]
    fn test_endpoint_strips_dns_scheme() {
        let endpoint = endpoint_for("dns:///placement1:50005", None).unwrap();
        assert_eq!(endpoint.uri().scheme_str(), Some("http"));
        assert_eq!(endpoint.uri().host(), Some("placement1"));
        assert_eq!(endpoint.uri().port_u16(), Some(50005));
        assert!(endpoint_for("not a uri", None).is_err());
    }
}
