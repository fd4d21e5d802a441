//! Cloudflare REST client: zone discovery and DNS record CRUD over the
//! v4 API, with rate-limit aware retries.

use async_trait::async_trait;
use serde::Deserialize;
use std::net::Ipv4Addr;
use thiserror::Error;

pub mod client;

pub use client::CloudflareClient;

/// DNS content every tunnel-routed CNAME points at.
pub fn tunnel_dns_target(tunnel_id: &str) -> String {
    format!("{tunnel_id}.cfargotunnel.com")
}

#[derive(Error, Debug)]
pub enum CloudflareError {
    #[error("cloudflare request failed: `{0}`")]
    Request(String),

    #[error("cloudflare api error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("cloudflare rate limit persisted after retries")]
    RateLimited,

    #[error("cloudflare did not answer within the deadline")]
    UpstreamTimeout,

    #[error("`{0}` is not a valid IPv4 address")]
    InvalidIpv4(String),

    #[error("cloudflare response missing result payload")]
    EmptyResult,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DnsRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub content: String,
    #[serde(default)]
    pub proxied: bool,
}

/// Seam over the DNS API. The CNAME lifecycle depends on this, not on the
/// concrete HTTP client.
#[async_trait]
pub trait DnsApi: Send + Sync {
    async fn list_zones(&self) -> Result<Vec<Zone>, CloudflareError>;

    /// Proxied CNAME with automatic TTL.
    async fn create_cname(
        &self,
        zone_id: &str,
        name: &str,
        content: &str,
    ) -> Result<DnsRecord, CloudflareError>;

    async fn create_a(
        &self,
        zone_id: &str,
        name: &str,
        ip: &str,
        proxied: bool,
    ) -> Result<DnsRecord, CloudflareError>;

    async fn delete_record(&self, zone_id: &str, record_id: &str)
        -> Result<(), CloudflareError>;

    async fn list_records(&self, zone_id: &str) -> Result<Vec<DnsRecord>, CloudflareError>;
}

pub(crate) fn validate_ipv4(ip: &str) -> Result<(), CloudflareError> {
    ip.parse::<Ipv4Addr>()
        .map(|_| ())
        .map_err(|_| CloudflareError::InvalidIpv4(ip.to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use mockall::mock;

    mock! {
        pub DnsApi {}

        #[async_trait]
        impl DnsApi for DnsApi {
            async fn list_zones(&self) -> Result<Vec<Zone>, CloudflareError>;
            async fn create_cname(&self, zone_id: &str, name: &str, content: &str) -> Result<DnsRecord, CloudflareError>;
            async fn create_a(&self, zone_id: &str, name: &str, ip: &str, proxied: bool) -> Result<DnsRecord, CloudflareError>;
            async fn delete_record(&self, zone_id: &str, record_id: &str) -> Result<(), CloudflareError>;
            async fn list_records(&self, zone_id: &str) -> Result<Vec<DnsRecord>, CloudflareError>;
        }
    }

    impl MockDnsApi {
        pub fn should_create_cname(&mut self, record_id: &str) {
            let record_id = record_id.to_string();
            self.expect_create_cname()
                .once()
                .returning(move |_, name, content| {
                    Ok(DnsRecord {
                        id: record_id.clone(),
                        name: name.to_string(),
                        record_type: "CNAME".to_string(),
                        content: content.to_string(),
                        proxied: true,
                    })
                });
        }

        pub fn should_delete_record(&mut self, record_id: &str) {
            let expected = record_id.to_string();
            self.expect_delete_record()
                .once()
                .withf(move |_, record_id| *record_id == expected)
                .returning(|_, _| Ok(()));
        }

        pub fn should_list_no_records(&mut self) {
            self.expect_list_records().returning(|_| Ok(vec![]));
        }
    }

    #[test]
    fn ipv4_validation() {
        assert!(validate_ipv4("192.168.1.10").is_ok());
        assert!(validate_ipv4("256.0.0.1").is_err());
        assert!(validate_ipv4("::1").is_err());
        assert!(validate_ipv4("host.example").is_err());
    }

    #[test]
    fn tunnel_target_format() {
        assert_eq!(
            tunnel_dns_target("6ff42ae2"),
            "6ff42ae2.cfargotunnel.com"
        );
    }
}
