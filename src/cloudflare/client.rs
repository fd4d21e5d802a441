use super::{validate_ipv4, CloudflareError, DnsApi, DnsRecord, Zone};
use async_trait::async_trait;
use rand::Rng;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const RATE_LIMIT_RETRIES: usize = 3;
const RATE_LIMIT_DEFAULT_WAIT: Duration = Duration::from_secs(2);
const RATE_LIMIT_MAX_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ApiMessage {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

/// Typed client over the Cloudflare v4 REST API. The token comes out of
/// the secrets store at startup; it never appears in logs or errors.
pub struct CloudflareClient {
    http: reqwest::Client,
    api_base: String,
    api_token: String,
}

impl CloudflareClient {
    pub fn new(api_base: String, api_token: String) -> Result<Self, CloudflareError> {
        url::Url::parse(&api_base)
            .map_err(|err| CloudflareError::Request(format!("invalid api base: {err}")))?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| CloudflareError::Request(err.to_string()))?;
        Ok(Self {
            http,
            api_base,
            api_token,
        })
    }

    /// Sends one request, retrying on 429 with the server-provided
    /// `Retry-After` (plus jitter) a bounded number of times.
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, CloudflareError> {
        let url = format!("{}{}", self.api_base, path);

        for attempt in 0..=RATE_LIMIT_RETRIES {
            let mut request = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&self.api_token);
            if let Some(body) = &body {
                request = request.json(body);
            }

            let response = request.send().await.map_err(|err| {
                if err.is_timeout() {
                    CloudflareError::UpstreamTimeout
                } else {
                    // reqwest errors may echo the URL but never the token.
                    CloudflareError::Request(err.to_string())
                }
            })?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt == RATE_LIMIT_RETRIES {
                    break;
                }
                let wait = retry_after(&response).unwrap_or(RATE_LIMIT_DEFAULT_WAIT);
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
                let wait = (wait + jitter).min(RATE_LIMIT_MAX_WAIT);
                warn!(attempt, wait_ms = wait.as_millis() as u64, "cloudflare rate limited");
                tokio::time::sleep(wait).await;
                continue;
            }

            let envelope: Envelope<T> = response
                .json()
                .await
                .map_err(|err| CloudflareError::Request(err.to_string()))?;

            if !envelope.success {
                let first = envelope.errors.first();
                return Err(CloudflareError::Api {
                    code: first.map(|e| e.code).unwrap_or_default(),
                    message: first
                        .map(|e| e.message.clone())
                        .unwrap_or_else(|| "unknown error".to_string()),
                });
            }
            return envelope.result.ok_or(CloudflareError::EmptyResult);
        }

        Err(CloudflareError::RateLimited)
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl DnsApi for CloudflareClient {
    async fn list_zones(&self) -> Result<Vec<Zone>, CloudflareError> {
        let zones: Vec<Zone> = self.request(Method::GET, "/zones", None).await?;
        debug!(count = zones.len(), "discovered cloudflare zones");
        Ok(zones)
    }

    async fn create_cname(
        &self,
        zone_id: &str,
        name: &str,
        content: &str,
    ) -> Result<DnsRecord, CloudflareError> {
        self.request(
            Method::POST,
            &format!("/zones/{zone_id}/dns_records"),
            Some(json!({
                "type": "CNAME",
                "name": name,
                "content": content,
                "proxied": true,
                "ttl": 1,
            })),
        )
        .await
    }

    async fn create_a(
        &self,
        zone_id: &str,
        name: &str,
        ip: &str,
        proxied: bool,
    ) -> Result<DnsRecord, CloudflareError> {
        validate_ipv4(ip)?;
        self.request(
            Method::POST,
            &format!("/zones/{zone_id}/dns_records"),
            Some(json!({
                "type": "A",
                "name": name,
                "content": ip,
                "proxied": proxied,
                "ttl": 1,
            })),
        )
        .await
    }

    async fn delete_record(
        &self,
        zone_id: &str,
        record_id: &str,
    ) -> Result<(), CloudflareError> {
        #[derive(Deserialize)]
        struct Deleted {
            #[allow(dead_code)]
            id: String,
        }
        let _: Deleted = self
            .request(
                Method::DELETE,
                &format!("/zones/{zone_id}/dns_records/{record_id}"),
                None,
            )
            .await?;
        Ok(())
    }

    async fn list_records(&self, zone_id: &str) -> Result<Vec<DnsRecord>, CloudflareError> {
        self.request(Method::GET, &format!("/zones/{zone_id}/dns_records"), None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use httpmock::prelude::*;

    fn client_for(server: &MockServer) -> CloudflareClient {
        CloudflareClient::new(server.base_url(), "test-token".to_string()).unwrap()
    }

    #[tokio::test]
    async fn list_zones_unwraps_envelope() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/zones")
                    .header("authorization", "Bearer test-token");
                then.status(200).json_body(json!({
                    "success": true,
                    "errors": [],
                    "result": [{"id": "zone-1", "name": "153.se"}],
                }));
            })
            .await;

        let zones = client_for(&server).list_zones().await.unwrap();
        assert_eq!(
            zones,
            vec![Zone {
                id: "zone-1".to_string(),
                name: "153.se".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn api_error_is_surfaced_with_code() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/zones/zone-1/dns_records");
                then.status(200).json_body(json!({
                    "success": false,
                    "errors": [{"code": 81057, "message": "Record already exists."}],
                    "result": null,
                }));
            })
            .await;

        let result = client_for(&server)
            .create_cname("zone-1", "app.153.se", "t.cfargotunnel.com")
            .await;
        assert_matches!(
            result,
            Err(CloudflareError::Api { code: 81057, .. })
        );
    }

    #[tokio::test]
    async fn rate_limit_is_retried_then_reported() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/zones");
                then.status(429).header("retry-after", "0");
            })
            .await;

        let result = client_for(&server).list_zones().await;
        assert_matches!(result, Err(CloudflareError::RateLimited));
        // Initial attempt plus the bounded retries.
        mock.assert_hits_async(1 + RATE_LIMIT_RETRIES).await;
    }

    #[tokio::test]
    async fn rate_limit_recovers_when_server_relents() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/zones");
                then.status(200).json_body(json!({
                    "success": true,
                    "errors": [],
                    "result": [],
                }));
            })
            .await;

        let zones = client_for(&server).list_zones().await.unwrap();
        assert!(zones.is_empty());
    }

    #[tokio::test]
    async fn create_a_validates_ip_before_any_request() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path_contains("dns_records");
                then.status(200);
            })
            .await;

        let result = client_for(&server)
            .create_a("zone-1", "app.153.se", "not-an-ip", true)
            .await;
        assert_matches!(result, Err(CloudflareError::InvalidIpv4(_)));
        mock.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn delete_record_targets_the_record_path() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(DELETE).path("/zones/zone-1/dns_records/rec-9");
                then.status(200).json_body(json!({
                    "success": true,
                    "errors": [],
                    "result": {"id": "rec-9"},
                }));
            })
            .await;

        client_for(&server).delete_record("zone-1", "rec-9").await.unwrap();
        mock.assert_async().await;
    }
}
