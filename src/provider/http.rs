//! HTTP implementation of the provider control-plane API.
//!
//! This module provides the reqwest-based client for the REST control plane.
//! Response statuses map onto the error taxonomy so callers can tell
//! transient failures from fatal ones without inspecting HTTP details.

use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{ProviderError, Result, StrataError};

use super::api::{DesiredResource, ProviderApi, RemoteResource};

/// Default provider control-plane base URL.
const DEFAULT_ENDPOINT: &str = "https://control.strata.cloud";

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// HTTP provider client.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Control-plane base URL, no trailing slash.
    endpoint: String,
    /// API token.
    token: String,
}

/// Error body shape returned by the control plane.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl HttpProvider {
    /// Creates a new provider client against the default endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(token: &str) -> Result<Self> {
        Self::with_endpoint(DEFAULT_ENDPOINT, token)
    }

    /// Creates a new provider client against a custom endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_endpoint(endpoint: &str, token: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// Builds the URL for a resource address.
    fn resource_url(&self, address: &str) -> String {
        format!("{}/v1/resources/{address}", self.endpoint)
    }

    /// Sends a request with auth headers and maps transport failures.
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response> {
        request
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .header(header::CONTENT_TYPE, "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    StrataError::Provider(ProviderError::network(format!(
                        "Request timed out: {e}"
                    )))
                } else {
                    StrataError::Provider(ProviderError::network(format!("Request failed: {e}")))
                }
            })
    }

    /// Maps a non-success response to the error taxonomy.
    async fn map_error(address: &str, response: Response) -> StrataError {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or_default();
            let retry_after = if retry_after == 0 { 60 } else { retry_after };

            return StrataError::Provider(ProviderError::Throttled {
                retry_after_secs: retry_after,
            });
        }

        let body: ErrorBody = response
            .json()
            .await
            .unwrap_or(ErrorBody {
                code: None,
                message: None,
            });
        let message = body
            .message
            .unwrap_or_else(|| String::from("no error detail provided"));

        if body.code.as_deref() == Some("QuotaExceeded") {
            return StrataError::Provider(ProviderError::QuotaExceeded { message });
        }

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                StrataError::Provider(ProviderError::AuthorizationDenied { message })
            }
            StatusCode::NOT_FOUND => StrataError::Provider(ProviderError::NotFound {
                address: address.to_string(),
            }),
            StatusCode::CONFLICT => StrataError::Provider(ProviderError::Conflict {
                address: address.to_string(),
                message,
            }),
            StatusCode::UNPROCESSABLE_ENTITY => {
                StrataError::Provider(ProviderError::MalformedState {
                    address: address.to_string(),
                    message,
                })
            }
            s if s.is_server_error() => StrataError::Provider(ProviderError::network(format!(
                "Server error {s}: {message}"
            ))),
            s => StrataError::Provider(ProviderError::api_error(s.as_u16(), message)),
        }
    }

    /// Parses a success response body into a remote resource.
    async fn parse_resource(response: Response) -> Result<RemoteResource> {
        response.json().await.map_err(|e| {
            StrataError::Provider(ProviderError::InvalidResponse {
                message: format!("Failed to parse response: {e}"),
            })
        })
    }
}

#[async_trait]
impl ProviderApi for HttpProvider {
    async fn get(&self, address: &str) -> Result<Option<RemoteResource>> {
        trace!("GET {address}");
        let response = self
            .send(self.client.get(self.resource_url(address)))
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("Resource not present on provider: {address}");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::map_error(address, response).await);
        }

        Ok(Some(Self::parse_resource(response).await?))
    }

    async fn get_by_id(&self, provider_id: &str) -> Result<Option<RemoteResource>> {
        trace!("GET by id {provider_id}");
        let url = format!("{}/v1/resources/by-id", self.endpoint);
        let response = self
            .send(self.client.get(url).query(&[("id", provider_id)]))
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::map_error(provider_id, response).await);
        }

        Ok(Some(Self::parse_resource(response).await?))
    }

    async fn put(&self, desired: &DesiredResource) -> Result<RemoteResource> {
        debug!("PUT {}", desired.address);
        let response = self
            .send(
                self.client
                    .put(self.resource_url(&desired.address))
                    .json(desired),
            )
            .await?;

        if !response.status().is_success() {
            return Err(Self::map_error(&desired.address, response).await);
        }

        Self::parse_resource(response).await
    }

    async fn delete(&self, address: &str, provider_id: &str) -> Result<()> {
        debug!("DELETE {address} ({provider_id})");
        let response = self
            .send(
                self.client
                    .delete(self.resource_url(address))
                    .query(&[("id", provider_id)]),
            )
            .await?;

        if !response.status().is_success() {
            return Err(Self::map_error(address, response).await);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn desired(address: &str) -> DesiredResource {
        DesiredResource {
            address: address.to_string(),
            resource_type: String::from("storage.account"),
            name: String::from("main"),
            scope: None,
            properties: json!({ "sku": "Standard_LRS" }),
            spec_hash: String::from("abc123"),
        }
    }

    #[tokio::test]
    async fn test_put_parses_remote_resource() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/resources/storage.account/main"))
            .and(header("authorization", "Bearer token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "provider_id": "/providers/storage.account/main",
                "address": "storage.account/main",
                "spec_hash": "abc123",
                "attributes": { "primary_endpoint": "https://main.blob" },
            })))
            .mount(&server)
            .await;

        let provider = HttpProvider::with_endpoint(&server.uri(), "token").unwrap();
        let remote = provider.put(&desired("storage.account/main")).await.unwrap();

        assert_eq!(remote.provider_id, "/providers/storage.account/main");
        assert_eq!(remote.spec_hash.as_deref(), Some("abc123"));
        assert_eq!(
            remote.attribute_str("primary_endpoint").as_deref(),
            Some("https://main.blob")
        );
    }

    #[tokio::test]
    async fn test_get_missing_resource_returns_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/resources/storage.account/ghost"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = HttpProvider::with_endpoint(&server.uri(), "token").unwrap();
        let result = provider.get("storage.account/ghost").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_throttled_response_maps_to_transient_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/resources/storage.account/main"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let provider = HttpProvider::with_endpoint(&server.uri(), "token").unwrap();
        let error = provider
            .put(&desired("storage.account/main"))
            .await
            .unwrap_err();

        assert!(error.is_retryable());
        assert_eq!(error.retry_delay_secs(), Some(7));
    }

    #[tokio::test]
    async fn test_authorization_failure_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/resources/storage.account/main"))
            .respond_with(
                ResponseTemplate::new(403)
                    .set_body_json(json!({ "message": "principal lacks write" })),
            )
            .mount(&server)
            .await;

        let provider = HttpProvider::with_endpoint(&server.uri(), "token").unwrap();
        let error = provider
            .put(&desired("storage.account/main"))
            .await
            .unwrap_err();

        assert!(!error.is_retryable());
        assert_eq!(error.kind(), "provider_fatal");
    }

    #[tokio::test]
    async fn test_quota_code_maps_to_quota_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/resources/ai.deployment/model"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "code": "QuotaExceeded",
                "message": "deployment capacity exhausted",
            })))
            .mount(&server)
            .await;

        let provider = HttpProvider::with_endpoint(&server.uri(), "token").unwrap();
        let mut d = desired("ai.deployment/model");
        d.resource_type = String::from("ai.deployment");
        let error = provider.put(&d).await.unwrap_err();

        assert!(matches!(
            error,
            StrataError::Provider(ProviderError::QuotaExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/resources/storage.account/main"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let provider = HttpProvider::with_endpoint(&server.uri(), "token").unwrap();
        let error = provider.get("storage.account/main").await.unwrap_err();
        assert!(error.is_retryable());
    }
}
