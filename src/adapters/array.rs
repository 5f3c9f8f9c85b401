//! Array REST Adapter
//!
//! Implements the `ArrayClient` port against the array's JSON management
//! API. Every call is authenticated with HTTP basic auth; every response
//! carries a status block whose negative `returnCode` is an array error.
//!
//! ```text
//! POST   {api}/volumes                         {"name","size","pool"}
//! DELETE {api}/volumes/{name}
//! POST   {api}/volumes/{name}/maps             {"initiator","lun"}
//! DELETE {api}/volumes/{name}/maps[/{initiator}]
//! GET    {api}/hosts/{initiator}/maps
//! DELETE {api}/hosts/{initiator}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::domain::ports::{ArrayClient, ArrayCredentials, HostMap};
use crate::error::{ArrayError, Error, Result};

// =============================================================================
// Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiStatus {
    return_code: i64,
    #[serde(default)]
    response: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    status: ApiStatus,
    data: Option<T>,
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> Result<Option<T>> {
        if self.status.return_code < 0 {
            return Err(ArrayError::new(self.status.return_code, self.status.response).into());
        }
        Ok(self.data)
    }
}

// =============================================================================
// Client
// =============================================================================

/// Array management client over HTTP.
pub struct RestArrayClient {
    http: Client,
    timeout: Duration,
    credentials: Option<ArrayCredentials>,
}

impl RestArrayClient {
    /// Create an unconfigured client; `configure` must run before any call.
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: Self::build_http(timeout)?,
            timeout,
            credentials: None,
        })
    }

    fn build_http(timeout: Duration) -> Result<Client> {
        Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))
    }

    fn credentials(&self) -> Result<&ArrayCredentials> {
        self.credentials
            .as_ref()
            .ok_or_else(|| Error::Config("array client used before being configured".to_string()))
    }

    /// Build the URL of an API path, percent-encoding each segment.
    fn url(api_address: &str, segments: &[&str]) -> String {
        let mut url = api_address.trim_end_matches('/').to_string();
        for segment in segments {
            url.push('/');
            url.push_str(&urlencoding::encode(segment));
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder> {
        let creds = self.credentials()?;
        Ok(self
            .http
            .request(method, Self::url(&creds.api_address, segments))
            .basic_auth(&creds.username, Some(&creds.password)))
    }

    async fn send<T>(&self, request: RequestBuilder) -> Result<Option<T>>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response = request.send().await?;
        let http_status = response.status();
        let body: ApiResponse<T> = response.json().await.map_err(|e| {
            Error::Array(ArrayError::new(
                -1,
                format!("unreadable response (HTTP {}): {}", http_status, e),
            ))
        })?;
        body.into_result()
    }
}

impl std::fmt::Debug for RestArrayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestArrayClient")
            .field("timeout", &self.timeout)
            .field("credentials", &self.credentials)
            .finish()
    }
}

#[async_trait]
impl ArrayClient for RestArrayClient {
    #[instrument(skip(self))]
    async fn configure(&mut self, credentials: &ArrayCredentials) -> Result<()> {
        if self.credentials.as_ref() == Some(credentials) {
            debug!("Array client already configured");
            return Ok(());
        }

        self.credentials = Some(credentials.clone());
        let login = self.request(Method::GET, &["login"])?;
        if let Err(e) = self.send::<serde_json::Value>(login).await {
            self.credentials = None;
            return Err(e);
        }

        debug!(api_address = %credentials.api_address, "Logged into array");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn create_volume(&self, name: &str, size: &str, pool: &str) -> Result<()> {
        let request = self
            .request(Method::POST, &["volumes"])?
            .json(&json!({ "name": name, "size": size, "pool": pool }));
        self.send::<serde_json::Value>(request).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, name: &str) -> Result<()> {
        let request = self.request(Method::DELETE, &["volumes", name])?;
        self.send::<serde_json::Value>(request).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn map_volume(&self, name: &str, initiator: &str, lun: u32) -> Result<()> {
        let request = self
            .request(Method::POST, &["volumes", name, "maps"])?
            .json(&json!({ "initiator": initiator, "lun": lun }));
        self.send::<serde_json::Value>(request).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unmap_volume(&self, name: &str, initiator: Option<&str>) -> Result<()> {
        let request = match initiator {
            Some(initiator) => self.request(Method::DELETE, &["volumes", name, "maps", initiator])?,
            None => self.request(Method::DELETE, &["volumes", name, "maps"])?,
        };
        self.send::<serde_json::Value>(request).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn show_host_maps(&self, initiator: &str) -> Result<Vec<HostMap>> {
        let request = self.request(Method::GET, &["hosts", initiator, "maps"])?;
        Ok(self.send::<Vec<HostMap>>(request).await?.unwrap_or_default())
    }

    #[instrument(skip(self))]
    async fn delete_host(&self, initiator: &str) -> Result<()> {
        let request = self.request(Method::DELETE, &["hosts", initiator])?;
        self.send::<serde_json::Value>(request).await?;
        Ok(())
    }

    fn close_idle_connections(&mut self) {
        // Dropping the client drops its connection pool.
        match Self::build_http(self.timeout) {
            Ok(http) => self.http = http,
            Err(e) => warn!(error = %e, "Could not recycle array HTTP client"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_encodes_segments() {
        assert_eq!(
            RestArrayClient::url("https://array/api/", &["hosts", "iqn.1993-08.org.debian:01:ab", "maps"]),
            "https://array/api/hosts/iqn.1993-08.org.debian%3A01%3Aab/maps"
        );
    }

    #[test]
    fn test_negative_return_code_is_array_error() {
        let body: ApiResponse<serde_json::Value> = serde_json::from_str(
            r#"{"status": {"returnCode": -10075, "response": "volume not found"}}"#,
        )
        .unwrap();

        match body.into_result() {
            Err(Error::Array(e)) => {
                assert!(e.is_missing_volume());
                assert_eq!(e.message, "volume not found");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_host_maps_payload() {
        let body: ApiResponse<Vec<HostMap>> = serde_json::from_str(
            r#"{"status": {"returnCode": 0},
                "data": [{"volumeName": "a", "lun": 1}, {"volumeName": "b", "lun": 3}]}"#,
        )
        .unwrap();

        let maps = body.into_result().unwrap().unwrap();
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[1].lun, 3);
    }

    #[tokio::test]
    async fn test_unconfigured_client_refuses_calls() {
        let client = RestArrayClient::new(Duration::from_secs(1)).unwrap();
        let result = client.create_volume("v", "1MiB", "A").await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
