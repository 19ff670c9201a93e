use async_trait::async_trait;
use chrono::Utc;
use common::auth::sign_request;
use common::daemon_keys::KeyQueryResponse;
use common::trust::{DaemonKeySource, OperatorIdentity};
use reqwest::{header::HeaderMap, header::HeaderValue, Client, Response};
use url::Url;

use super::error::ApiError;
use super::ApiRequest;
use crate::http_server::api::v0::keys::KeysRequest;
use crate::http_server::handlers::ErrorBody;

#[derive(Debug, Clone)]
pub struct ApiClient {
    pub remote: Url,
    client: Client,
}

impl ApiClient {
    pub fn new(remote: &Url) -> Result<Self, ApiError> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        let client = Client::builder().default_headers(default_headers).build()?;

        Ok(Self {
            remote: remote.clone(),
            client,
        })
    }

    pub async fn call<T: ApiRequest>(&mut self, request: T) -> Result<T::Response, ApiError> {
        let response = request.build_request(&self.remote, &self.client)?.send().await?;
        Self::decode::<T>(response).await
    }

    /// Send `request` signed by `identity`. The signature covers the
    /// method, the path and the exact body bytes that go on the wire.
    pub async fn call_signed<T: ApiRequest>(
        &mut self,
        request: T,
        identity: &OperatorIdentity,
    ) -> Result<T::Response, ApiError> {
        let mut request = request.build_request(&self.remote, &self.client)?.build()?;
        let body = request.body().and_then(|body| body.as_bytes()).unwrap_or_default();
        let signature = sign_request(
            identity,
            request.method().as_str(),
            request.url().path(),
            body,
            Utc::now(),
        );
        for (name, value) in signature.headers() {
            request.headers_mut().insert(name, HeaderValue::from_str(value)?);
        }

        let response = self.client.execute(request).await?;
        Self::decode::<T>(response).await
    }

    async fn decode<T: ApiRequest>(response: Response) -> Result<T::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T::Response>().await?);
        }

        let text = response.text().await?;
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => Err(ApiError::Remote {
                status,
                code: body.code,
                message: body.message,
            }),
            Err(_) => Err(ApiError::HttpStatus(status, text)),
        }
    }

    /// Get the base URL for API requests
    pub fn base_url(&self) -> &Url {
        &self.remote
    }

    /// Get the underlying HTTP client for custom requests
    pub fn http_client(&self) -> &Client {
        &self.client
    }
}

/// Key queries go to the address being bootstrapped, which need not be
/// this client's remote.
#[async_trait]
impl DaemonKeySource for ApiClient {
    async fn fetch_keys(
        &self,
        address: &str,
    ) -> Result<KeyQueryResponse, Box<dyn std::error::Error + Send + Sync>> {
        let remote = Url::parse(address)?;
        let response = KeysRequest
            .build_request(&remote, &self.client)?
            .send()
            .await?;
        Ok(Self::decode::<KeysRequest>(response).await?)
    }
}
