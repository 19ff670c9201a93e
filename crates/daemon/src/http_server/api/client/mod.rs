use reqwest::{Client, RequestBuilder};
use url::Url;

mod client;
mod error;

pub use client::ApiClient;
pub use error::ApiError;

/// A request the CLI can send to the daemon api
pub trait ApiRequest {
    type Response: serde::de::DeserializeOwned;

    fn build_request(self, base_url: &Url, client: &Client) -> Result<RequestBuilder, ApiError>;
}
