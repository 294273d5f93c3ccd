use async_trait::async_trait;
use http::Response;

/// A http client
#[async_trait]
pub trait HttpClient {
    type Err: Send + 'static;

    async fn get(&self, path: &str) -> Result<Response<Vec<u8>>, Self::Err>;
}

/// Access to inner HttpClient
pub trait HaveHttpClient {
    type Client: HttpClient;
    fn http_client(&self) -> &Self::Client;
}
