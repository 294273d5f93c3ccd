use crate::errors::Error as DwError;
use crate::http_client::HttpClient;
use http::{Request, Response};
use hyper::Uri;
use std::path::{Path, PathBuf};

/// Http client over a unix socket, using hyper
#[derive(Debug, Clone)]
pub struct HyperClient {
    /// http client
    client: hyper::Client<hyperlocal::UnixConnector>,
    /// path to the socket every request goes to
    socket: PathBuf,
}

fn join_uri(socket: &Path, path: &str) -> Uri {
    hyperlocal::Uri::new(socket, path).into()
}

async fn fetch_body(resp: http::Response<hyper::Body>) -> Result<http::Response<Vec<u8>>, DwError> {
    let (p, b) = resp.into_parts();
    let b = hyper::body::to_bytes(b).await?.to_vec();
    Ok(Response::from_parts(p, b))
}

impl HyperClient {
    /// path to unix socket
    pub fn connect_with_unix(path: &Path) -> Self {
        // Prevent from using connection pooling.
        // See https://github.com/hyperium/hyper/issues/2312.
        let client: hyper::Client<_> = hyper::Client::builder()
            .pool_idle_timeout(std::time::Duration::from_millis(0))
            .pool_max_idle_per_host(0)
            .build(hyperlocal::UnixConnector);
        Self {
            client,
            socket: path.to_owned(),
        }
    }
}

#[async_trait::async_trait]
impl HttpClient for HyperClient {
    type Err = DwError;

    async fn get(&self, path: &str) -> Result<Response<Vec<u8>>, Self::Err> {
        let request = Request::get(join_uri(&self.socket, path)).body(hyper::Body::empty())?;
        let res = self.client.request(request).await?;
        fetch_body(res).await
    }
}
