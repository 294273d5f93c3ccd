use crate::container::ContainerSummary;
use crate::errors::*;
use crate::http_client::{HaveHttpClient, HttpClient};
use crate::hyper_client::HyperClient;
use crate::options::ContainerListOptions;
use log::*;
use serde::de::DeserializeOwned;
use std::path::Path;

/// Handle to connection to the docker daemon
#[derive(Debug)]
pub struct Docker {
    /// http client
    client: HyperClient,
}

/// Deserialize from json string
fn api_result<D: DeserializeOwned>(res: http::Response<Vec<u8>>) -> Result<D> {
    if res.status().is_success() {
        Ok(serde_json::from_slice::<D>(res.body())?)
    } else {
        Err(serde_json::from_slice::<DockerError>(res.body())?.into())
    }
}

impl Docker {
    /// Connect through a unix socket, typically one forwarded from a remote host.
    pub fn connect_with_unix(path: &Path) -> Docker {
        Docker {
            client: HyperClient::connect_with_unix(path),
        }
    }

    /// List containers
    ///
    /// # API
    /// /containers/json
    pub async fn list_containers(&self, opts: &ContainerListOptions) -> Result<Vec<ContainerSummary>> {
        let params = opts.to_url_params();
        debug!("list containers: {}", params);
        let res = self
            .http_client()
            .get(&format!("/containers/json?{params}"))
            .await?;
        api_result(res)
    }
}

impl HaveHttpClient for Docker {
    type Client = HyperClient;
    fn http_client(&self) -> &Self::Client {
        &self.client
    }
}
