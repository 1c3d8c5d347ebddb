//! Outbound HTTP for subrequests and upstream proxying

use async_trait::async_trait;
use nimbus_plugin_api::{Fetcher, Request, Response};

/// [`Fetcher`] that sends requests over the network
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: Request) -> anyhow::Result<Response> {
        let response = self
            .client
            .request(request.method().clone(), request.url().clone())
            .headers(request.headers().clone())
            .body(request.body().clone())
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        tracing::trace!(status = %status, bytes = body.len(), "Subrequest finished");
        Ok(Response::new(body).with_status(status).with_headers(headers))
    }
}
