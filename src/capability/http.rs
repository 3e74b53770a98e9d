//! Outbound HTTP capability backing `<=/=` and URL reads.

use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::error::Diagnostic;

use super::{FetchResponse, HttpFetcher};

pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> Result<ReqwestFetcher, crate::error::BasilError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("basil/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(ReqwestFetcher { client })
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn get(
        &self,
        url: &Url,
        headers: &[(String, String)],
    ) -> Result<FetchResponse, Diagnostic> {
        let mut request = self.client.get(url.clone());
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Diagnostic::io("IO-FETCH", format!("GET {url}: {e}")))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let response_headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| {
                Diagnostic::io(
                    "IO-FETCH-BODY",
                    format!("GET {url}: reading body failed with status {status}: {e}"),
                )
            })?
            .to_vec();

        Ok(FetchResponse {
            status,
            headers: response_headers,
            body,
            content_type,
        })
    }
}
