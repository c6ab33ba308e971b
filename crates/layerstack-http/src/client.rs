//! HTTP client side: reading another layer's publication endpoint

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use layerstack_engine::{
    FetchError, ImportBinding, LayerError, PublishedValue, RemoteSource, SourceConnector,
};
use reqwest::{StatusCode, Url};

use crate::error::TransportError;

/// Remote source backed by a layer served with [`crate::serve`]
pub struct HttpRemoteSource {
    base_url: String,
    base: Url,
    client: reqwest::Client,
}

impl HttpRemoteSource {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:2718`
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let base = Url::parse(&base_url)
            .ok()
            .filter(|url| matches!(url.scheme(), "http" | "https") && !url.cannot_be_a_base())
            .ok_or_else(|| TransportError::InvalidAddress(base_url.clone()))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url,
            base,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `{base}/nodes/{node}` with the node name escaped as one path segment
    fn node_url(&self, node: &str) -> Result<Url, FetchError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::InvalidResponse(format!("bad base url {}", self.base_url)))?
            .pop_if_empty()
            .push("nodes")
            .push(node);
        Ok(url)
    }
}

#[async_trait]
impl RemoteSource for HttpRemoteSource {
    async fn fetch(&self, node: &str) -> Result<PublishedValue, FetchError> {
        let url = self.node_url(node)?;
        let resp = self.client.get(url).send().await.map_err(|e| {
            FetchError::Unreachable(if e.is_timeout() {
                "Request timeout".to_string()
            } else if e.is_connect() {
                "Connection refused".to_string()
            } else {
                e.to_string()
            })
        })?;

        match resp.status() {
            status if status.is_success() => resp
                .json::<PublishedValue>()
                .await
                .map_err(|e| FetchError::InvalidResponse(e.to_string())),
            StatusCode::NOT_FOUND => Err(FetchError::NotPublished(node.to_string())),
            status => Err(FetchError::Unreachable(format!("HTTP {}", status))),
        }
    }

    fn describe(&self) -> String {
        self.base_url.clone()
    }
}

/// Connects import bindings whose remote is an `http(s)://` address
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpConnector;

impl SourceConnector for HttpConnector {
    fn connect(&self, binding: &ImportBinding) -> layerstack_engine::Result<Arc<dyn RemoteSource>> {
        let source = HttpRemoteSource::new(binding.remote.clone(), binding.request_timeout)
            .map_err(|e| LayerError::InvalidConfig(e.to_string()))?;
        log::debug!("Import of '{}' will poll {}", binding.remote_node, source.base_url());
        Ok(Arc::new(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_http_address() {
        assert!(matches!(
            HttpRemoteSource::new("layer1", Duration::from_secs(1)),
            Err(TransportError::InvalidAddress(_))
        ));
        let err = HttpConnector
            .connect(&ImportBinding::new("ftp://x", "ctx"))
            .err()
            .unwrap();
        assert!(matches!(err, LayerError::InvalidConfig(_)));
    }

    #[test]
    fn test_trailing_slash_is_trimmed() {
        let source =
            HttpRemoteSource::new("http://127.0.0.1:2718/", Duration::from_secs(1)).unwrap();
        assert_eq!(source.base_url(), "http://127.0.0.1:2718");
    }

    #[test]
    fn test_node_name_is_one_path_segment() {
        let source =
            HttpRemoteSource::new("http://127.0.0.1:2718/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            source.node_url("metrics").unwrap().as_str(),
            "http://127.0.0.1:2718/nodes/metrics"
        );
        assert_eq!(
            source.node_url("a/b?c#d").unwrap().as_str(),
            "http://127.0.0.1:2718/nodes/a%2Fb%3Fc%23d"
        );

        let nested = HttpRemoteSource::new("http://host/layer1", Duration::from_secs(1)).unwrap();
        assert_eq!(
            nested.node_url("ctx").unwrap().as_str(),
            "http://host/layer1/nodes/ctx"
        );
    }

    #[tokio::test]
    async fn test_closed_port_is_unreachable() {
        // Grab a free port and release it so nothing listens there
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let source =
            HttpRemoteSource::new(format!("http://{}", addr), Duration::from_secs(1)).unwrap();
        let err = source.fetch("ctx").await.unwrap_err();
        assert!(matches!(err, FetchError::Unreachable(_)));
    }
}
