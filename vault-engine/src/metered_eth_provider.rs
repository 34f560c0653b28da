// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::metrics::VaultEngineMetrics;
use ethers::providers::{Http, HttpClientError, JsonRpcClient, Provider};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::Semaphore;
use url::{ParseError, Url};

/// Default cap on requests in flight against one provider.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 8;

/// An `Http` transport that bounds concurrency and records per-method
/// query counts and latency.
#[derive(Debug, Clone)]
pub struct MeteredEthHttpProvider {
    inner: Http,
    metrics: Arc<VaultEngineMetrics>,
    semaphore: Arc<Semaphore>,
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait::async_trait)]
impl JsonRpcClient for MeteredEthHttpProvider {
    type Error = HttpClientError;

    async fn request<T: Serialize + Send + Sync + Debug, R: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: T,
    ) -> Result<R, HttpClientError> {
        // The semaphore is owned by this struct and never closed.
        let _permit = self.semaphore.acquire().await.ok();

        self.metrics
            .eth_rpc_queries
            .with_label_values(&[method])
            .inc();
        let _guard = self
            .metrics
            .eth_rpc_queries_latency
            .with_label_values(&[method])
            .start_timer();

        let result = self.inner.request(method, params).await;
        match &result {
            Ok(_) => self.metrics.eth_node_connected.set(1),
            Err(_) => self.metrics.eth_node_connected.set(0),
        }
        result
    }
}

impl MeteredEthHttpProvider {
    pub fn new(
        url: impl Into<Url>,
        metrics: Arc<VaultEngineMetrics>,
        max_concurrent_requests: usize,
    ) -> Self {
        Self {
            inner: Http::new(url),
            metrics,
            semaphore: Arc::new(Semaphore::new(max_concurrent_requests.max(1))),
        }
    }
}

pub fn new_metered_eth_provider(
    url: &str,
    metrics: Arc<VaultEngineMetrics>,
    max_concurrent_requests: usize,
) -> Result<Provider<MeteredEthHttpProvider>, ParseError> {
    let http_provider =
        MeteredEthHttpProvider::new(Url::parse(url)?, metrics, max_concurrent_requests);
    Ok(Provider::new(http_provider))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::providers::Middleware;

    #[tokio::test]
    async fn test_metered_eth_provider() {
        let metrics = Arc::new(VaultEngineMetrics::new_for_testing());
        let provider = new_metered_eth_provider(
            "http://localhost:9876",
            metrics.clone(),
            DEFAULT_MAX_CONCURRENT_REQUESTS,
        )
        .unwrap();

        assert_eq!(
            metrics
                .eth_rpc_queries
                .get_metric_with_label_values(&["eth_blockNumber"])
                .unwrap()
                .get(),
            0
        );

        provider.get_block_number().await.unwrap_err(); // nothing listens on this port

        assert_eq!(
            metrics
                .eth_rpc_queries
                .get_metric_with_label_values(&["eth_blockNumber"])
                .unwrap()
                .get(),
            1
        );
        assert_eq!(
            metrics
                .eth_rpc_queries_latency
                .get_metric_with_label_values(&["eth_blockNumber"])
                .unwrap()
                .get_sample_count(),
            1
        );
        assert_eq!(metrics.eth_node_connected.get(), 0);
    }

    #[test]
    fn test_rejects_invalid_url() {
        let metrics = Arc::new(VaultEngineMetrics::new_for_testing());
        assert!(new_metered_eth_provider("not a url", metrics, 1).is_err());
    }
}
