// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Registry,
};

const FINE_GRAINED_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.15, 0.2, 0.25, 0.3, 0.35, 0.4, 0.45, 0.5, 0.6, 0.7, 0.8, 0.9,
    1.0, 1.2, 1.4, 1.6, 1.8, 2.0, 2.5, 3.0, 3.5, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10., 15., 20., 25.,
    30., 45., 60.,
];

#[derive(Clone, Debug)]
pub struct VaultEngineMetrics {
    pub(crate) eth_rpc_queries: IntCounterVec,
    pub(crate) eth_rpc_queries_latency: HistogramVec,
    pub(crate) eth_rpc_errors: IntCounterVec,
    pub(crate) eth_node_connected: IntGauge,

    pub(crate) chain_reads: IntCounterVec,
    pub(crate) chain_reads_latency: HistogramVec,

    pub(crate) snapshot_errors: IntCounterVec,
    pub(crate) log_fetch_errors: IntCounterVec,
    pub(crate) decimals_defaulted: IntCounterVec,

    pub(crate) read_model_refreshes: IntCounterVec,
    pub(crate) read_model_cache_hit: IntCounterVec,
    pub(crate) read_model_cache_miss: IntCounterVec,
    pub(crate) read_model_cache_joined: IntCounterVec,
    pub(crate) read_model_stale_discarded: IntCounterVec,
    pub(crate) read_model_evicted: IntCounterVec,

    pub(crate) active_pollers: IntGauge,
    pub(crate) active_countdowns: IntGauge,

    pub(crate) requests_received: IntCounterVec,
    pub(crate) requests_ok: IntCounterVec,
    pub(crate) err_requests: IntCounterVec,
    pub(crate) requests_inflight: IntGaugeVec,

    pub(crate) server_uptime_seconds: IntGauge,
    pub(crate) config_loads: IntCounter,
}

impl VaultEngineMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            eth_rpc_queries: register_int_counter_vec_with_registry!(
                "vault_eth_rpc_queries",
                "Total number of queries issued to eth provider, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            eth_rpc_queries_latency: register_histogram_vec_with_registry!(
                "vault_eth_rpc_queries_latency",
                "Latency of queries issued to eth provider, by request type",
                &["type"],
                FINE_GRAINED_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            eth_rpc_errors: register_int_counter_vec_with_registry!(
                "vault_eth_rpc_errors",
                "Total number of failed chain reads, by error type",
                &["error_type"],
                registry,
            )
            .unwrap(),
            eth_node_connected: register_int_gauge_with_registry!(
                "vault_eth_node_connected",
                "Whether the last call to the eth node succeeded (1) or failed (0)",
                registry,
            )
            .unwrap(),
            chain_reads: register_int_counter_vec_with_registry!(
                "vault_chain_reads",
                "Total number of contract reads, by contract function",
                &["method"],
                registry,
            )
            .unwrap(),
            chain_reads_latency: register_histogram_vec_with_registry!(
                "vault_chain_reads_latency",
                "Latency of contract reads including retries, by contract function",
                &["method"],
                FINE_GRAINED_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            snapshot_errors: register_int_counter_vec_with_registry!(
                "vault_snapshot_errors",
                "Total number of failed vault snapshots, by vault and error type",
                &["vault_id", "error_type"],
                registry,
            )
            .unwrap(),
            log_fetch_errors: register_int_counter_vec_with_registry!(
                "vault_log_fetch_errors",
                "Total number of failed history collections, by vault and error type",
                &["vault_id", "error_type"],
                registry,
            )
            .unwrap(),
            decimals_defaulted: register_int_counter_vec_with_registry!(
                "vault_decimals_defaulted",
                "Total number of decimals reads that fell back to the default, by vault",
                &["vault_id"],
                registry,
            )
            .unwrap(),
            read_model_refreshes: register_int_counter_vec_with_registry!(
                "vault_read_model_refreshes",
                "Total number of read model fetches, by kind and outcome",
                &["kind", "outcome"],
                registry,
            )
            .unwrap(),
            read_model_cache_hit: register_int_counter_vec_with_registry!(
                "vault_read_model_cache_hit",
                "Total number of fresh read model cache hits, by kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            read_model_cache_miss: register_int_counter_vec_with_registry!(
                "vault_read_model_cache_miss",
                "Total number of read model cache misses that started a fetch, by kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            read_model_cache_joined: register_int_counter_vec_with_registry!(
                "vault_read_model_cache_joined",
                "Total number of requests that joined an in-flight fetch, by kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            read_model_stale_discarded: register_int_counter_vec_with_registry!(
                "vault_read_model_stale_discarded",
                "Total number of fetch results discarded because their key was superseded",
                &["kind"],
                registry,
            )
            .unwrap(),
            read_model_evicted: register_int_counter_vec_with_registry!(
                "vault_read_model_evicted",
                "Total number of idle read model keys dropped from the cache",
                &["kind"],
                registry,
            )
            .unwrap(),
            active_pollers: register_int_gauge_with_registry!(
                "vault_active_pollers",
                "Number of running read model pollers",
                registry,
            )
            .unwrap(),
            active_countdowns: register_int_gauge_with_registry!(
                "vault_active_countdowns",
                "Number of countdowns currently ticking",
                registry,
            )
            .unwrap(),
            requests_received: register_int_counter_vec_with_registry!(
                "vault_requests_received",
                "Total number of requests received in Server, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            requests_ok: register_int_counter_vec_with_registry!(
                "vault_requests_ok",
                "Total number of ok requests, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            err_requests: register_int_counter_vec_with_registry!(
                "vault_err_requests",
                "Total number of erred requests, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            requests_inflight: register_int_gauge_vec_with_registry!(
                "vault_requests_inflight",
                "Total number of inflight requests, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            server_uptime_seconds: register_int_gauge_with_registry!(
                "vault_server_uptime_seconds",
                "Seconds since the vault engine node started",
                registry,
            )
            .unwrap(),
            config_loads: register_int_counter_with_registry!(
                "vault_config_loads",
                "Total number of times the vault configuration set was loaded",
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_registered() {
        let registry = Registry::new();
        let metrics = VaultEngineMetrics::new(&registry);

        metrics
            .snapshot_errors
            .with_label_values(&["usdc", "data_integrity"])
            .inc();
        metrics.read_model_cache_hit.with_label_values(&["snapshot"]).inc();
        metrics.active_pollers.set(2);

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"vault_snapshot_errors".to_string()));
        assert!(names.contains(&"vault_read_model_cache_hit".to_string()));
        assert!(names.contains(&"vault_active_pollers".to_string()));
    }

    #[test]
    fn test_counter_increment() {
        let metrics = VaultEngineMetrics::new_for_testing();
        let counter = metrics.decimals_defaulted.with_label_values(&["eth"]);
        assert_eq!(counter.get(), 0);
        counter.inc();
        counter.inc_by(2);
        assert_eq!(counter.get(), 3);
    }
}
