//! # Prometheus Metrics
//!
//! Exposes operational metrics for the vault node. Scraped by Prometheus
//! at the `/metrics` HTTP endpoint on the configured metrics port.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] with
//! the `timelock` prefix so they do not collide with any default global
//! registry consumers.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;

use timelock_contracts::Vault;
use timelock_protocol::{EventRecord, VaultEvent};

/// Holds all Prometheus metric handles for the node.
///
/// Clone-friendly (prometheus handles are `Arc`s internally) so it can be
/// shared across request handlers and the vault's event listener.
#[derive(Clone)]
pub struct VaultMetrics {
    /// Prometheus registry that owns all metrics below.
    registry: Registry,
    /// Deposits committed.
    pub deposits_total: IntCounter,
    /// Withdrawals committed (paid out).
    pub withdrawals_total: IntCounter,
    /// Rejected or failed operations, by operation and error kind.
    pub failed_operations_total: IntCounterVec,
    /// Ownership transfers committed.
    pub ownership_transfers_total: IntCounter,
    /// Current `total_locked`, in wei.
    pub total_locked: Gauge,
    /// Current `total_withdrawn`, in wei.
    pub total_withdrawn: Gauge,
    /// Current custody balance, in wei.
    pub vault_balance: Gauge,
    /// Number of records in the event log.
    pub event_log_length: IntGauge,
    /// Wall time of mutating operations, by operation.
    pub operation_latency_seconds: HistogramVec,
}

impl VaultMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("timelock".into()), None)?;

        let deposits_total = IntCounter::new("deposits_total", "Total number of deposits committed")?;
        registry.register(Box::new(deposits_total.clone()))?;

        let withdrawals_total =
            IntCounter::new("withdrawals_total", "Total number of withdrawals paid out")?;
        registry.register(Box::new(withdrawals_total.clone()))?;

        let failed_operations_total = IntCounterVec::new(
            Opts::new(
                "failed_operations_total",
                "Operations that were rejected or failed, by operation and error kind",
            ),
            &["operation", "kind"],
        )?;
        registry.register(Box::new(failed_operations_total.clone()))?;

        let ownership_transfers_total = IntCounter::new(
            "ownership_transfers_total",
            "Total number of ownership transfers committed",
        )?;
        registry.register(Box::new(ownership_transfers_total.clone()))?;

        let total_locked = Gauge::new("total_locked", "Value currently locked in deposits (wei)")?;
        registry.register(Box::new(total_locked.clone()))?;

        let total_withdrawn =
            Gauge::new("total_withdrawn", "Cumulative value withdrawn (wei)")?;
        registry.register(Box::new(total_withdrawn.clone()))?;

        let vault_balance = Gauge::new("vault_balance", "Value held by the vault (wei)")?;
        registry.register(Box::new(vault_balance.clone()))?;

        let event_log_length =
            IntGauge::new("event_log_length", "Number of records in the event log")?;
        registry.register(Box::new(event_log_length.clone()))?;

        let operation_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "operation_latency_seconds",
                "Mutating operation latency in seconds, including the durable commit",
            )
            .buckets(vec![
                0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ]),
            &["operation"],
        )?;
        registry.register(Box::new(operation_latency_seconds.clone()))?;

        Ok(Self {
            registry,
            deposits_total,
            withdrawals_total,
            failed_operations_total,
            ownership_transfers_total,
            total_locked,
            total_withdrawn,
            vault_balance,
            event_log_length,
            operation_latency_seconds,
        })
    }

    /// Counts a committed event.
    pub fn record_event(&self, record: &EventRecord) {
        match record.event {
            VaultEvent::Deposited { .. } => self.deposits_total.inc(),
            VaultEvent::Withdrawn { .. } => self.withdrawals_total.inc(),
            VaultEvent::OwnershipTransferred { .. } => self.ownership_transfers_total.inc(),
            VaultEvent::ExternalCredit { .. } => {}
        }
        self.event_log_length.set((record.sequence + 1) as i64);
    }

    /// Refreshes the balance gauges from the vault.
    ///
    /// Gauges are `f64`; values beyond 2^53 wei lose precision.
    pub fn observe_vault(&self, vault: &Vault) {
        let totals = vault.totals();
        self.total_locked.set(totals.total_locked as f64);
        self.total_withdrawn.set(totals.total_withdrawn as f64);
        self.vault_balance.set(vault.get_vault_balance() as f64);
        self.event_log_length.set(vault.event_count() as i64);
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<VaultMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
///
/// Returns HTTP 500 if encoding fails (should never happen in practice).
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timelock_protocol::Address;

    #[test]
    fn encoded_metrics_carry_prefix() {
        let metrics = VaultMetrics::new().unwrap();
        metrics.deposits_total.inc();
        metrics
            .failed_operations_total
            .with_label_values(&["withdraw", "StillLocked"])
            .inc();

        let text = metrics.encode().unwrap();
        assert!(text.contains("timelock_deposits_total 1"));
        assert!(text.contains("timelock_failed_operations_total"));
        assert!(text.contains("kind=\"StillLocked\""));
    }

    #[test]
    fn events_drive_counters() {
        let metrics = VaultMetrics::new().unwrap();
        let record = EventRecord::next(
            None,
            VaultEvent::OwnershipTransferred {
                previous_owner: Address::ZERO,
                new_owner: Address::repeat_byte(1),
            },
        );
        metrics.record_event(&record);
        assert_eq!(metrics.ownership_transfers_total.get(), 1);
        assert_eq!(metrics.event_log_length.get(), 1);
    }
}
