use anyhow::Context;
use metrics::{Unit, describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const CONNECTIONS_TOTAL: &str = "brpc_connections_total";
pub const ACTIVE_CLIENTS: &str = "brpc_active_clients";
pub const NEGOTIATION_FAILURES_TOTAL: &str = "brpc_negotiation_failures_total";
pub const CLIENT_RECONNECTS_TOTAL: &str = "brpc_client_reconnects_total";

/// Installs the global recorder. The returned handle renders the exposition
/// text served on `/metrics`.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("telemetry: install prometheus recorder")?;
    describe();
    Ok(handle)
}

fn describe() {
    describe_counter!(
        CONNECTIONS_TOTAL,
        Unit::Count,
        "Sessions accepted by the server."
    );
    describe_gauge!(
        ACTIVE_CLIENTS,
        Unit::Count,
        "Clients currently registered for callbacks."
    );
    describe_counter!(
        NEGOTIATION_FAILURES_TOTAL,
        Unit::Count,
        "Sessions dropped before identity negotiation finished."
    );
    describe_counter!(
        CLIENT_RECONNECTS_TOTAL,
        Unit::Count,
        "Dial attempts made by the reference client after the first."
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_metrics_render() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            describe();
            metrics::counter!(CONNECTIONS_TOTAL).increment(2);
            metrics::gauge!(ACTIVE_CLIENTS).set(1.0);
        });
        let text = handle.render();
        assert!(text.contains("brpc_connections_total 2"), "got: {text}");
        assert!(text.contains("brpc_active_clients 1"), "got: {text}");
    }
}
