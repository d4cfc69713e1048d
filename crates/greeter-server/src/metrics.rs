//! Metric names and the Prometheus recorder.
//!
//! Instrumentation goes through the `metrics` facade; nothing is recorded
//! until a recorder is installed.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// Fails if a global recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render every recorded metric in Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Sessions created and armed (counter).
pub const SESSIONS_CREATED_TOTAL: &str = "greeter_sessions_created_total";
/// Sessions whose transport arming failed (counter).
pub const SESSION_INIT_FAILURES_TOTAL: &str = "greeter_session_init_failures_total";
/// Sessions removed from the registry (counter).
pub const SESSIONS_REMOVED_TOTAL: &str = "greeter_sessions_removed_total";
/// Sessions currently registered (gauge).
pub const SESSIONS_REGISTERED: &str = "greeter_sessions_registered";
/// Completions drained (counter, labels: stream).
pub const COMPLETIONS_TOTAL: &str = "greeter_completions_total";
/// Completions whose tag named no known event (counter).
pub const COMPLETIONS_UNKNOWN_TOTAL: &str = "greeter_completions_unknown_total";
/// Writes issued by the broadcast ticker (counter).
pub const BROADCAST_WRITES_TOTAL: &str = "greeter_broadcast_writes_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_recorder_renders_recorded_counter() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!(SESSIONS_CREATED_TOTAL).increment(2);
        });
        let output = render(&handle);
        assert!(output.contains(SESSIONS_CREATED_TOTAL));
    }

    #[test]
    fn metric_names_share_prefix() {
        let names = [
            SESSIONS_CREATED_TOTAL,
            SESSION_INIT_FAILURES_TOTAL,
            SESSIONS_REMOVED_TOTAL,
            SESSIONS_REGISTERED,
            COMPLETIONS_TOTAL,
            COMPLETIONS_UNKNOWN_TOTAL,
            BROADCAST_WRITES_TOTAL,
        ];
        for name in names {
            assert!(name.starts_with("greeter_"), "{name}");
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "{name}"
            );
        }
    }
}
