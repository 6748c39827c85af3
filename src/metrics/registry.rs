use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

const WAIT_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0];

/// Thin handle around the global metrics recorder. `Metrics::install()` must
/// run once at startup before any `counter!`/`gauge!`/`histogram!` call
/// anywhere in the crate; the `PrometheusHandle` is kept only to render the
/// `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_wait_seconds".to_string()),
                WAIT_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        describe_counter!(
            "admission_requests_total",
            Unit::Count,
            "Total requests entering the admission pipeline, by outcome"
        );
        describe_histogram!(
            "admission_wait_seconds",
            Unit::Seconds,
            "Time spent waiting on a slot, mutex, or RPM budget before forwarding"
        );
        describe_counter!(
            "admission_rate_limited_total",
            Unit::Count,
            "Requests rejected with a rate-limited reason"
        );
        describe_counter!(
            "admission_account_switches_total",
            Unit::Count,
            "Account failover switches performed per request"
        );
        describe_gauge!(
            "admission_slots_occupied",
            Unit::Count,
            "Session-scheduler slots currently held, by account and category"
        );
        describe_counter!(
            "admission_billing_checks_total",
            Unit::Count,
            "Billing eligibility checks, by outcome"
        );
        describe_counter!(
            "admission_account_paused_total",
            Unit::Count,
            "Accounts paused for exceeding the 30-minute request quota"
        );
        describe_counter!(
            "admission_cleanup_removed_total",
            Unit::Count,
            "Expired slot-store members removed by the idle cleaner, by key family"
        );
        describe_gauge!(
            "admission_cleanup_last_run_timestamp_seconds",
            Unit::Seconds,
            "Unix timestamp of the idle cleaner's last successful sweep"
        );

        Self { handle }
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }
}
