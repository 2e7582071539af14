//! Cache metrics
//!
//! - `async_cache_fetches_total` (counter): labels `kind` (`first`, `refresh`),
//!   `outcome` (`ok`, `error`)
//! - `async_cache_evictions_total` (counter)

/// Which fetch path produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    First,
    Refresh,
}

impl FetchKind {
    pub fn label(self) -> &'static str {
        match self {
            FetchKind::First => "first",
            FetchKind::Refresh => "refresh",
        }
    }
}

pub fn record_fetch(kind: FetchKind, ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    metrics::counter!("async_cache_fetches_total", "kind" => kind.label(), "outcome" => outcome)
        .increment(1);
}

pub fn record_eviction() {
    metrics::counter!("async_cache_evictions_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[test]
    fn fetches_are_labelled_by_kind_and_outcome() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_fetch(FetchKind::First, true);
        record_fetch(FetchKind::Refresh, false);
        record_eviction();

        let output = handle.render();
        assert!(output.contains("async_cache_fetches_total"));
        assert!(output.contains("kind=\"first\""));
        assert!(output.contains("outcome=\"error\""));
        assert!(
            output.contains("async_cache_evictions_total 1"),
            "eviction counter must render unlabelled"
        );
    }

    #[test]
    fn recording_without_a_recorder_is_a_no_op() {
        record_fetch(FetchKind::Refresh, true);
        record_eviction();
    }
}
