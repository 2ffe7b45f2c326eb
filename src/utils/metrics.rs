use std::{future::Future, time::Instant};

use metrics::{counter, histogram};
use tracing::{debug, debug_span, warn, Instrument};

use crate::{api::RequestContext, Result};

/// Runs `operation` under a numbered span and records how long it took.
///
/// Every call lands in the `matrixon_appservice_operation_duration_seconds`
/// histogram; failures also bump `matrixon_appservice_operation_errors_total`.
/// Errors are returned unchanged.
pub async fn timed<T, F>(ctx: &RequestContext, operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let request_id = ctx.next_request_id();
    let start = Instant::now();

    let result = fut
        .instrument(debug_span!("operation", op = operation, request_id))
        .await;

    let elapsed = start.elapsed();
    histogram!("matrixon_appservice_operation_duration_seconds", "op" => operation)
        .record(elapsed.as_secs_f64());

    match &result {
        Ok(_) => debug!(
            "✅ {} (request {}) completed in {:?}",
            operation, request_id, elapsed
        ),
        Err(e) => {
            counter!("matrixon_appservice_operation_errors_total", "op" => operation).increment(1);
            warn!(
                "❌ {} (request {}) failed after {:?}: {}",
                operation, request_id, elapsed, e
            );
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use metrics::{
        Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit,
    };

    use super::*;
    use crate::Error;

    /// Remembers which metrics were touched, as `name{op}`.
    #[derive(Default)]
    struct KeyLog(Arc<Mutex<Vec<String>>>);

    impl KeyLog {
        fn push(&self, key: &Key) {
            let op = key
                .labels()
                .find(|label| label.key() == "op")
                .map(|label| label.value().to_owned())
                .unwrap_or_default();
            self.0.lock().unwrap().push(format!("{}{{{}}}", key.name(), op));
        }

        fn keys(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Recorder for KeyLog {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
            self.push(key);
            Counter::noop()
        }

        fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
            self.push(key);
            Gauge::noop()
        }

        fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
            self.push(key);
            Histogram::noop()
        }
    }

    #[tokio::test]
    async fn test_timed_passes_results_through() {
        let ctx = RequestContext::new();

        let ok = timed(&ctx, "test.ok", async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: Result<()> = timed(&ctx, "test.err", async {
            Err(Error::Transport("boom".into()))
        })
        .await;
        assert!(matches!(err, Err(Error::Transport(_))));

        assert_eq!(ctx.issued(), 2);
    }

    #[test]
    fn test_timed_records_duration_and_failures() {
        let recorder = KeyLog::default();
        let ctx = RequestContext::new();

        metrics::with_local_recorder(&recorder, || {
            futures::executor::block_on(async {
                let _ = timed(&ctx, "intent.send_event", async { Ok(()) }).await;
                let _: Result<()> = timed(&ctx, "intent.join_room", async {
                    Err(Error::Transport("boom".into()))
                })
                .await;
            })
        });

        assert_eq!(
            recorder.keys(),
            vec![
                "matrixon_appservice_operation_duration_seconds{intent.send_event}".to_owned(),
                "matrixon_appservice_operation_duration_seconds{intent.join_room}".to_owned(),
                "matrixon_appservice_operation_errors_total{intent.join_room}".to_owned(),
            ]
        );
    }
}
