use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use tracing::{error, info, Subscriber};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::topic::TopicResult;

pub const LOG_FILE: &str = "topicflow.log";
pub const TURN_FILE: &str = "turns.json";

/// Installs the global subscriber.
///
/// - `log_level` is an `EnvFilter` directive (e.g. `"info"`).
/// - with `log_dir`, text logs go to a daily-rolling `topicflow.log` and one
///   JSON line per turn (target `turn`) to `turns.json`; without it logs go
///   to stderr.
pub fn init_tracing(log_level: &str, log_dir: Option<&Path>) -> Result<()> {
    let env_filter = EnvFilter::try_new(log_level).with_context(|| format!("invalid log level `{log_level}`"))?;

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("could not create {}", dir.display()))?;
            file_subscriber(env_filter, dir)
                .try_init()
                .context("tracing subscriber already installed")?;
        }
        None => {
            Registry::default()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init()
                .context("tracing subscriber already installed")?;
        }
    }
    Ok(())
}

// `log_level` only gates the text log; turn reports are always kept.
fn file_subscriber(env_filter: EnvFilter, dir: &Path) -> Box<dyn Subscriber + Send + Sync> {
    let txt_layer = fmt::layer()
        .with_writer(RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE))
        .with_ansi(false)
        .with_filter(env_filter);
    let json_layer = fmt::layer()
        .json()
        .with_writer(RollingFileAppender::new(Rotation::DAILY, dir, TURN_FILE))
        .with_target(true)
        .with_filter(EnvFilter::new("turn=info"));
    Box::new(Registry::default().with(txt_layer).with(json_layer))
}

/// Turn counters and latency, recorded on the global meter.
#[derive(Clone)]
pub struct TurnTelemetry {
    pub turns_started: Counter<u64>,
    pub turns_handled: Counter<u64>,
    pub turns_unhandled: Counter<u64>,
    pub turn_latency_ms: Histogram<f64>,
}

impl std::fmt::Debug for TurnTelemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TurnTelemetry")
    }
}

impl Default for TurnTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnTelemetry {
    pub fn new() -> Self {
        // no-op unless a meter provider was installed globally
        let meter = global::meter("topicflow");
        Self {
            turns_started: meter
                .u64_counter("turns_started")
                .with_description("Conversation turns started")
                .build(),
            turns_handled: meter.u64_counter("turns_handled").build(),
            turns_unhandled: meter.u64_counter("turns_unhandled").build(),
            turn_latency_ms: meter
                .f64_histogram("turn_latency_ms")
                .with_description("Latency per conversation turn in ms")
                .with_unit("ms")
                .build(),
        }
    }

    /// Wraps one conversation turn with metrics and a JSON `turn` event.
    pub async fn instrument_turn<F, Fut>(&self, conversation_id: &str, handler: F) -> TopicResult
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = TopicResult>,
    {
        self.turns_started.add(1, &[]);
        let start = Instant::now();

        let result = handler().await;

        let elapsed = start.elapsed().as_secs_f64() * 1_000.0;
        let attrs = [KeyValue::new("conversation_id", conversation_id.to_string())];
        self.turn_latency_ms.record(elapsed, &attrs);

        let status = match (&result.error, result.is_handled) {
            (Some(err), _) => {
                self.turns_handled.add(1, &attrs);
                error!(%conversation_id, error = %err, "turn failed in {elapsed:.1} ms");
                "error"
            }
            (None, true) => {
                self.turns_handled.add(1, &attrs);
                info!(%conversation_id, "turn handled in {elapsed:.1} ms");
                "ok"
            }
            (None, false) => {
                self.turns_unhandled.add(1, &attrs);
                info!(%conversation_id, "turn unhandled after {elapsed:.1} ms");
                "unhandled"
            }
        };

        tracing::event!(
            target: "turn",
            tracing::Level::INFO,
            conversation_id,
            latency_ms = elapsed,
            status,
            requires_input = result.requires_input,
            completed = result.is_completed,
        );

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_filter() {
        assert!(init_tracing("topicflow=loud", None).is_err());
    }

    fn read_logs(dir: &Path, prefix: &str) -> String {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(prefix))
            .map(|e| std::fs::read_to_string(e.path()).unwrap())
            .collect()
    }

    #[test]
    fn turn_reports_ignore_text_log_level() {
        let dir = tempfile::tempdir().unwrap();
        let subscriber = file_subscriber(EnvFilter::try_new("warn").unwrap(), dir.path());
        tracing::subscriber::with_default(subscriber, || {
            tracing::event!(target: "turn", tracing::Level::INFO, conversation_id = "c1", status = "ok");
            info!("routine chatter");
            tracing::warn!("something odd");
        });

        let turns = read_logs(dir.path(), TURN_FILE);
        assert!(turns.contains(r#""conversation_id":"c1""#), "{turns}");
        let text = read_logs(dir.path(), LOG_FILE);
        assert!(text.contains("something odd"));
        assert!(!text.contains("routine chatter"));
    }

    #[tokio::test]
    async fn instrument_turn_passes_result_through() {
        let telemetry = TurnTelemetry::new();
        let result = telemetry
            .instrument_turn("c1", || async { TopicResult::needs_input("Name?") })
            .await;
        assert_eq!(result.text, "Name?");
        assert!(result.requires_input);
    }
}
