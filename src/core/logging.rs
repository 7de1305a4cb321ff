//! Logging setup and per-request context.
//!
//! The request ID lives in a task-local so that handler and translation logs
//! can be correlated without threading it through every call.

use chrono::Local;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

tokio::task_local! {
    /// Task-local storage for the current request ID.
    pub static REQUEST_ID: String;
}

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,llm_bridge_rust=debug";

/// Filters appended unconditionally so HTTP internals stay quiet even with `RUST_LOG=trace`.
const NOISE_FILTER: &str = "hyper=warn,hyper::proto=warn,h2=warn,reqwest=warn";

/// Get the current request ID from context, if set.
///
/// Returns an empty string if no request ID is set.
pub fn get_request_id() -> String {
    REQUEST_ID.try_with(|id| id.clone()).unwrap_or_default()
}

/// Generate a new unique request ID using UUID v4.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Custom time formatter that uses local timezone (respects TZ environment variable)
struct LocalTime;

impl tracing_subscriber::fmt::time::FormatTime for LocalTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Build the filter string from an optional `RUST_LOG` value.
pub fn filter_directives(rust_log: Option<&str>) -> String {
    let base = rust_log
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(DEFAULT_FILTER);
    format!("{},{}", base, NOISE_FILTER)
}

/// Install the global tracing subscriber.
///
/// `NO_COLOR` disables ANSI escapes for file logging. `LOG_FORMAT=json`
/// switches to one JSON object per line.
pub fn init_tracing() {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = EnvFilter::new(filter_directives(rust_log.as_deref()));
    let no_color = std::env::var("NO_COLOR").is_ok();
    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let json_layer = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_timer(LocalTime)
            .with_current_span(false)
    });
    let text_layer = (!json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_timer(LocalTime)
            .with_ansi(!no_color)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}

/// Execute an async block with the request ID in scope.
///
/// ```ignore
/// with_request_context!(request_id, async {
///     // handler logic here
/// })
/// ```
#[macro_export]
macro_rules! with_request_context {
    ($request_id:expr, $body:expr) => {
        $crate::core::logging::REQUEST_ID
            .scope($request_id, $body)
            .await
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_id_get() {
        REQUEST_ID
            .scope("test-request-123".to_string(), async {
                assert_eq!(get_request_id(), "test-request-123");
            })
            .await;
    }

    #[tokio::test]
    async fn test_request_id_isolation() {
        let task1 = tokio::spawn(async {
            REQUEST_ID
                .scope("request-1".to_string(), async {
                    tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
                    get_request_id()
                })
                .await
        });

        let task2 = tokio::spawn(async {
            REQUEST_ID
                .scope("request-2".to_string(), async {
                    tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
                    get_request_id()
                })
                .await
        });

        assert_eq!(task1.await.unwrap(), "request-1");
        assert_eq!(task2.await.unwrap(), "request-2");
    }

    #[tokio::test]
    async fn test_request_id_default() {
        assert_eq!(get_request_id(), "");
    }

    #[tokio::test]
    async fn test_with_request_context_macro() {
        let seen = crate::with_request_context!("macro-id".to_string(), async {
            get_request_id()
        });
        assert_eq!(seen, "macro-id");
    }

    #[test]
    fn test_generate_request_id() {
        let id1 = generate_request_id();
        let id2 = generate_request_id();

        assert_eq!(id1.len(), 36);
        assert_ne!(id1, id2);

        let parts: Vec<&str> = id1.split('-').collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[4].len(), 12);
    }

    #[test]
    fn test_filter_directives() {
        assert_eq!(
            filter_directives(None),
            "info,llm_bridge_rust=debug,hyper=warn,hyper::proto=warn,h2=warn,reqwest=warn"
        );
        assert!(filter_directives(Some("trace")).starts_with("trace,hyper=warn"));
        assert!(filter_directives(Some("  ")).starts_with(DEFAULT_FILTER));
    }
}
