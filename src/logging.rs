//! Tracing subscriber setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Reduce a configured log level to one `tracing` understands.
///
/// Only the first word counts (`"INFO  # default"` is `info`). `warning` and `critical` are
/// accepted as aliases; anything else falls back to `info`.
pub fn normalize_level(raw: &str) -> &'static str {
    let word = raw.split_whitespace().next().unwrap_or_default().to_lowercase();
    match word.as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" | "warning" => "warn",
        "error" | "critical" => "error",
        _ => "info",
    }
}

fn default_directives(level: &str) -> String {
    let level = normalize_level(level);
    format!("claude_bridge={level},tower_http={level}")
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `level`.
pub fn init(level: &str) {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_directives(level))),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_level() {
        assert_eq!(normalize_level("DEBUG"), "debug");
        assert_eq!(normalize_level("warning"), "warn");
        assert_eq!(normalize_level("CRITICAL"), "error");
        assert_eq!(normalize_level("info   # the default"), "info");
        assert_eq!(normalize_level("verbose"), "info");
        assert_eq!(normalize_level(""), "info");
    }

    #[test]
    fn test_default_directives() {
        assert_eq!(
            default_directives("Warning"),
            "claude_bridge=warn,tower_http=warn"
        );
    }
}
