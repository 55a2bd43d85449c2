use tracing_subscriber::EnvFilter;

use crate::env_optional;

/// `ICRON_LOG` wins over `RUST_LOG`; without either, `info` (or `debug` when verbose).
pub(crate) fn filter_directive(verbose: bool, lookup: impl Fn(&str) -> Option<String>) -> String {
    lookup("ICRON_LOG")
        .or_else(|| lookup("RUST_LOG"))
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| if verbose { "debug" } else { "info" }.to_string())
}

/// Diagnostics go to stderr so chat output on stdout stays clean.
pub(crate) fn init_logging(verbose: bool) {
    let directive = filter_directive(verbose, env_optional);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_precedence() {
        let none = |_: &str| None;
        assert_eq!(filter_directive(false, none), "info");
        assert_eq!(filter_directive(true, none), "debug");
        let both = |k: &str| match k {
            "ICRON_LOG" => Some("agent=trace".to_string()),
            "RUST_LOG" => Some("warn".to_string()),
            _ => None,
        };
        assert_eq!(filter_directive(true, both), "agent=trace");
        let rust_only = |k: &str| (k == "RUST_LOG").then(|| "warn".to_string());
        assert_eq!(filter_directive(false, rust_only), "warn");
    }
}
