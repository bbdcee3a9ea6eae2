//! Logging setup and configuration

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Crates whose output follows the configured level
const WORKSPACE_CRATES: &[&str] = &["hwbus", "daemon", "common", "protocol"];

/// Build the filter used by [`setup_logging`]
///
/// `RUST_LOG` wins when set. Otherwise a bare level such as `"debug"` applies
/// to the workspace crates only while dependencies stay at `warn`; anything
/// else is parsed as a full filter directive.
pub fn build_filter(default_level: &str) -> crate::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let directives = if default_level.contains('=') || default_level.contains(',') {
        default_level.to_string()
    } else {
        let mut directives = vec!["warn".to_string()];
        directives.extend(
            WORKSPACE_CRATES
                .iter()
                .map(|krate| format!("{}={}", krate, default_level)),
        );
        directives.join(",")
    };

    EnvFilter::try_new(&directives)
        .map_err(|e| crate::Error::Config(format!("Invalid log filter '{}': {}", directives, e)))
}

/// Setup tracing subscriber for the application
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = build_filter(default_level)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| crate::Error::Config(format!("Logging already initialised: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_level_scoped_to_workspace() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let filter = build_filter("debug").unwrap();
        let rendered = filter.to_string();
        assert!(rendered.contains("common=debug"));
        assert!(rendered.contains("warn"));
    }

    #[test]
    fn test_invalid_directive_rejected() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        assert!(build_filter("common=notalevel").is_err());
    }
}
