//! Harness logging setup.
//!
//! Every module logs through `tracing`; this installs the process-wide
//! subscriber once, from the CLI.

use lcevc_functest_error::{FunctestError, Result};
use tracing_subscriber::EnvFilter;

/// Map a `LOG_LEVEL` config value onto a tracing filter directive.
pub fn level_directive(level: &str) -> Result<&'static str> {
    match level.to_ascii_uppercase().as_str() {
        "DEBUG" => Ok("debug"),
        "INFO" => Ok("info"),
        "WARNING" | "WARN" => Ok("warn"),
        "ERROR" | "CRITICAL" => Ok("error"),
        other => Err(FunctestError::config(format!(
            "LOG_LEVEL must be one of DEBUG, INFO, WARNING, ERROR or CRITICAL, not '{other}'"
        ))),
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `level`.
pub fn init_logging(level: &str, json: bool) -> Result<()> {
    let directive = level_directive(level)?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(false);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|err| FunctestError::config(format!("failed to install logger: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_style_levels_map_onto_tracing() {
        assert_eq!(level_directive("DEBUG").unwrap(), "debug");
        assert_eq!(level_directive("warning").unwrap(), "warn");
        assert_eq!(level_directive("CRITICAL").unwrap(), "error");
        assert!(level_directive("VERBOSE").is_err());
    }
}
