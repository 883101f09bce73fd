//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::error::RuntimeError;

/// Install the global subscriber. `RUST_LOG` wins when set; otherwise
/// `debug` with `verbose`, `info` without. `format = "json"` emits one JSON
/// object per event.
pub fn init(verbose: bool, format: &str) -> Result<(), RuntimeError> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = match format {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| RuntimeError::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_reports_an_error() {
        let _ = init(false, "pretty");
        assert!(matches!(init(true, "json"), Err(RuntimeError::Logging(_))));
    }
}
