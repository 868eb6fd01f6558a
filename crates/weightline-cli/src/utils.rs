use anyhow::Result;
use std::io;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use weightline_bridge::ErrorCode;

/// Install the stderr subscriber; `log` records from the libraries are
/// forwarded to it.
pub fn setup_logging(verbose: bool, quiet: bool) -> Result<()> {
    let log_level = if quiet {
        tracing::Level::ERROR
    } else if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    let filter = if verbose || quiet {
        EnvFilter::new(log_level.to_string())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init()?;

    Ok(())
}

/// Process exit status for a failed command: the code of the first
/// conversion error in the chain
pub fn exit_code(error: &anyhow::Error) -> i32 {
    let code = error
        .chain()
        .find_map(|cause| cause.downcast_ref::<weightline_core::Error>())
        .map_or(ErrorCode::GenericFailure, ErrorCode::from);
    code as i32
}

/// Human-readable byte count
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_exit_code_from_root_cause() {
        let err: Result<()> = Err(weightline_core::Error::MissingField("model_type".into()))
            .context("converting /models/x");
        assert_eq!(exit_code(&err.unwrap_err()), 11);
        assert_eq!(exit_code(&anyhow::anyhow!("usage")), 1);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MiB");
    }
}
