use ferrous_forward_domain::{Config, LoggingConfig};
use tracing_subscriber::EnvFilter;

/// Loads and validates the configuration, applying command-line overrides.
pub fn load_config(path: Option<&str>, log_level: Option<&str>) -> anyhow::Result<Config> {
    let mut config = Config::load(path)?;
    if let Some(level) = log_level {
        config.logging.level = level.to_string();
    }
    Ok(config)
}

/// `RUST_LOG` wins over the configured level.
pub fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("Logging already initialised: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_log_level_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "[logging]\nlevel = \"warn\"\n\n[[upstreams]]\ntag = \"a\"\ntype = \"udp\"\naddress = \"127.0.0.1:53\"\n"
        )
        .unwrap();
        let path = file.path().to_str().unwrap();

        let config = load_config(Some(path), None).unwrap();
        assert_eq!(config.logging.level, "warn");

        let config = load_config(Some(path), Some("trace")).unwrap();
        assert_eq!(config.logging.level, "trace");
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(load_config(Some("/nonexistent/ferrous-forward.toml"), None).is_err());
    }
}
