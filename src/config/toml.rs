//! TOML configuration file parsing

use super::Config;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse a TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from a string
pub fn parse_toml_string(contents: &str) -> Result<Config> {
    let config: Config =
        ::toml::from_str(contents).context("Failed to parse TOML configuration")?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::StageMask;

    #[test]
    fn minimal_config_round_trip() {
        let toml = r#"
            [manifest]
            path = "corpus.manifest"

            [pipeline]
            stages = 7
            output_format = "scheme"

            [cache]
            cache_dir = "/var/cache/docex"
            cache_size_mb = 2048

            [runtime]
            resume = true
        "#;
        let config = parse_toml_string(toml).unwrap();
        assert_eq!(config.pipeline.stages, StageMask(7));
        assert_eq!(config.cache.cache_size_mb, 2048);
        assert!(config.runtime.resume);
        assert_eq!(config.workers.chunk_size, 256);
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(parse_toml_string("this is not toml [").is_err());
    }
}
