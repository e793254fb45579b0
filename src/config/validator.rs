//! Configuration validation

use super::*;
use anyhow::Result;

/// Validate a complete configuration
///
/// Any failure here is a configuration error: the process reports it and
/// exits with status 1 before touching the manifest.
pub fn validate_config(config: &Config) -> Result<()> {
    validate_manifest(&config.manifest)?;
    validate_workers(&config.workers)?;
    validate_cache(&config.cache)?;
    validate_output(&config.output)?;
    validate_runtime(&config.runtime)?;
    validate_cluster(&config.cluster)?;

    Ok(())
}

fn validate_manifest(manifest: &ManifestConfig) -> Result<()> {
    if manifest.path.as_os_str().is_empty() {
        anyhow::bail!("manifest path must not be empty");
    }
    Ok(())
}

fn validate_workers(workers: &WorkerConfig) -> Result<()> {
    if workers.chunk_size == 0 {
        anyhow::bail!("chunk_size must be at least 1");
    }
    if workers.chunk_size > 1_000_000 {
        anyhow::bail!(
            "chunk_size {} is unreasonably large (max 1000000)",
            workers.chunk_size
        );
    }
    if workers.threads > 4096 {
        anyhow::bail!("threads must be at most 4096, got {}", workers.threads);
    }
    if workers.prefetch_window == 0 {
        anyhow::bail!("prefetch_window must be at least 1");
    }
    Ok(())
}

fn validate_cache(cache: &CacheConfig) -> Result<()> {
    if cache.cache_size_mb == 0 {
        anyhow::bail!("cache_size_mb must be at least 1");
    }
    if let Some(ref addr) = cache.l2_address {
        if !addr.starts_with("redis://") && !addr.contains(':') {
            anyhow::bail!(
                "l2_address must be \"redis://host:port\" or \"host:port\", got {}",
                addr
            );
        }
    }
    Ok(())
}

fn validate_output(output: &OutputConfig) -> Result<()> {
    if output.progress_interval_secs == 0 {
        anyhow::bail!("progress_interval_secs must be at least 1");
    }
    if output.shard_buffer_bytes == 0 {
        anyhow::bail!("shard_buffer_bytes must be at least 1");
    }
    if output.shard_max_bytes < output.shard_buffer_bytes as u64 {
        anyhow::bail!(
            "shard_max_bytes ({}) must be at least shard_buffer_bytes ({})",
            output.shard_max_bytes,
            output.shard_buffer_bytes
        );
    }
    Ok(())
}

fn validate_runtime(runtime: &RuntimeConfig) -> Result<()> {
    if runtime.doc_timeout_secs == 0 {
        anyhow::bail!("doc_timeout_secs must be at least 1");
    }
    if runtime.checkpoint_interval_docs == 0 {
        anyhow::bail!("checkpoint_interval_docs must be at least 1");
    }
    if runtime.max_retries > 10 {
        anyhow::bail!("max_retries must be at most 10, got {}", runtime.max_retries);
    }
    Ok(())
}

fn validate_cluster(cluster: &ClusterConfig) -> Result<()> {
    if cluster.num_locales == 0 {
        anyhow::bail!("num_locales must be at least 1");
    }
    if cluster.locale_id >= cluster.num_locales {
        anyhow::bail!(
            "locale_id {} out of range for num_locales {}",
            cluster.locale_id,
            cluster.num_locales
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn base_config() -> Config {
        Config {
            manifest: ManifestConfig {
                path: PathBuf::from("corpus.manifest"),
                mode: ManifestMode::Shared,
                export_assignment: None,
            },
            pipeline: PipelineConfig {
                stages: crate::abi::StageMask::FAST,
                output_format: crate::abi::OutputFormat::Json,
                conduit_enabled: true,
                model_dir: None,
            },
            cache: CacheConfig::default(),
            workers: WorkerConfig::default(),
            output: OutputConfig::default(),
            runtime: RuntimeConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(validate_config(&base_config()).is_ok());
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let mut config = base_config();
        config.workers.chunk_size = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn locale_id_must_be_in_range() {
        let mut config = base_config();
        config.cluster.num_locales = 4;
        config.cluster.locale_id = 4;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn bad_l2_address_rejected() {
        let mut config = base_config();
        config.cache.l2_address = Some("nonsense".into());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut config = base_config();
        config.runtime.doc_timeout_secs = 0;
        assert!(validate_config(&config).is_err());
    }
}
