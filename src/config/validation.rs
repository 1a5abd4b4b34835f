use super::*;

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &WorkerConfig) -> ConfigResult<()> {
        Self::validate_model(config)?;
        Self::validate_server_settings(config)?;
        Self::validate_timeouts(config)?;
        Self::validate_embedding_limit(config)?;
        Self::validate_decode_workers(config)?;
        config.log_level()?;
        Ok(())
    }

    fn validate_model(config: &WorkerConfig) -> ConfigResult<()> {
        if config.model.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "model".to_string(),
            });
        }
        Ok(())
    }

    fn validate_server_settings(config: &WorkerConfig) -> ConfigResult<()> {
        if config.host.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "host".to_string(),
            });
        }

        if config.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "port".to_string(),
                value: config.port.to_string(),
                reason: "Port must be > 0".to_string(),
            });
        }

        if config.stream_buffer_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "stream_buffer_size".to_string(),
                value: config.stream_buffer_size.to_string(),
                reason: "Must be > 0".to_string(),
            });
        }

        Ok(())
    }

    fn validate_timeouts(config: &WorkerConfig) -> ConfigResult<()> {
        for (field, value) in [
            ("request_timeout_secs", config.request_timeout_secs),
            ("transfer_timeout_secs", config.transfer_timeout_secs),
            ("handle_retention_secs", config.handle_retention_secs),
            ("media.fetch_timeout_secs", config.media.fetch_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: value.to_string(),
                    reason: "Must be > 0".to_string(),
                });
            }
        }
        Ok(())
    }

    fn validate_embedding_limit(config: &WorkerConfig) -> ConfigResult<()> {
        if config.max_embedding_bytes == 0 || config.max_embedding_bytes > isize::MAX as usize {
            return Err(ConfigError::InvalidValue {
                field: "max_embedding_bytes".to_string(),
                value: config.max_embedding_bytes.to_string(),
                reason: format!("Must be between 1 and {}", isize::MAX),
            });
        }
        Ok(())
    }

    fn validate_decode_workers(config: &WorkerConfig) -> ConfigResult<()> {
        if config.is_prefill_worker && config.mode == WorkerMode::Decode {
            return Err(ConfigError::IncompatibleConfig {
                reason: "is_prefill_worker requires prefill_decode mode".to_string(),
            });
        }

        if config.enable_disagg() && config.decode_worker_urls.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "decode_worker_urls".to_string(),
            });
        }

        for url in &config.decode_worker_urls {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::InvalidValue {
                    field: "decode_worker_urls".to_string(),
                    value: url.clone(),
                    reason: "URL must start with http:// or https://".to_string(),
                });
            }
        }

        Ok(())
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        ConfigValidator::validate(self)
    }
}
