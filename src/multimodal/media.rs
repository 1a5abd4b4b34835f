use std::{collections::HashSet, path::PathBuf, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use bytes::Bytes;
use image::DynamicImage;
use reqwest::Client;
use tokio::{fs, task};
use url::Url;

use super::error::MediaConnectorError;

#[derive(Debug, Clone)]
pub struct MediaConnectorConfig {
    pub allowed_domains: Option<Vec<String>>,
    pub allowed_local_media_path: Option<PathBuf>,
    pub fetch_timeout: Duration,
}

impl Default for MediaConnectorConfig {
    fn default() -> Self {
        Self {
            allowed_domains: None,
            allowed_local_media_path: None,
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    Url(String),
    DataUrl(String),
    File(PathBuf),
}

impl MediaSource {
    pub fn from_reference(reference: &str) -> Result<Self, MediaConnectorError> {
        if reference.starts_with("data:") {
            return Ok(MediaSource::DataUrl(reference.to_string()));
        }
        if reference.starts_with("http://") || reference.starts_with("https://") {
            return Ok(MediaSource::Url(reference.to_string()));
        }
        if let Some(path) = reference.strip_prefix("file://") {
            return Ok(MediaSource::File(PathBuf::from(path)));
        }
        let path = PathBuf::from(reference);
        if path.is_absolute() {
            return Ok(MediaSource::File(path));
        }
        Err(MediaConnectorError::UnsupportedScheme(reference.to_string()))
    }
}

/// Fetches and decodes referenced images.
#[derive(Clone)]
pub struct MediaConnector {
    client: Client,
    allowed_domains: Option<HashSet<String>>,
    allowed_local_media_path: Option<PathBuf>,
    fetch_timeout: Duration,
}

impl MediaConnector {
    pub fn new(client: Client, config: MediaConnectorConfig) -> Result<Self, MediaConnectorError> {
        let allowed_domains = config.allowed_domains.map(|domains| {
            domains
                .into_iter()
                .map(|d| d.to_ascii_lowercase())
                .collect::<HashSet<_>>()
        });

        let allowed_local_media_path = if let Some(path) = config.allowed_local_media_path {
            Some(std::fs::canonicalize(path)?)
        } else {
            None
        };

        Ok(Self {
            client,
            allowed_domains,
            allowed_local_media_path,
            fetch_timeout: config.fetch_timeout,
        })
    }

    pub async fn fetch_image(&self, source: MediaSource) -> Result<DynamicImage, MediaConnectorError> {
        let bytes = match source {
            MediaSource::Url(url) => self.fetch_http(url).await?,
            MediaSource::DataUrl(data_url) => Self::decode_data_url(&data_url)?,
            MediaSource::File(path) => self.fetch_file(path).await?,
        };
        Self::decode_image(bytes).await
    }

    async fn fetch_http(&self, url: String) -> Result<Bytes, MediaConnectorError> {
        let parsed = Url::parse(&url).map_err(|_| MediaConnectorError::InvalidUrl(url.clone()))?;
        self.ensure_domain_allowed(&parsed)?;

        let mut req = self.client.get(parsed.as_str());
        if self.fetch_timeout > Duration::ZERO {
            req = req.timeout(self.fetch_timeout);
        }

        let resp = req.send().await.map_err(|err| {
            if err.is_timeout() {
                MediaConnectorError::Timeout(self.fetch_timeout)
            } else {
                MediaConnectorError::Http(err)
            }
        })?;

        let resp = resp.error_for_status()?;
        Ok(resp.bytes().await?)
    }

    fn decode_data_url(data_url: &str) -> Result<Bytes, MediaConnectorError> {
        let (metadata, data) = data_url
            .split_once(',')
            .ok_or_else(|| MediaConnectorError::DataUrl("missing comma in data url".into()))?;

        if !metadata.ends_with(";base64") {
            return Err(MediaConnectorError::DataUrl(
                "only base64 encoded data URLs are supported".into(),
            ));
        }

        Ok(BASE64_STANDARD.decode(data.trim())?.into())
    }

    async fn fetch_file(&self, path: PathBuf) -> Result<Bytes, MediaConnectorError> {
        let allowed_root = self
            .allowed_local_media_path
            .as_ref()
            .ok_or_else(|| MediaConnectorError::DisallowedLocalPath(path.display().to_string()))?;

        let canonical = fs::canonicalize(&path).await?;
        if !canonical.starts_with(allowed_root) {
            return Err(MediaConnectorError::DisallowedLocalPath(
                path.display().to_string(),
            ));
        }

        Ok(fs::read(&canonical).await?.into())
    }

    fn ensure_domain_allowed(&self, url: &Url) -> Result<(), MediaConnectorError> {
        if let Some(allowed) = &self.allowed_domains {
            let host = url
                .host_str()
                .map(|h| h.to_ascii_lowercase())
                .ok_or_else(|| MediaConnectorError::InvalidUrl(url.to_string()))?;
            if !allowed.contains(&host) {
                return Err(MediaConnectorError::DisallowedDomain(host));
            }
        }
        Ok(())
    }

    async fn decode_image(bytes: Bytes) -> Result<DynamicImage, MediaConnectorError> {
        let image = task::spawn_blocking(move || image::load_from_memory(&bytes)).await??;
        Ok(image)
    }
}
