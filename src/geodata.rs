use crate::config::AgentConfig;
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;

pub const GEOIP_URL: &str =
    "https://github.com/Loyalsoldier/v2ray-rules-dat/releases/latest/download/geoip.dat";
pub const GEOSITE_URL: &str =
    "https://github.com/Loyalsoldier/v2ray-rules-dat/releases/latest/download/geosite.dat";

/// Data files older than this are downloaded again.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug)]
struct GeoAsset {
    name: &'static str,
    path: PathBuf,
    url: String,
}

/// Keeps the engine's geoip/geosite routing data present and fresh.
pub struct GeoAssets {
    assets: Vec<GeoAsset>,
    client: reqwest::Client,
    max_age: Duration,
}

impl GeoAssets {
    /// Returns `None` unless both data file paths are configured.
    pub fn from_config(config: &AgentConfig) -> Result<Option<Self>> {
        let (Some(geoip), Some(geosite)) = (&config.files.geoip, &config.files.geosite) else {
            return Ok(None);
        };
        let assets = vec![
            GeoAsset {
                name: "geoip.dat",
                path: geoip.clone(),
                url: config
                    .engine
                    .geoip_url
                    .clone()
                    .unwrap_or_else(|| GEOIP_URL.to_string()),
            },
            GeoAsset {
                name: "geosite.dat",
                path: geosite.clone(),
                url: config
                    .engine
                    .geosite_url
                    .clone()
                    .unwrap_or_else(|| GEOSITE_URL.to_string()),
            },
        ];
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .context("failed to build geo data http client")?;
        Ok(Some(Self {
            assets,
            client,
            max_age: REFRESH_INTERVAL,
        }))
    }

    /// Downloads every data file that is missing or stale. Each file is
    /// attempted even when an earlier one fails; the failures are reported
    /// together.
    pub async fn ensure(&self) -> Result<()> {
        let mut failures = Vec::new();
        for asset in &self.assets {
            if let Err(err) = self.ensure_asset(asset).await {
                tracing::warn!(file = asset.name, error = %format!("{:#}", err), "geo data update failed");
                failures.push(format!("{:#}", err));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("failed to update geo data: {}", failures.join("; ")))
        }
    }

    async fn ensure_asset(&self, asset: &GeoAsset) -> Result<bool> {
        if let Some(parent) = asset.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("failed to create geo data directory {}", parent.display())
                })?;
            }
        }

        match tokio::fs::metadata(&asset.path).await {
            Ok(metadata) => {
                let age = metadata
                    .modified()
                    .ok()
                    .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                    .unwrap_or_default();
                if age < self.max_age {
                    tracing::info!(file = asset.name, age_hours = age.as_secs() / 3600, "geo data is fresh");
                    return Ok(false);
                }
                tracing::info!(file = asset.name, age_hours = age.as_secs() / 3600, "geo data is stale, updating");
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(file = asset.name, "geo data missing, downloading");
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to stat {}", asset.path.display()));
            }
        }

        let written = self.download(asset).await?;
        tracing::info!(file = asset.name, bytes = written, "geo data downloaded");
        Ok(true)
    }

    async fn download(&self, asset: &GeoAsset) -> Result<u64> {
        let tmp = tmp_path(&asset.path);
        let result = self.download_to(asset, &tmp).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        result
    }

    async fn download_to(&self, asset: &GeoAsset, tmp: &Path) -> Result<u64> {
        let mut response = self
            .client
            .get(&asset.url)
            .send()
            .await
            .with_context(|| format!("failed to download {}", asset.name))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("failed to download {}: HTTP {}", asset.name, status));
        }

        let mut file = tokio::fs::File::create(tmp)
            .await
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .with_context(|| format!("failed to read {}", asset.name))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(tmp, &asset.path)
            .await
            .with_context(|| format!("failed to move {} into place", asset.name))?;
        Ok(written)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(".tmp");
    PathBuf::from(raw)
}
