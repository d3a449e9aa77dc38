use crate::gadgetpatch::arch::Architecture;
use crate::gadgetpatch::config::UpstreamConfig;
use crate::gadgetpatch::error::{PatchError, Result};
use crate::gadgetpatch::gadget::{GadgetSource, normalize_version};
use crate::gadgetpatch::tui::progress::create_bytes_progress;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio_stream::StreamExt;
use tracing::{debug, info};

/// Upper bound on trusting Content-Length for the download buffer; gadgets
/// are well under this.
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// Gadget binaries from frida's GitHub releases.
#[derive(Debug, Clone)]
pub struct GithubReleases {
    client: reqwest::Client,
    upstream: UpstreamConfig,
}

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
}

impl GithubReleases {
    pub fn new(upstream: &UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(upstream.user_agent.as_str())
            .build()
            .map_err(|e| PatchError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            upstream: upstream.clone(),
        })
    }

    fn latest_url(&self) -> String {
        format!(
            "{}/repos/frida/frida/releases/latest",
            self.upstream.api_base.trim_end_matches('/')
        )
    }

    fn asset_url(&self, version: &str, architecture: Architecture) -> String {
        format!(
            "{}/{version}/frida-gadget-{version}-android-{}.so.xz",
            self.upstream.download_base.trim_end_matches('/'),
            architecture.asset_token()
        )
    }
}

fn download_buffer(content_length: u64) -> Vec<u8> {
    Vec::with_capacity(content_length.min(MAX_PREALLOCATION) as usize)
}

fn network(url: &str, e: reqwest::Error) -> PatchError {
    PatchError::Network(format!("{url}: {e}"))
}

impl GadgetSource for GithubReleases {
    async fn latest_version(&self) -> Result<String> {
        let url = self.latest_url();
        debug!("GET {url}");

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| network(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PatchError::Network(format!("{url}: HTTP {status}")));
        }

        let release: Release = response.json().await.map_err(|e| network(&url, e))?;
        let version = normalize_version(&release.tag_name).map_err(|e| {
            PatchError::InvalidInput(format!("{url} returned an unusable release tag: {e}"))
        })?;
        info!("Latest frida release is {version}");

        Ok(version)
    }

    async fn fetch(&self, version: &str, architecture: Architecture) -> Result<Vec<u8>> {
        let url = self.asset_url(version, architecture);
        info!("Downloading {url}");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| network(&url, e))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                return Err(PatchError::NotFound {
                    version: version.to_string(),
                    architecture,
                });
            }
            status if !status.is_success() => {
                return Err(PatchError::Network(format!("{url}: HTTP {status}")));
            }
            _ => {}
        }

        let total_size = response.content_length().unwrap_or(0);
        let pb = create_bytes_progress(
            format!("frida-gadget {version} ({architecture})"),
            total_size,
        );

        let mut bytes = download_buffer(total_size);
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    pb.abandon();
                    return Err(network(&url, e));
                }
            };
            bytes.extend_from_slice(&chunk);
            pb.inc(chunk.len() as u64);
        }

        pb.finish_and_clear();
        debug!("Downloaded {} bytes from {url}", bytes.len());

        Ok(bytes)
    }
}
