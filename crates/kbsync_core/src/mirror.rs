use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use regex::Regex;
use reqwest::blocking::Client;
use tracing::info;

use crate::diagnostics::{DiagnosticsLog, steps};
use crate::store::BlobStore;

static IMG_SRC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<img[^>]+src="([^"]+)""#).unwrap());

const IMAGES_DIRECTORY: &str = "images";

/// A fetched remote image plus the content type the server reported.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

pub trait ImageFetcher {
    fn fetch(&mut self, url: &str) -> Result<FetchedImage>;
}

pub struct HttpImageFetcher {
    client: Client,
}

impl HttpImageFetcher {
    pub fn new(timeout_ms: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .context("failed to build image HTTP client")?;
        Ok(Self { client })
    }
}

impl ImageFetcher for HttpImageFetcher {
    fn fetch(&mut self, url: &str) -> Result<FetchedImage> {
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("failed to download image {url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("image request for {url} failed with HTTP {status}");
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);
        let bytes = response
            .bytes()
            .with_context(|| format!("failed to read image body from {url}"))?
            .to_vec();
        Ok(FetchedImage {
            bytes,
            content_type,
        })
    }
}

/// Downloads source-domain images into the blob store and rewrites `src`
/// attributes to the stored copy. Active only in development mode.
pub struct ImageMirror {
    fetcher: Box<dyn ImageFetcher>,
    blobs: Box<dyn BlobStore>,
    source_domain: String,
}

impl ImageMirror {
    pub fn new(
        fetcher: Box<dyn ImageFetcher>,
        blobs: Box<dyn BlobStore>,
        source_domain: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            blobs,
            source_domain: source_domain.into(),
        }
    }

    /// Rewrite every mirrored `<img src>` in `content`. Failures skip the
    /// individual image and end up in the diagnostics ledger; the content
    /// is still returned with every successful rewrite applied.
    pub fn mirror_images(
        &mut self,
        content: &str,
        external_id: &str,
        diagnostics: &mut DiagnosticsLog,
    ) -> String {
        let sources: Vec<String> = IMG_SRC
            .captures_iter(content)
            .map(|caps| caps[1].to_string())
            .collect();

        let mut result = content.to_string();
        let mut failures = Vec::new();
        for src in sources {
            if !src.contains(&self.source_domain) {
                continue;
            }
            match self.localize(&src) {
                Ok(Some(local_url)) => {
                    result = result.replace(&src, &local_url);
                }
                Ok(None) => {}
                Err(error) => failures.push(format!("{src}: {error:#}")),
            }
        }

        if failures.is_empty() {
            diagnostics.record_success(external_id, steps::MIRROR_IMAGES);
        } else {
            diagnostics.record_failure(external_id, steps::MIRROR_IMAGES, failures.join("; "));
        }
        result
    }

    /// Store one remote image locally, reusing an existing blob when the
    /// name was mirrored before. Returns the local URL, or `None` when the
    /// URL has no usable file name.
    fn localize(&mut self, src: &str) -> Result<Option<String>> {
        let Some(name) = image_name_from_url(src) else {
            return Ok(None);
        };

        let relative = format!("{IMAGES_DIRECTORY}/{name}");
        if self.blobs.exists(&relative) {
            return Ok(Some(self.blobs.public_url(&relative)));
        }

        let fetched = self.fetcher.fetch(src)?;
        let filename = filename_with_extension(&name, fetched.content_type.as_deref());
        let url = self
            .blobs
            .write_file(IMAGES_DIRECTORY, &filename, &fetched.bytes)?;
        info!(src, local = %url, "mirrored image");
        Ok(Some(url))
    }
}

fn image_name_from_url(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let name = without_query.rsplit('/').next().unwrap_or("");
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Keep the original name when it already carries an extension; otherwise
/// derive one from the reported content type.
fn filename_with_extension(name: &str, content_type: Option<&str>) -> String {
    if name.contains('.') {
        return name.to_string();
    }
    let extension = match content_type.map(|value| value.split(';').next().unwrap_or(value).trim())
    {
        Some("image/png") => ".png",
        Some("image/jpeg") => ".jpg",
        Some("image/gif") => ".gif",
        Some("image/webp") => ".webp",
        Some("image/svg+xml") => ".svg",
        _ => "",
    };
    format!("{name}{extension}")
}
