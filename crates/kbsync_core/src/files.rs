use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

use crate::store::BlobStore;

/// Filesystem-backed blob store rooted at the runtime files directory.
/// Stored blobs are addressed by a site-relative URL under the configured
/// public prefix, e.g. `/files/images/logo.png`.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    files_dir: PathBuf,
    public_prefix: String,
}

impl FileBlobStore {
    pub fn new(files_dir: impl Into<PathBuf>, public_prefix: impl Into<String>) -> Self {
        Self {
            files_dir: files_dir.into(),
            public_prefix: public_prefix.into(),
        }
    }
}

impl BlobStore for FileBlobStore {
    fn exists(&mut self, relative_path: &str) -> bool {
        if validate_component_chain(relative_path).is_err() {
            return false;
        }
        self.files_dir.join(relative_path).exists()
    }

    fn write_file(&mut self, directory: &str, filename: &str, bytes: &[u8]) -> Result<String> {
        validate_component_chain(directory)?;
        validate_component(filename)?;

        let target_dir = self.files_dir.join(directory);
        fs::create_dir_all(&target_dir)
            .with_context(|| format!("failed to create {}", target_dir.display()))?;
        let target = target_dir.join(filename);
        fs::write(&target, bytes)
            .with_context(|| format!("failed to write {}", target.display()))?;

        Ok(self.public_url(&format!("{directory}/{filename}")))
    }

    fn public_url(&self, relative_path: &str) -> String {
        format!(
            "{}/{}",
            self.public_prefix.trim_end_matches('/'),
            relative_path.trim_start_matches('/')
        )
    }
}

/// Blob names come from feed payloads; keep them inside the files root.
fn validate_component(component: &str) -> Result<()> {
    if component.is_empty() {
        bail!("blob path component is empty");
    }
    if component == "." || component == ".." {
        bail!("blob path component {component:?} is not allowed");
    }
    if component.contains('/') || component.contains('\\') {
        bail!("blob path component {component:?} contains a separator");
    }
    Ok(())
}

fn validate_component_chain(path: &str) -> Result<()> {
    for component in path.split('/') {
        validate_component(component)?;
    }
    Ok(())
}
