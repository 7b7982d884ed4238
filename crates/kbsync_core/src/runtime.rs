use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::default_config_toml;

pub const STATE_DIR_NAME: &str = ".kbsync";
pub const DB_FILE_NAME: &str = "kbsync.db";
pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

/// Everything path-shaped the runtime needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub files_dir: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\ndata_dir={} ({})\ndb_path={}\nfiles_dir={}\nconfig_path={} ({})",
            normalize_path(&self.project_root),
            self.root_source.as_str(),
            normalize_path(&self.state_dir),
            normalize_path(&self.data_dir),
            self.data_source.as_str(),
            normalize_path(&self.db_path),
            normalize_path(&self.files_dir),
            normalize_path(&self.config_path),
            self.config_source.as_str(),
        )
    }
}

/// Resolve the runtime layout: flag > env > defaults under the current
/// directory.
pub fn resolve_paths(overrides: &PathOverrides) -> Result<ResolvedPaths> {
    let cwd = env::current_dir().context("failed to read current directory")?;

    let (project_root, root_source) = resolve_value(
        overrides.project_root.clone(),
        "KBSYNC_PROJECT_ROOT",
        || cwd.clone(),
    );
    let state_dir = project_root.join(STATE_DIR_NAME);

    let (data_dir, data_source) = resolve_value(overrides.data_dir.clone(), "KBSYNC_DATA_DIR", || {
        state_dir.join("data")
    });
    let (config_path, config_source) =
        resolve_value(overrides.config.clone(), "KBSYNC_CONFIG", || {
            state_dir.join(CONFIG_FILE_NAME)
        });

    Ok(ResolvedPaths {
        db_path: data_dir.join(DB_FILE_NAME),
        files_dir: data_dir.join("files"),
        project_root,
        state_dir,
        data_dir,
        config_path,
        root_source,
        data_source,
        config_source,
    })
}

fn resolve_value(
    flag: Option<PathBuf>,
    env_key: &str,
    default: impl FnOnce() -> PathBuf,
) -> (PathBuf, ValueSource) {
    if let Some(value) = flag {
        return (value, ValueSource::Flag);
    }
    if let Ok(value) = env::var(env_key) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return (PathBuf::from(trimmed), ValueSource::Env);
        }
    }
    (default(), ValueSource::Default)
}

#[derive(Debug, Clone, Default)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

/// Create the state layout and a default config file. Existing files are
/// left untouched.
pub fn init_layout(paths: &ResolvedPaths) -> Result<InitReport> {
    let mut report = InitReport::default();
    for dir in [&paths.state_dir, &paths.data_dir, &paths.files_dir] {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            report.created_dirs.push(dir.clone());
        }
    }
    if !paths.config_path.exists() {
        if let Some(parent) = paths.config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&paths.config_path, default_config_toml())
            .with_context(|| format!("failed to write {}", paths.config_path.display()))?;
        report.wrote_config = true;
    }
    Ok(report)
}

pub fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
