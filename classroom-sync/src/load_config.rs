/// `load_config` module: reads the optional YAML settings file and overlays
/// environment variables onto it.
///
/// This module is the only place where user-supplied YAML is parsed. Every field has a
/// default, so a missing default-location file is not an error; an explicitly named
/// file that cannot be read is.
///
/// # Environment overrides
/// - `CLASSROOM_SYNC_ADMIN_USER`: operator account used in foreign-domain mode
/// - `CLASSROOM_SYNC_API_BASE`: base URL of the classroom REST API
///
/// # Errors
/// All errors in this module use `anyhow::Error` and are surfaced at the CLI boundary.
use anyhow::{Context, Result};
use classroom_sync_core::config::{RetryPolicy, RosterPaths, SyncOptions};
use classroom_sync_core::fanout::DEFAULT_CONCURRENCY;
use classroom_sync_core::models::CourseRole;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

pub const DEFAULT_CONFIG_PATH: &str = "classroom-sync.yaml";
pub const DEFAULT_API_BASE: &str = "https://classroom.googleapis.com/v1";

pub const ENV_ADMIN_USER: &str = "CLASSROOM_SYNC_ADMIN_USER";
pub const ENV_API_BASE: &str = "CLASSROOM_SYNC_API_BASE";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub paths: RosterPaths,
    pub admin_user: Option<String>,
    pub teacher_email_domain: Option<String>,
    /// Anchored regex class codes must match to be looked up in the registry.
    pub class_code_pattern: Option<String>,
    pub concurrency: usize,
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
    pub skip_unknown_class: bool,
    pub dedupe_enrollments: bool,
    pub api_base: String,
    pub auth: AuthSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// Installed-app client secret downloaded from the cloud console.
    pub credentials: PathBuf,
    /// Directory holding `token.<profile>.json` files.
    pub token_dir: PathBuf,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            credentials: PathBuf::from("credentials.json"),
            token_dir: PathBuf::from("."),
        }
    }
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            paths: RosterPaths::default(),
            admin_user: None,
            teacher_email_domain: None,
            class_code_pattern: None,
            concurrency: DEFAULT_CONCURRENCY,
            timeout_secs: 30,
            retry: RetryPolicy::default(),
            skip_unknown_class: true,
            dedupe_enrollments: true,
            api_base: DEFAULT_API_BASE.to_string(),
            auth: AuthSection::default(),
        }
    }
}

impl CliConfig {
    /// Engine options for one command. Flags win over file and environment.
    pub fn sync_options(&self, dry_run: bool, foreign_domain: bool, teacher: bool) -> SyncOptions {
        SyncOptions {
            dry_run,
            admin_user: self.admin_user.clone(),
            teacher_email_domain: self.teacher_email_domain.clone(),
            foreign_domain,
            member_role: if teacher {
                CourseRole::Teacher
            } else {
                CourseRole::Student
            },
            concurrency: self.concurrency,
            call_timeout: Duration::from_secs(self.timeout_secs),
            retry: self.retry.clone(),
            skip_unknown_class: self.skip_unknown_class,
            dedupe_enrollments: self.dedupe_enrollments,
        }
    }

    fn apply_env(&mut self) {
        if let Ok(admin) = std::env::var(ENV_ADMIN_USER) {
            if !admin.trim().is_empty() {
                info!(env = ENV_ADMIN_USER, "Admin user taken from environment");
                self.admin_user = Some(admin.trim().to_string());
            }
        }
        if let Ok(base) = std::env::var(ENV_API_BASE) {
            if !base.trim().is_empty() {
                info!(env = ENV_API_BASE, api_base = %base, "API base taken from environment");
                self.api_base = base.trim().trim_end_matches('/').to_string();
            }
        }
    }
}

/// Load settings from `path`, or from [`DEFAULT_CONFIG_PATH`] when it exists, or
/// fall back to defaults. Environment overrides are applied last.
pub fn load_config(path: Option<&Path>) -> Result<CliConfig> {
    let mut config = match path {
        Some(path) => read_config(path)?,
        None => {
            let default_path = Path::new(DEFAULT_CONFIG_PATH);
            if default_path.exists() {
                read_config(default_path)?
            } else {
                info!(config_path = DEFAULT_CONFIG_PATH, "No config file; using defaults");
                CliConfig::default()
            }
        }
    };
    config.apply_env();
    Ok(config)
}

fn read_config(path_ref: &Path) -> Result<CliConfig> {
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!(
                "Failed to read config file {:?}: {}",
                path_ref,
                e
            ));
        }
    };

    // An empty file is valid and means "all defaults".
    if config_content.trim().is_empty() {
        return Ok(CliConfig::default());
    }

    let config: CliConfig = serde_yaml::from_str(&config_content)
        .map_err(|e| {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            e
        })
        .with_context(|| format!("Failed to parse config YAML {}", path_ref.display()))?;
    info!(config_path = ?path_ref, "Parsed config YAML successfully");
    Ok(config)
}
