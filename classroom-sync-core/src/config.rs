use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::models::CourseRole;

/// Where the roster inputs live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RosterPaths {
    pub classes: PathBuf,
    pub users: PathBuf,
    pub enrollments: PathBuf,
    pub registry: PathBuf,
}

impl Default for RosterPaths {
    fn default() -> Self {
        Self {
            classes: PathBuf::from("classes.csv"),
            users: PathBuf::from("users.csv"),
            enrollments: PathBuf::from("enrollments.csv"),
            registry: PathBuf::from("coursesID.csv"),
        }
    }
}

/// Retry policy for rate-limited or server-faulted calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one. 1 disables retrying.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` counts from 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

/// Behaviour switches for one run of the reconciliation engine.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Suppress every mutating remote call and log what would happen instead.
    pub dry_run: bool,
    /// Operator account temporarily added as teacher in foreign-domain mode.
    pub admin_user: Option<String>,
    /// Appended to teacher ids from the class file to build owner emails.
    pub teacher_email_domain: Option<String>,
    /// Invite members (with temporary admin grant) instead of adding them directly.
    pub foreign_domain: bool,
    /// Role used for enroll/unenroll.
    pub member_role: CourseRole,
    pub concurrency: usize,
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    /// Log and skip enrollment for classes with no registry entry instead of failing them.
    pub skip_unknown_class: bool,
    /// Collapse repeated user ids within one class before dispatch.
    pub dedupe_enrollments: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            admin_user: None,
            teacher_email_domain: None,
            foreign_domain: false,
            member_role: CourseRole::Student,
            concurrency: crate::fanout::DEFAULT_CONCURRENCY,
            call_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            skip_unknown_class: true,
            dedupe_enrollments: true,
        }
    }
}

impl SyncOptions {
    pub fn trace_loaded(&self) {
        info!(
            dry_run = self.dry_run,
            foreign_domain = self.foreign_domain,
            role = %self.member_role,
            concurrency = self.concurrency,
            timeout_secs = self.call_timeout.as_secs(),
            "Loaded sync options"
        );
        debug!(?self, "Sync options loaded (full debug)");
    }

    /// Owner address for a teacher id taken from the class file.
    pub fn teacher_address(&self, teacher_user_id: &str) -> String {
        match &self.teacher_email_domain {
            Some(domain) if !teacher_user_id.contains('@') => {
                format!("{}@{}", teacher_user_id, domain.trim_start_matches('@'))
            }
            _ => teacher_user_id.to_string(),
        }
    }
}
