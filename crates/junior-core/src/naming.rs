//! Job titles and branch naming.
//!
//! Manual and hook jobs get `junior/<slug>-<job id>`. Schedule jobs share a
//! title across firings, so they additionally carry the start timestamp.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{Job, JobOrigin};

pub const BRANCH_PREFIX: &str = "junior/";

/// Maximum slug length inside a branch name.
pub const MAX_SLUG_LENGTH: usize = 40;

/// Maximum title length derived from a prompt.
pub const TITLE_MAX_LENGTH: usize = 80;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BranchNameError {
    #[error("branch name is empty")]
    Empty,
    #[error("branch name may not start with '-': {0}")]
    LeadingDash(String),
    #[error("branch name contains invalid characters: {0}")]
    InvalidCharacters(String),
}

/// Lowercase, alphanumeric and single hyphens, at most `MAX_SLUG_LENGTH`.
pub fn slugify(name: &str) -> String {
    let slug = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    let truncated: String = slug.chars().take(MAX_SLUG_LENGTH).collect();
    let truncated = truncated.trim_end_matches('-');
    if truncated.is_empty() {
        "task".to_string()
    } else {
        truncated.to_string()
    }
}

/// Branch for a manually submitted or hook-triggered job.
pub fn job_branch_name(title: &str, job_id: i64) -> String {
    format!("{BRANCH_PREFIX}{}-{job_id}", slugify(title))
}

/// Branch for a schedule-triggered job.
pub fn scheduled_branch_name(title: &str, job_id: i64, at: DateTime<Utc>) -> String {
    format!(
        "{BRANCH_PREFIX}{}-{job_id}-{}",
        slugify(title),
        at.format("%Y%m%d%H%M%S")
    )
}

/// Pick the branch for a job that is about to start.
pub fn branch_for_job(job: &Job, now: DateTime<Utc>) -> String {
    match job.origin() {
        JobOrigin::Schedule(_) => scheduled_branch_name(&job.title, job.id, now),
        JobOrigin::Manual | JobOrigin::Hook(_) => job_branch_name(&job.title, job.id),
    }
}

/// Reject names git would refuse or that could be mistaken for options.
pub fn validate_branch_name(name: &str) -> Result<(), BranchNameError> {
    if name.is_empty() {
        return Err(BranchNameError::Empty);
    }
    if name.starts_with('-') {
        return Err(BranchNameError::LeadingDash(name.to_string()));
    }
    let bad_char = name.chars().any(|c| {
        c.is_whitespace() || c.is_control() || matches!(c, '~' | '^' | ':' | '\\' | '?' | '*' | '[')
    });
    if bad_char || name.contains("..") {
        return Err(BranchNameError::InvalidCharacters(name.to_string()));
    }
    Ok(())
}

/// Title for a job: the first non-empty prompt line, truncated.
pub fn title_from_prompt(prompt: &str) -> String {
    let first = prompt
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("untitled");
    if first.chars().count() <= TITLE_MAX_LENGTH {
        first.to_string()
    } else {
        let cut: String = first.chars().take(TITLE_MAX_LENGTH - 3).collect();
        format!("{}...", cut.trim_end())
    }
}
