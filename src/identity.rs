//! # Job Identity Resolution
//!
//! Finds the upstream job record for the job this runner is executing. The
//! record may not exist yet right after the job starts, so the search is
//! retried a bounded number of times. A 403 that carries a non-exhausted
//! rate-limit budget means the token cannot read the listing at all; that is
//! terminal and reported as [`JobResolution::Denied`].

use crate::config::{CiContext, IdentityConfig};
use crate::core::{JobInfo, JobListing, WorkflowJob};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, USER_AGENT};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Status of a job that is currently executing.
pub const IN_PROGRESS: &str = "in_progress";
/// Header carrying the caller's remaining request budget.
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListJobsError {
    #[error("job listing returned HTTP {status}")]
    Status {
        status: u16,
        rate_limit_remaining: Option<String>,
    },

    #[error("job listing request failed: {0}")]
    Transport(String),

    #[error("job listing response could not be decoded: {0}")]
    Decode(String),
}

impl ListJobsError {
    /// A 403 while rate-limit budget remains: the token lacks access.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            ListJobsError::Status {
                status: 403,
                rate_limit_remaining: Some(remaining),
            } => remaining.trim() != "0",
            _ => false,
        }
    }
}

/// Outcome of a full resolution run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResolution {
    Resolved { id: u64, name: String },
    Denied,
    Exhausted,
}

impl From<JobResolution> for JobInfo {
    fn from(resolution: JobResolution) -> Self {
        match resolution {
            JobResolution::Resolved { id, name } => JobInfo {
                id: Some(id),
                name: Some(name),
                not_accessible: false,
            },
            JobResolution::Denied => JobInfo {
                not_accessible: true,
                ..JobInfo::default()
            },
            JobResolution::Exhausted => JobInfo::default(),
        }
    }
}

/// Retry and paging bounds for [`IdentityResolver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub page_size: u32,
}

impl Default for ResolverPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            retry_delay: Duration::from_secs(1),
            page_size: 100,
        }
    }
}

impl From<&IdentityConfig> for ResolverPolicy {
    fn from(config: &IdentityConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            page_size: config.page_size,
        }
    }
}

enum Attempt {
    Found(WorkflowJob),
    NotFound,
    Denied,
    Failed(ListJobsError),
}

pub struct IdentityResolver {
    listing: Arc<dyn JobListing>,
    policy: ResolverPolicy,
}

impl IdentityResolver {
    pub fn new(listing: Arc<dyn JobListing>, policy: ResolverPolicy) -> Self {
        Self { listing, policy }
    }

    /// Searches for the in-progress job running on `runner_name`.
    #[instrument(skip(self))]
    pub async fn resolve(&self, runner_name: &str) -> JobResolution {
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.attempt(runner_name).await {
                Attempt::Found(job) => {
                    info!(job_id = job.id, job_name = %job.name, attempt, "Resolved job identity");
                    return JobResolution::Resolved {
                        id: job.id,
                        name: job.name,
                    };
                }
                Attempt::Denied => {
                    warn!("Job listing is not accessible with the provided token");
                    return JobResolution::Denied;
                }
                Attempt::NotFound => debug!(attempt, "No matching in-progress job yet"),
                Attempt::Failed(e) => warn!(attempt, error = %e, "Job listing attempt failed"),
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.policy.retry_delay).await;
            }
        }

        info!(attempts = max_attempts, "Unable to resolve job identity");
        JobResolution::Exhausted
    }

    async fn attempt(&self, runner_name: &str) -> Attempt {
        let page_size = self.policy.page_size;
        let mut page = 0;
        loop {
            let jobs = match self.listing.list_jobs(page, page_size).await {
                Ok(jobs) => jobs,
                Err(e) if e.is_permission_denied() => return Attempt::Denied,
                Err(e) => return Attempt::Failed(e),
            };

            let last_page = jobs.len() < page_size as usize;
            if let Some(job) = jobs.into_iter().find(|job| is_running_on(job, runner_name)) {
                return Attempt::Found(job);
            }
            // A short page, empty included, is the end of the listing.
            if last_page {
                return Attempt::NotFound;
            }
            page += 1;
        }
    }
}

fn is_running_on(job: &WorkflowJob, runner_name: &str) -> bool {
    job.status == IN_PROGRESS && job.runner_name.as_deref() == Some(runner_name)
}

#[derive(Deserialize)]
struct JobsPage {
    #[serde(default)]
    jobs: Vec<WorkflowJob>,
}

/// Lists the jobs of the current workflow run through the GitHub REST API.
pub struct GitHubJobListing {
    client: reqwest::Client,
    jobs_url: String,
    token: Option<String>,
}

impl GitHubJobListing {
    pub fn new(api_url: &str, ctx: &CiContext, token: Option<String>) -> Result<Self, ListJobsError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ListJobsError::Transport(e.to_string()))?;
        let jobs_url = format!(
            "{}/repos/{}/{}/actions/runs/{}/jobs",
            api_url.trim_end_matches('/'),
            ctx.repo_owner,
            ctx.repo_name,
            ctx.run_id
        );
        Ok(Self {
            client,
            jobs_url,
            token,
        })
    }
}

#[async_trait]
impl JobListing for GitHubJobListing {
    /// `page` counts from zero; the API's pages count from one.
    async fn list_jobs(&self, page: u32, per_page: u32) -> Result<Vec<WorkflowJob>, ListJobsError> {
        let mut request = self
            .client
            .get(&self.jobs_url)
            .query(&[("per_page", per_page), ("page", page + 1)])
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, concat!("ciwatch/", env!("CARGO_PKG_VERSION")));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ListJobsError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let rate_limit_remaining = response
                .headers()
                .get(RATE_LIMIT_REMAINING_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Err(ListJobsError::Status {
                status: status.as_u16(),
                rate_limit_remaining,
            });
        }

        let body: JobsPage = response
            .json()
            .await
            .map_err(|e| ListJobsError::Decode(e.to_string()))?;
        debug!(page, count = body.jobs.len(), "Fetched job listing page");
        Ok(body.jobs)
    }
}
