#![allow(dead_code)]
//! An in-memory job listing.

use async_trait::async_trait;
use ciwatch::core::{JobListing, WorkflowJob};
use ciwatch::identity::ListJobsError;
use std::sync::Mutex;

/// Serves the same fixed set of jobs, split into pages, on every attempt.
pub struct StaticListing {
    jobs: Vec<WorkflowJob>,
    requests: Mutex<Vec<u32>>,
}

impl StaticListing {
    pub fn new(jobs: Vec<WorkflowJob>) -> Self {
        Self {
            jobs,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requested_pages(&self) -> Vec<u32> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobListing for StaticListing {
    async fn list_jobs(&self, page: u32, per_page: u32) -> Result<Vec<WorkflowJob>, ListJobsError> {
        self.requests.lock().unwrap().push(page);
        Ok(self
            .jobs
            .chunks(per_page as usize)
            .nth(page as usize)
            .map(<[WorkflowJob]>::to_vec)
            .unwrap_or_default())
    }
}

pub fn workflow_job(id: u64, status: &str, runner: &str) -> WorkflowJob {
    WorkflowJob {
        id,
        name: format!("job-{}", id),
        status: status.to_string(),
        runner_name: Some(runner.to_string()),
    }
}
