#![allow(dead_code)]
pub mod daemon;
pub mod fake_listing;
pub mod fake_sources;

use ciwatch::config::CiContext;

/// The CI context every integration test runs under.
pub fn test_ci_context() -> CiContext {
    CiContext {
        repo_owner: "octo".to_string(),
        repo_name: "widgets".to_string(),
        run_id: 77,
        run_attempt: Some("1".to_string()),
        runner_name: Some("runner-1".to_string()),
        token: Some("t0k3n".to_string()),
    }
}
