//! Value types crossing the remote-API boundary.
//!
//! Field names and enum variants mirror the GraphQL schema (the query in
//! `client` aliases everything to match), and everything derives serde both
//! ways because PR listings round-trip through the value cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Repository metadata needed to open PRs against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryInfo {
    /// GraphQL node id, passed back verbatim in `createPullRequest`.
    pub id: String,
    pub default_branch: String,
}

/// The authenticated identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub login: String,
    pub id: String,
}

/// One open pull request as the eligibility machines see it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: String,
    pub number: u64,
    #[serde(default)]
    pub body: String,
    pub updated_at: DateTime<Utc>,
    pub draft: bool,
    pub merged: bool,
    pub mergeable: MergeableState,
    pub base_ref_name: String,
    pub head_oid: String,
    #[serde(default)]
    pub author_login: String,
    pub is_cross_repository: bool,
    /// Aggregated CI status of the head commit, if any checks reported.
    pub status_check_rollup: Option<StatusState>,
    pub review_decision: Option<ReviewDecision>,
    /// The viewer's most recent review, used to avoid re-approving a head.
    pub viewer_latest_review: Option<ViewerReview>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerReview {
    pub commit_oid: String,
    pub state: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeableState {
    Mergeable,
    Conflicting,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusState {
    Success,
    Pending,
    Failure,
    Error,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewDecision {
    Approved,
    ChangesRequested,
    ReviewRequired,
    #[serde(other)]
    Unknown,
}

// ---------------------------------------------------------------------------
// Mutation inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CreatePullRequest {
    pub repository_id: String,
    pub base: String,
    pub head: String,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct ApprovePullRequest {
    pub pull_request_id: String,
    /// Head commit the approval is tied to.
    pub commit_oid: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct MergePullRequest {
    pub pull_request_id: String,
    /// Optimistic-concurrency token: the merge fails if the head moved.
    pub expected_head_oid: String,
}
