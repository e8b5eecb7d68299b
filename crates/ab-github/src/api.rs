//! The abstract capability surface for the code host.
//!
//! Pipeline stages only ever see this trait; the concrete transport and the
//! caching layer both implement it, so tests can substitute an in-memory
//! fake.

use async_trait::async_trait;

use ab_core::cache::CacheError;
use ab_core::checkout::GitAuth;

use crate::types::{
    ApprovePullRequest, CreatePullRequest, MergePullRequest, PullRequest, RepositoryInfo, UserInfo,
};

#[derive(Debug, thiserror::Error)]
pub enum GithubError {
    #[error("github api error: {0}")]
    Api(#[from] octocrab::Error),

    #[error("graphql error: {0}")]
    Graphql(String),

    #[error("unexpected response shape: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("unable to read PEM key: {0}")]
    PemKey(#[source] std::io::Error),

    #[error("invalid app private key: {0}")]
    InvalidKey(#[source] jsonwebtoken::errors::Error),
}

/// Capability set of the code host. Mutations invalidate the PR-list cache
/// when wrapped by the caching layer.
#[async_trait]
pub trait GithubApi: Send + Sync {
    /// Repository metadata (node id, default branch).
    async fn repository_info(&self, owner: &str, name: &str)
        -> Result<RepositoryInfo, GithubError>;

    /// Text of `path` at the default branch tip. `Ok(None)` when the file
    /// does not exist, which is legitimate for the per-repo policy.
    async fn file_contents(
        &self,
        owner: &str,
        name: &str,
        path: &str,
    ) -> Result<Option<String>, GithubError>;

    /// The authenticated identity.
    async fn current_user(&self) -> Result<UserInfo, GithubError>;

    /// A bounded page of open pull requests.
    async fn open_pull_requests(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<Vec<PullRequest>, GithubError>;

    async fn create_pull_request(
        &self,
        owner: &str,
        name: &str,
        input: &CreatePullRequest,
    ) -> Result<(), GithubError>;

    async fn approve_pull_request(
        &self,
        owner: &str,
        name: &str,
        input: &ApprovePullRequest,
    ) -> Result<(), GithubError>;

    /// Squash-merge with an expected head oid as the concurrency token.
    async fn merge_pull_request(
        &self,
        owner: &str,
        name: &str,
        input: &MergePullRequest,
    ) -> Result<(), GithubError>;

    /// Credentials reusable by the git transport client.
    async fn git_auth(&self) -> Result<GitAuth, GithubError>;
}
