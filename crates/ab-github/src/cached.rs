//! Caching decorator over any [`GithubApi`].
//!
//! Reads go through the shared TTL cache; the three mutations invalidate the
//! PR-list key before running, so a PR opened by the creator is observable
//! by the same tick's reviewer. The identity is memoized for the process
//! lifetime, since it cannot change under an installation token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use ab_core::cache::Cache;
use ab_core::checkout::GitAuth;

use crate::api::{GithubApi, GithubError};
use crate::types::{
    ApprovePullRequest, CreatePullRequest, MergePullRequest, PullRequest, RepositoryInfo, UserInfo,
};

/// Bumped when a cached value's shape changes.
const CACHE_VERSION: &str = "1";

const REPO_INFO_TTL: Duration = Duration::from_secs(60 * 60);
const CONTENTS_TTL: Duration = Duration::from_secs(5 * 60);
const LIST_PRS_TTL: Duration = Duration::from_secs(60 * 60);

pub struct CachedGithub {
    inner: Arc<dyn GithubApi>,
    cache: Arc<Cache>,
    current_user: Mutex<Option<UserInfo>>,
}

impl CachedGithub {
    pub fn new(inner: Arc<dyn GithubApi>, cache: Arc<Cache>) -> Self {
        Self {
            inner,
            cache,
            current_user: Mutex::new(None),
        }
    }

    fn general_key(function: &str, owner: &str, name: &str, extra: &str) -> String {
        format!("{CACHE_VERSION}:{function}:{owner}:{name}:{extra}")
    }

    fn list_prs_key(owner: &str, name: &str) -> String {
        Self::general_key("listPrs", owner, name, "")
    }
}

#[async_trait]
impl GithubApi for CachedGithub {
    async fn repository_info(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<RepositoryInfo, GithubError> {
        let key = Self::general_key("repoInfo", owner, name, "");
        self.cache
            .get_or_set(&key, REPO_INFO_TTL, || {
                self.inner.repository_info(owner, name)
            })
            .await
    }

    async fn file_contents(
        &self,
        owner: &str,
        name: &str,
        path: &str,
    ) -> Result<Option<String>, GithubError> {
        let key = Self::general_key("getCont", owner, name, path);
        self.cache
            .get_or_set(&key, CONTENTS_TTL, || {
                self.inner.file_contents(owner, name, path)
            })
            .await
    }

    async fn current_user(&self) -> Result<UserInfo, GithubError> {
        let mut guard = self.current_user.lock().await;
        if let Some(user) = guard.as_ref() {
            return Ok(user.clone());
        }
        let user = self.inner.current_user().await?;
        *guard = Some(user.clone());
        Ok(user)
    }

    async fn open_pull_requests(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<Vec<PullRequest>, GithubError> {
        let key = Self::list_prs_key(owner, name);
        self.cache
            .get_or_set(&key, LIST_PRS_TTL, || {
                self.inner.open_pull_requests(owner, name)
            })
            .await
    }

    async fn create_pull_request(
        &self,
        owner: &str,
        name: &str,
        input: &CreatePullRequest,
    ) -> Result<(), GithubError> {
        self.cache.delete(&Self::list_prs_key(owner, name)).await;
        self.inner.create_pull_request(owner, name, input).await
    }

    async fn approve_pull_request(
        &self,
        owner: &str,
        name: &str,
        input: &ApprovePullRequest,
    ) -> Result<(), GithubError> {
        self.cache.delete(&Self::list_prs_key(owner, name)).await;
        self.inner.approve_pull_request(owner, name, input).await
    }

    async fn merge_pull_request(
        &self,
        owner: &str,
        name: &str,
        input: &MergePullRequest,
    ) -> Result<(), GithubError> {
        self.cache.delete(&Self::list_prs_key(owner, name)).await;
        self.inner.merge_pull_request(owner, name, input).await
    }

    async fn git_auth(&self) -> Result<GitAuth, GithubError> {
        self.inner.git_auth().await
    }
}
