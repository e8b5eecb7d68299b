//! Auto-merge eligibility.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use ab_core::annotations::{detect, AnnotationKind};
use ab_core::config::{AutobotConfig, RepoConfig};
use ab_github::types::{
    MergePullRequest, MergeableState, PullRequest, ReviewDecision, StatusState,
};
use ab_github::{GithubApi, GithubError};

use crate::reviewer::fetch_policy;

pub struct PrMerger {
    config: Arc<AutobotConfig>,
    github: Arc<dyn GithubApi>,
}

impl PrMerger {
    pub fn new(config: Arc<AutobotConfig>, github: Arc<dyn GithubApi>) -> Self {
        Self { config, github }
    }

    pub async fn execute(&self) -> Result<()> {
        for repo in &self.config.repos {
            let Some(policy) = fetch_policy(self.github.as_ref(), repo).await? else {
                continue;
            };
            if !policy.allow_auto_merge {
                debug!(repo = %repo, "not allowed to auto merge");
                continue;
            }
            let prs = self
                .github
                .open_pull_requests(&repo.owner, &repo.name)
                .await?;
            for pr in &prs {
                self.process_pr(repo, pr).await?;
            }
        }
        Ok(())
    }

    /// A PR is squash-merged when all of the following hold:
    ///   - the body asks for auto-merge on a line by itself
    ///   - it is not already merged and not a draft
    ///   - the host reports it mergeable
    ///   - every status check passed
    ///   - no review requested changes and none is still required
    ///
    /// The expected head oid makes the merge optimistic: a head that moved
    /// since listing is a transient condition retried next tick.
    async fn process_pr(&self, repo: &RepoConfig, pr: &PullRequest) -> Result<()> {
        if !detect(&pr.body, AnnotationKind::Merge) {
            debug!(pr = pr.number, "pr not asking for merge");
            return Ok(());
        }
        if pr.merged {
            debug!(pr = pr.number, "already merged");
            return Ok(());
        }
        if pr.mergeable != MergeableState::Mergeable {
            info!(pr = pr.number, state = ?pr.mergeable, "cannot merge with state not clean");
            return Ok(());
        }
        if pr.draft {
            debug!(pr = pr.number, "ignoring draft pr");
            return Ok(());
        }
        if pr.status_check_rollup != Some(StatusState::Success) {
            debug!(pr = pr.number, rollup = ?pr.status_check_rollup, "checks not green");
            return Ok(());
        }
        if matches!(
            pr.review_decision,
            Some(ReviewDecision::ChangesRequested) | Some(ReviewDecision::ReviewRequired)
        ) {
            debug!(pr = pr.number, decision = ?pr.review_decision, "review gate not satisfied");
            return Ok(());
        }

        info!(repo = %repo, pr = pr.number, head = %pr.head_oid, "merging pull request");
        let result = self
            .github
            .merge_pull_request(
                &repo.owner,
                &repo.name,
                &MergePullRequest {
                    pull_request_id: pr.id.clone(),
                    expected_head_oid: pr.head_oid.clone(),
                },
            )
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if is_stale_head(&e) => {
                warn!(pr = pr.number, error = %e, "head moved since listing, retrying next tick");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// The host rejects a merge whose expected head no longer matches; that race
/// is transient by construction.
fn is_stale_head(err: &GithubError) -> bool {
    matches!(err, GithubError::Graphql(msg)
        if msg.contains("Head branch was modified") || msg.contains("expected head"))
}
