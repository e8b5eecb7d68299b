//! Auto-approval eligibility.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info};

use ab_core::annotations::{detect, AnnotationKind};
use ab_core::checkout::PER_REPO_CONFIG_FILE;
use ab_core::config::{AutobotConfig, AutobotPerRepoConfig, RepoConfig};
use ab_github::types::{ApprovePullRequest, PullRequest, StatusState};
use ab_github::GithubApi;

const APPROVAL_BODY: &str = "auto accepted by gitops reviewbot";

pub struct PrReviewer {
    config: Arc<AutobotConfig>,
    github: Arc<dyn GithubApi>,
}

impl PrReviewer {
    pub fn new(config: Arc<AutobotConfig>, github: Arc<dyn GithubApi>) -> Self {
        Self { config, github }
    }

    pub async fn execute(&self) -> Result<()> {
        for repo in &self.config.repos {
            let Some(policy) = fetch_policy(self.github.as_ref(), repo).await? else {
                continue;
            };
            if !policy.allow_auto_review {
                debug!(repo = %repo, "not allowed to auto review");
                continue;
            }
            let prs = self
                .github
                .open_pull_requests(&repo.owner, &repo.name)
                .await?;
            for pr in &prs {
                self.process_pr(repo, pr, &policy).await?;
            }
        }
        Ok(())
    }

    /// A PR is approved when all of the following hold:
    ///   - the body asks for auto-approval on a line by itself
    ///   - the author is the creator identity, or users may trigger accepts
    ///     and the PR is not cross-repository
    ///   - it is not a draft
    ///   - it has sat untouched for the configured delay
    ///   - every status check passed
    ///   - the reviewer has not already approved this exact head
    async fn process_pr(
        &self,
        repo: &RepoConfig,
        pr: &PullRequest,
        policy: &AutobotPerRepoConfig,
    ) -> Result<()> {
        if !detect(&pr.body, AnnotationKind::Approve) {
            debug!(pr = pr.number, "pr not asking for review");
            return Ok(());
        }
        if !self.config.pr_creator.matches_login(&pr.author_login) {
            if !policy.allow_users_to_trigger_accept {
                debug!(pr = pr.number, "not allowing users to auto accept");
                return Ok(());
            }
            if pr.is_cross_repository {
                debug!(pr = pr.number, "ignoring cross-repository pr");
                return Ok(());
            }
        }
        if pr.draft {
            debug!(pr = pr.number, "ignoring draft pr");
            return Ok(());
        }
        let age = Utc::now() - pr.updated_at;
        let delay = chrono::Duration::seconds(self.config.delay_for_auto_approval as i64);
        if age < delay {
            debug!(
                pr = pr.number,
                seconds_left = (delay - age).num_seconds(),
                "ignoring pr too recently updated"
            );
            return Ok(());
        }
        if pr.status_check_rollup != Some(StatusState::Success) {
            debug!(pr = pr.number, rollup = ?pr.status_check_rollup, "checks not green");
            return Ok(());
        }
        if let Some(review) = &pr.viewer_latest_review {
            if review.commit_oid == pr.head_oid {
                debug!(pr = pr.number, "already reviewed this head");
                return Ok(());
            }
        }

        info!(repo = %repo, pr = pr.number, head = %pr.head_oid, "approving pull request");
        self.github
            .approve_pull_request(
                &repo.owner,
                &repo.name,
                &ApprovePullRequest {
                    pull_request_id: pr.id.clone(),
                    commit_oid: pr.head_oid.clone(),
                    body: APPROVAL_BODY.to_string(),
                },
            )
            .await?;
        Ok(())
    }
}

/// Fetch and parse the live per-repo policy. Absent is not an error.
pub(crate) async fn fetch_policy(
    github: &dyn GithubApi,
    repo: &RepoConfig,
) -> Result<Option<AutobotPerRepoConfig>> {
    let Some(text) = github
        .file_contents(&repo.owner, &repo.name, PER_REPO_CONFIG_FILE)
        .await?
    else {
        debug!(repo = %repo, "no per-repo policy file");
        return Ok(None);
    };
    Ok(Some(AutobotPerRepoConfig::from_yaml(&text)?))
}
