//! The per-checkout creation pass: refresh, reset, run the policy's
//! producers, push, open PRs.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use ab_changers::ChangerRegistry;
use ab_core::checkout::Checkout;
use ab_core::config::{AutobotConfig, RepoConfig};
use ab_github::types::CreatePullRequest;
use ab_github::GithubApi;

pub struct PrCreator {
    config: Arc<AutobotConfig>,
    registry: Arc<ChangerRegistry>,
    github: Arc<dyn GithubApi>,
}

impl PrCreator {
    pub fn new(
        config: Arc<AutobotConfig>,
        registry: Arc<ChangerRegistry>,
        github: Arc<dyn GithubApi>,
    ) -> Self {
        Self {
            config,
            registry,
            github,
        }
    }

    /// One creation pass over one checkout.
    ///
    /// Clone-quality state is rebuilt from scratch: refresh the remote,
    /// reset to the sentinel, re-read the policy, run every activated
    /// producer from a clean base, then push whatever branches appeared and
    /// open a PR per pushed branch.
    pub async fn execute(&self, repo: &RepoConfig, checkout: &Arc<Checkout>) -> Result<()> {
        let auth = self.github.git_auth().await?;
        {
            let checkout = Arc::clone(checkout);
            let auth = auth.clone();
            tokio::task::spawn_blocking(move || checkout.refresh(&auth))
                .await
                .context("refresh task panicked")??;
        }
        checkout.clean()?;

        let Some(policy) = checkout.current_policy()? else {
            debug!(repo = %repo, "no per-repo policy, skipping");
            return Ok(());
        };
        let changers = self.registry.load(&self.config.change_makers, &policy)?;
        debug!(repo = %repo, changers = changers.len(), "running change producers");
        for changer in &changers {
            // The previous producer leaves the tree on its last branch;
            // every producer starts over from the base.
            checkout.clean()?;
            changer
                .change_working_tree(checkout.as_ref(), &self.config.committer_config)
                .await?;
        }

        let pushed = {
            let checkout = Arc::clone(checkout);
            let auth = auth.clone();
            tokio::task::spawn_blocking(move || checkout.push_new_branches(&auth))
                .await
                .context("push task panicked")??
        };
        if pushed.is_empty() {
            return Ok(());
        }

        let repo_info = self.github.repository_info(&repo.owner, &repo.name).await?;
        for branch in pushed {
            info!(repo = %repo, branch = %branch.branch, "opening pull request");
            self.github
                .create_pull_request(
                    &repo.owner,
                    &repo.name,
                    &CreatePullRequest {
                        repository_id: repo_info.id.clone(),
                        base: repo.branch.clone(),
                        head: branch.branch,
                        title: branch.title,
                        body: branch.body,
                    },
                )
                .await?;
        }
        Ok(())
    }
}
