//! Concrete GitHub client authenticated as a GitHub App installation.
//!
//! Pull-request listing and every mutation go through GraphQL, since the REST
//! surface does not expose the status rollup, review decision, or the
//! viewer's latest review in one round trip. File contents come from REST
//! because GraphQL has no equivalent of the contents endpoint.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::EncodingKey;
use octocrab::models::{AppId, InstallationId};
use octocrab::Octocrab;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use ab_core::checkout::GitAuth;
use ab_core::config::GithubAppConfig;
use async_trait::async_trait;

use crate::api::{GithubApi, GithubError};
use crate::types::{
    ApprovePullRequest, CreatePullRequest, MergePullRequest, PullRequest, RepositoryInfo,
    ReviewDecision, StatusState, UserInfo, ViewerReview,
};

/// Fixed username GitHub expects for app-token basic auth on the git
/// transport.
const GIT_TRANSPORT_USERNAME: &str = "x-access-token";

/// Installation tokens live an hour; refresh comfortably before that.
const TOKEN_REFRESH_AFTER_MINUTES: i64 = 45;

struct CachedToken {
    token: String,
    refresh_after: DateTime<Utc>,
}

/// GitHub App–authenticated client.
pub struct GithubClient {
    /// App-scoped (JWT) client, used only to mint installation tokens.
    app: Octocrab,
    /// Installation-scoped client for all API traffic.
    api: Octocrab,
    installation_id: InstallationId,
    token: Mutex<Option<CachedToken>>,
}

impl GithubClient {
    /// Build a client from an app config, minting and validating an
    /// installation token up front.
    pub async fn from_config(cfg: &GithubAppConfig) -> Result<Self, GithubError> {
        let pem = std::fs::read(&cfg.pem_key_loc).map_err(GithubError::PemKey)?;
        let key = EncodingKey::from_rsa_pem(&pem).map_err(GithubError::InvalidKey)?;
        let app = Octocrab::builder().app(AppId(cfg.app_id), key).build()?;
        let installation_id = InstallationId(cfg.installation_id);
        let (api, secret) = app.installation_and_token(installation_id).await?;
        debug!(app_id = cfg.app_id, installation_id = cfg.installation_id, "github app token minted");
        Ok(Self {
            app,
            api,
            installation_id,
            token: Mutex::new(Some(CachedToken {
                token: secret.expose_secret().to_string(),
                refresh_after: Utc::now() + ChronoDuration::minutes(TOKEN_REFRESH_AFTER_MINUTES),
            })),
        })
    }

    /// Run a GraphQL request and decode its `data` payload.
    async fn graphql<T: serde::de::DeserializeOwned>(
        &self,
        payload: serde_json::Value,
    ) -> Result<T, GithubError> {
        let response: serde_json::Value = self.api.graphql(&payload).await?;
        if let Some(errors) = response.get("errors") {
            if errors.as_array().is_some_and(|a| !a.is_empty()) {
                return Err(GithubError::Graphql(errors.to_string()));
            }
        }
        let data = response
            .get("data")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        serde_json::from_value(data).map_err(GithubError::Decode)
    }
}

fn is_not_found(err: &octocrab::Error) -> bool {
    matches!(
        err,
        octocrab::Error::GitHub { source, .. }
            if source.status_code == http::StatusCode::NOT_FOUND
    )
}

// ---------------------------------------------------------------------------
// GraphQL response shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RepositoryData<T> {
    repository: T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepoInfoNode {
    id: String,
    default_branch_ref: Option<RefName>,
}

#[derive(Deserialize)]
struct RefName {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequestsConn {
    pull_requests: PrNodes,
}

#[derive(Deserialize)]
struct PrNodes {
    nodes: Vec<PrNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrNode {
    id: String,
    number: u64,
    body: Option<String>,
    updated_at: DateTime<Utc>,
    is_draft: bool,
    merged: bool,
    mergeable: crate::types::MergeableState,
    is_cross_repository: bool,
    base_ref_name: String,
    head_ref_oid: String,
    author: Option<ActorNode>,
    review_decision: Option<ReviewDecision>,
    viewer_latest_review: Option<ReviewNode>,
    commits: CommitsConn,
}

#[derive(Deserialize)]
struct ActorNode {
    login: String,
}

#[derive(Deserialize)]
struct ReviewNode {
    state: String,
    commit: Option<CommitOid>,
}

#[derive(Deserialize)]
struct CommitOid {
    oid: String,
}

#[derive(Deserialize)]
struct CommitsConn {
    nodes: Vec<CommitsNode>,
}

#[derive(Deserialize)]
struct CommitsNode {
    commit: CommitWithRollup,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitWithRollup {
    status_check_rollup: Option<Rollup>,
}

#[derive(Deserialize)]
struct Rollup {
    state: StatusState,
}

#[derive(Deserialize)]
struct ViewerData {
    viewer: ViewerNode,
}

#[derive(Deserialize)]
struct ViewerNode {
    login: String,
    id: String,
}

impl From<PrNode> for PullRequest {
    fn from(node: PrNode) -> Self {
        let status_check_rollup = node
            .commits
            .nodes
            .into_iter()
            .next()
            .and_then(|c| c.commit.status_check_rollup)
            .map(|r| r.state);
        PullRequest {
            id: node.id,
            number: node.number,
            body: node.body.unwrap_or_default(),
            updated_at: node.updated_at,
            draft: node.is_draft,
            merged: node.merged,
            mergeable: node.mergeable,
            base_ref_name: node.base_ref_name,
            head_oid: node.head_ref_oid,
            author_login: node.author.map(|a| a.login).unwrap_or_default(),
            is_cross_repository: node.is_cross_repository,
            status_check_rollup,
            review_decision: node.review_decision,
            viewer_latest_review: node.viewer_latest_review.and_then(|r| {
                r.commit.map(|c| ViewerReview {
                    commit_oid: c.oid,
                    state: r.state,
                })
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

const REPO_INFO_QUERY: &str = "\
query($owner: String!, $name: String!) {
  repository(owner: $owner, name: $name) {
    id
    defaultBranchRef { name }
  }
}";

const OPEN_PRS_QUERY: &str = "\
query($owner: String!, $name: String!) {
  repository(owner: $owner, name: $name) {
    pullRequests(first: 100, states: [OPEN]) {
      nodes {
        id
        number
        body
        updatedAt
        isDraft
        merged
        mergeable
        isCrossRepository
        baseRefName
        headRefOid
        author { login }
        reviewDecision
        viewerLatestReview { state commit { oid } }
        commits(last: 1) { nodes { commit { statusCheckRollup { state } } } }
      }
    }
  }
}";

const CREATE_PR_MUTATION: &str = "\
mutation($input: CreatePullRequestInput!) {
  createPullRequest(input: $input) { clientMutationId }
}";

const APPROVE_PR_MUTATION: &str = "\
mutation($input: AddPullRequestReviewInput!) {
  addPullRequestReview(input: $input) { clientMutationId }
}";

const MERGE_PR_MUTATION: &str = "\
mutation($input: MergePullRequestInput!) {
  mergePullRequest(input: $input) { clientMutationId }
}";

const VIEWER_QUERY: &str = "query { viewer { login id } }";

#[async_trait]
impl GithubApi for GithubClient {
    async fn repository_info(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<RepositoryInfo, GithubError> {
        let data: RepositoryData<RepoInfoNode> = self
            .graphql(json!({
                "query": REPO_INFO_QUERY,
                "variables": { "owner": owner, "name": name },
            }))
            .await?;
        let default_branch = data
            .repository
            .default_branch_ref
            .map(|r| r.name)
            .ok_or_else(|| {
                GithubError::Graphql(format!("repository {owner}/{name} has no default branch"))
            })?;
        Ok(RepositoryInfo {
            id: data.repository.id,
            default_branch,
        })
    }

    async fn file_contents(
        &self,
        owner: &str,
        name: &str,
        path: &str,
    ) -> Result<Option<String>, GithubError> {
        let result = self
            .api
            .repos(owner, name)
            .get_content()
            .path(path)
            .send()
            .await;
        match result {
            Ok(mut contents) => Ok(contents.items.pop().and_then(|c| c.decoded_content())),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn current_user(&self) -> Result<UserInfo, GithubError> {
        let data: ViewerData = self.graphql(json!({ "query": VIEWER_QUERY })).await?;
        Ok(UserInfo {
            login: data.viewer.login,
            id: data.viewer.id,
        })
    }

    async fn open_pull_requests(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<Vec<PullRequest>, GithubError> {
        let data: RepositoryData<PullRequestsConn> = self
            .graphql(json!({
                "query": OPEN_PRS_QUERY,
                "variables": { "owner": owner, "name": name },
            }))
            .await?;
        Ok(data
            .repository
            .pull_requests
            .nodes
            .into_iter()
            .map(PullRequest::from)
            .collect())
    }

    async fn create_pull_request(
        &self,
        owner: &str,
        name: &str,
        input: &CreatePullRequest,
    ) -> Result<(), GithubError> {
        debug!(owner, name, head = %input.head, "creating pull request");
        let _: serde_json::Value = self
            .graphql(json!({
                "query": CREATE_PR_MUTATION,
                "variables": {
                    "input": {
                        "repositoryId": input.repository_id,
                        "baseRefName": input.base,
                        "headRefName": input.head,
                        "title": input.title,
                        "body": input.body,
                    }
                },
            }))
            .await?;
        Ok(())
    }

    async fn approve_pull_request(
        &self,
        owner: &str,
        name: &str,
        input: &ApprovePullRequest,
    ) -> Result<(), GithubError> {
        debug!(owner, name, pr = %input.pull_request_id, "approving pull request");
        let _: serde_json::Value = self
            .graphql(json!({
                "query": APPROVE_PR_MUTATION,
                "variables": {
                    "input": {
                        "pullRequestId": input.pull_request_id,
                        "commitOID": input.commit_oid,
                        "body": input.body,
                        "event": "APPROVE",
                    }
                },
            }))
            .await?;
        Ok(())
    }

    async fn merge_pull_request(
        &self,
        owner: &str,
        name: &str,
        input: &MergePullRequest,
    ) -> Result<(), GithubError> {
        debug!(owner, name, pr = %input.pull_request_id, "merging pull request");
        let _: serde_json::Value = self
            .graphql(json!({
                "query": MERGE_PR_MUTATION,
                "variables": {
                    "input": {
                        "pullRequestId": input.pull_request_id,
                        "expectedHeadOid": input.expected_head_oid,
                        "mergeMethod": "SQUASH",
                    }
                },
            }))
            .await?;
        Ok(())
    }

    async fn git_auth(&self) -> Result<GitAuth, GithubError> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.refresh_after > Utc::now() {
                return Ok(GitAuth::Token {
                    username: GIT_TRANSPORT_USERNAME.to_string(),
                    token: cached.token.clone(),
                });
            }
        }
        let (_, secret) = self.app.installation_and_token(self.installation_id).await?;
        let token = secret.expose_secret().to_string();
        *guard = Some(CachedToken {
            token: token.clone(),
            refresh_after: Utc::now() + ChronoDuration::minutes(TOKEN_REFRESH_AFTER_MINUTES),
        });
        debug!("github installation token refreshed");
        Ok(GitAuth::Token {
            username: GIT_TRANSPORT_USERNAME.to_string(),
            token,
        })
    }
}
