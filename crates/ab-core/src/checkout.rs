//! Per-repo local clone and the working-tree protocol change producers
//! build on.
//!
//! A `Checkout` owns its scratch directory for the life of the process. The
//! reset protocol pins a sentinel branch (`gitops-autobot-start`) to the
//! remote tracked branch tip; every local ref other than the sentinel is a
//! candidate branch produced by an operator and destined to become a pull
//! request.
//!
//! All operations go through libgit2 in-process. Network operations (clone,
//! fetch, push) authenticate through a credential callback fed by the code
//! host's installation token; callers are expected to run them on a blocking
//! thread.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use git2::build::CheckoutBuilder;
use git2::{
    BranchType, Cred, FetchOptions, IndexAddOption, ObjectType, PushOptions, RemoteCallbacks,
    Repository, ResetType, Signature, TreeWalkMode, TreeWalkResult,
};
use tracing::{debug, info};

use crate::config::{AutobotPerRepoConfig, CommitterConfig, ConfigError};

/// The sentinel branch marking the reconciled base. After `clean` it is the
/// only local ref and points at the remote tracked branch tip.
pub const START_BRANCH: &str = "gitops-autobot-start";

/// Well-known per-repo policy file at the tracked branch tip.
pub const PER_REPO_CONFIG_FILE: &str = ".gitops-autobot";

/// PR titles are the first line of the tip commit message, capped here.
const MAX_TITLE_CHARS: usize = 75;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("remote branch origin/{0} not found")]
    MissingRemoteBranch(String),

    #[error("unable to parse per-repo policy: {0}")]
    Policy(#[from] ConfigError),

    #[error("push of {branch} rejected by remote: {message}")]
    PushRejected { branch: String, message: String },
}

// ---------------------------------------------------------------------------
// Git transport auth
// ---------------------------------------------------------------------------

/// Credentials for the git transport. `Anonymous` covers local-path remotes
/// (tests); the token variant carries a code-host installation token.
#[derive(Debug, Clone, Default)]
pub enum GitAuth {
    #[default]
    Anonymous,
    Token {
        username: String,
        token: String,
    },
}

fn remote_callbacks(auth: &GitAuth) -> RemoteCallbacks<'static> {
    let mut cbs = RemoteCallbacks::new();
    if let GitAuth::Token { username, token } = auth {
        let (username, token) = (username.clone(), token.clone());
        cbs.credentials(move |_url, _user, _allowed| Cred::userpass_plaintext(&username, &token));
    }
    cbs
}

// ---------------------------------------------------------------------------
// Checkout
// ---------------------------------------------------------------------------

/// A local branch pushed to the remote, with the PR title and body derived
/// from its tip commit message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushedBranch {
    pub branch: String,
    pub title: String,
    pub body: String,
}

/// A text file reachable from the reconciled base commit.
#[derive(Debug, Clone)]
pub struct RepoFile {
    pub name: String,
    pub content: String,
}

/// Owning clone of one repository target.
pub struct Checkout {
    repo: Mutex<Repository>,
    branch: String,
    workdir: PathBuf,
    // Scratch dir is removed when the checkout is dropped.
    _scratch: tempfile::TempDir,
}

impl Checkout {
    /// Clone only the tracked branch of `url` into a fresh subdirectory of
    /// `scratch_root`. Fails if the remote is unreachable or the branch does
    /// not exist.
    pub fn clone_into(
        scratch_root: &Path,
        url: &str,
        branch: &str,
        auth: &GitAuth,
    ) -> Result<Self, CheckoutError> {
        std::fs::create_dir_all(scratch_root)?;
        let scratch = tempfile::Builder::new()
            .prefix("checkout")
            .tempdir_in(scratch_root)?;
        let workdir = scratch.path().to_path_buf();

        let repo = Repository::init(&workdir)?;
        {
            let refspec = format!("+refs/heads/{branch}:refs/remotes/origin/{branch}");
            repo.remote_with_fetch("origin", url, &refspec)?;
            let mut remote = repo.find_remote("origin")?;
            let mut opts = FetchOptions::new();
            opts.remote_callbacks(remote_callbacks(auth));
            remote.fetch(&[refspec.as_str()], Some(&mut opts), None)?;

            let reference = repo
                .find_reference(&format!("refs/remotes/origin/{branch}"))
                .map_err(|_| CheckoutError::MissingRemoteBranch(branch.to_string()))?;
            let tip = reference.peel_to_commit()?;
            repo.branch(branch, &tip, true)?;
            repo.set_head(&format!("refs/heads/{branch}"))?;
            let mut co = CheckoutBuilder::new();
            co.force();
            repo.checkout_head(Some(&mut co))?;
        }
        debug!(url, branch, workdir = %workdir.display(), "clone finished");

        Ok(Self {
            repo: Mutex::new(repo),
            branch: branch.to_string(),
            workdir,
            _scratch: scratch,
        })
    }

    /// Tracked branch name.
    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Root of the working tree.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn repo(&self) -> MutexGuard<'_, Repository> {
        self.repo.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn base_commit<'r>(
        repo: &'r Repository,
        branch: &str,
    ) -> Result<git2::Commit<'r>, CheckoutError> {
        let reference = repo
            .find_reference(&format!("refs/remotes/origin/{branch}"))
            .map_err(|_| CheckoutError::MissingRemoteBranch(branch.to_string()))?;
        Ok(reference.peel_to_commit()?)
    }

    fn hard_reset(repo: &Repository, commit: &git2::Commit<'_>) -> Result<(), git2::Error> {
        let mut co = CheckoutBuilder::new();
        co.force().remove_untracked(true);
        repo.reset(commit.as_object(), ResetType::Hard, Some(&mut co))
    }

    fn local_branches(repo: &Repository) -> Result<Vec<String>, git2::Error> {
        let mut names = Vec::new();
        for entry in repo.branches(Some(BranchType::Local))? {
            let (branch, _) = entry?;
            if let Some(name) = branch.name()? {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    /// Fetch the tracked branch from origin. Already-up-to-date is success.
    pub fn refresh(&self, auth: &GitAuth) -> Result<(), CheckoutError> {
        let repo = self.repo();
        let refspec = format!(
            "+refs/heads/{b}:refs/remotes/origin/{b}",
            b = self.branch
        );
        let mut remote = repo.find_remote("origin")?;
        let mut opts = FetchOptions::new();
        opts.remote_callbacks(remote_callbacks(auth));
        remote.fetch(&[refspec.as_str()], Some(&mut opts), None)?;
        Ok(())
    }

    /// The reset protocol. Idempotent; afterwards exactly one local branch
    /// exists (the sentinel), positioned at the remote tracked branch tip,
    /// checked out, with a pristine working tree.
    pub fn clean(&self) -> Result<(), CheckoutError> {
        let repo = self.repo();
        let base = Self::base_commit(&repo, &self.branch)?;
        // Detach first: libgit2 refuses to force-move the checked-out branch.
        repo.set_head_detached(base.id())?;
        repo.branch(START_BRANCH, &base, true)?;
        Self::hard_reset(&repo, &base)?;
        repo.set_head(&format!("refs/heads/{START_BRANCH}"))?;
        // Second reset handles the branch-already-existed race: checking out
        // a pre-existing sentinel must not carry its old tree along.
        Self::hard_reset(&repo, &base)?;

        for name in Self::local_branches(&repo)? {
            if name == START_BRANCH {
                continue;
            }
            let mut branch = repo.find_branch(&name, BranchType::Local)?;
            branch.delete()?;
        }
        Ok(())
    }

    /// Read the per-repo policy from the working tree. A missing file is not
    /// an error; the repo has simply opted out.
    pub fn current_policy(&self) -> Result<Option<AutobotPerRepoConfig>, CheckoutError> {
        let path = self.workdir.join(PER_REPO_CONFIG_FILE);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(AutobotPerRepoConfig::from_yaml(&text)?))
    }

    /// Every UTF-8 blob reachable from the base commit. Binary blobs are
    /// skipped; the content checks are all line-oriented.
    pub fn base_files(&self) -> Result<Vec<RepoFile>, CheckoutError> {
        let repo = self.repo();
        let base = Self::base_commit(&repo, &self.branch)?;
        let tree = base.tree()?;
        let mut files = Vec::new();
        tree.walk(TreeWalkMode::PreOrder, |dir, entry| {
            if entry.kind() == Some(ObjectType::Blob) {
                if let Ok(object) = entry.to_object(&repo) {
                    if let Some(blob) = object.as_blob() {
                        if let Ok(content) = std::str::from_utf8(blob.content()) {
                            let name = entry.name().unwrap_or_default();
                            files.push(RepoFile {
                                name: format!("{dir}{name}"),
                                content: content.to_string(),
                            });
                        }
                    }
                }
            }
            TreeWalkResult::Ok
        })?;
        Ok(files)
    }

    /// Start a new candidate branch at the base commit with a clean tree.
    pub fn begin_branch(&self, name: &str) -> Result<(), CheckoutError> {
        let repo = self.repo();
        let base = Self::base_commit(&repo, &self.branch)?;
        Self::hard_reset(&repo, &base)?;
        repo.set_head_detached(base.id())?;
        repo.branch(name, &base, true)?;
        repo.set_head(&format!("refs/heads/{name}"))?;
        Self::hard_reset(&repo, &base)?;
        Ok(())
    }

    /// Write the given files into the working tree, stage exactly them, and
    /// commit with `message` on the current branch.
    pub fn commit_files(
        &self,
        files: &[(String, String)],
        message: &str,
        author: &CommitterConfig,
    ) -> Result<git2::Oid, CheckoutError> {
        for (name, content) in files {
            let path = self.workdir.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, content)?;
        }
        let repo = self.repo();
        let mut index = repo.index()?;
        for (name, _) in files {
            index.add_path(Path::new(name))?;
        }
        index.write()?;
        Self::commit_index(&repo, &mut index, message, author)
    }

    /// Stage everything the working tree changed (including untracked files)
    /// and commit with `message`.
    pub fn commit_all(
        &self,
        message: &str,
        author: &CommitterConfig,
    ) -> Result<git2::Oid, CheckoutError> {
        let repo = self.repo();
        let mut index = repo.index()?;
        index.add_all(["*"], IndexAddOption::DEFAULT, None)?;
        index.write()?;
        Self::commit_index(&repo, &mut index, message, author)
    }

    fn commit_index(
        repo: &Repository,
        index: &mut git2::Index,
        message: &str,
        author: &CommitterConfig,
    ) -> Result<git2::Oid, CheckoutError> {
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Signature::now(&author.author_name, &author.author_email)?;
        let parent = repo.head()?.peel_to_commit()?;
        let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
        Ok(oid)
    }

    /// Whether the working tree has no modified, staged, or untracked files.
    pub fn status_is_empty(&self) -> Result<bool, CheckoutError> {
        let repo = self.repo();
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(statuses.is_empty())
    }

    /// Push every local branch except the sentinel and report what went out.
    ///
    /// A branch the remote already has (same tip, or a diverged tip that
    /// would be a non-fast-forward update) was created by an earlier run
    /// and is already in a pull request: it is logged and skipped. Any other
    /// push failure fails the whole operation.
    pub fn push_new_branches(&self, auth: &GitAuth) -> Result<Vec<PushedBranch>, CheckoutError> {
        let repo = self.repo();
        let mut pushed = Vec::new();
        for name in Self::local_branches(&repo)? {
            if name == START_BRANCH {
                continue;
            }
            let tip = repo
                .find_branch(&name, BranchType::Local)?
                .get()
                .peel_to_commit()?;

            if let Ok(remote_ref) = repo.find_reference(&format!("refs/remotes/origin/{name}")) {
                let remote_tip = remote_ref.peel_to_commit()?;
                if remote_tip.id() == tip.id() {
                    debug!(branch = %name, "branch already pushed, skipping");
                    continue;
                }
                if !repo.graph_descendant_of(tip.id(), remote_tip.id())? {
                    info!(
                        branch = %name,
                        "remote branch diverged (non-fast-forward), treating as existing pull request"
                    );
                    continue;
                }
            }

            let message = tip.message().unwrap_or_default().to_string();
            let (title, body) = split_commit_message(&message);

            let refspec = format!("refs/heads/{name}:refs/heads/{name}");
            let mut remote = repo.find_remote("origin")?;
            let rejection: RefCell<Option<String>> = RefCell::new(None);
            let push_result = {
                // Built inline rather than via remote_callbacks(): the
                // rejection closure borrows a local.
                let mut cbs = RemoteCallbacks::new();
                if let GitAuth::Token { username, token } = auth {
                    let (username, token) = (username.clone(), token.clone());
                    cbs.credentials(move |_url, _user, _allowed| {
                        Cred::userpass_plaintext(&username, &token)
                    });
                }
                cbs.push_update_reference(|_refname, status| {
                    if let Some(msg) = status {
                        *rejection.borrow_mut() = Some(msg.to_string());
                    }
                    Ok(())
                });
                let mut opts = PushOptions::new();
                opts.remote_callbacks(cbs);
                remote.push(&[refspec.as_str()], Some(&mut opts))
            };

            match push_result {
                Ok(()) => {}
                Err(e) if is_non_fast_forward(e.message()) => {
                    info!(branch = %name, error = %e, "non-fast-forward push, treating as existing pull request");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            if let Some(message) = rejection.into_inner() {
                if is_non_fast_forward(&message) {
                    info!(branch = %name, message = %message, "push rejected as non-fast-forward, treating as existing pull request");
                    continue;
                }
                return Err(CheckoutError::PushRejected {
                    branch: name,
                    message,
                });
            }

            pushed.push(PushedBranch {
                branch: name,
                title,
                body,
            });
        }
        Ok(pushed)
    }
}

/// Both libgit2 transports and smart-HTTP servers word the rejection
/// differently; all variants carry one of these markers.
fn is_non_fast_forward(message: &str) -> bool {
    message.contains("non-fast-forward")
        || message.contains("non-fastforwardable")
        || message.contains("fetch first")
}

/// First line (trimmed, capped) becomes the PR title, the remainder the body.
fn split_commit_message(message: &str) -> (String, String) {
    let mut parts = message.splitn(2, '\n');
    let first = parts.next().unwrap_or_default().trim();
    let title = if first.chars().count() > MAX_TITLE_CHARS {
        first.chars().take(MAX_TITLE_CHARS).collect()
    } else {
        first.to_string()
    };
    let body = parts.next().unwrap_or_default().trim().to_string();
    (title, body)
}
