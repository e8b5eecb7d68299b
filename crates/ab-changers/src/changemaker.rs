//! Operator and factory contracts, and the registry that resolves per-repo
//! activations into operators.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use ab_core::annotations::CommitAnnotations;
use ab_core::checkout::{Checkout, CheckoutError, RepoFile};
use ab_core::config::{
    AutobotPerRepoConfig, ChangeMakerConfig, CommitterConfig, PerRepoChangeMaker,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ChangerError {
    #[error("git operation failed: {0}")]
    Git(#[from] CheckoutError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unable to decode producer config: {0}")]
    Data(#[from] serde_yaml::Error),

    #[error("unable to discover change maker for {0}")]
    UnknownChangeMaker(String),

    #[error("unable to fetch helm index: {0}")]
    Http(#[from] reqwest::Error),

    #[error("helm index at {url} returned status {status}")]
    IndexStatus { url: String, status: u16 },

    #[error("invalid current version {raw}: {source}")]
    InvalidVersion { raw: String, source: semver::Error },

    #[error("invalid version constraint {raw}: {source}")]
    InvalidConstraint { raw: String, source: semver::Error },

    #[error("command {command} failed with status {status:?}")]
    Shell {
        command: String,
        status: Option<i32>,
    },

    #[error("command {command} timed out after {seconds}s")]
    ShellTimeout { command: String, seconds: u64 },
}

// ---------------------------------------------------------------------------
// Workspace seam
// ---------------------------------------------------------------------------

/// The slice of a checkout an operator is allowed to touch. `Checkout`
/// implements it; tests substitute their own.
pub trait ChangerWorkspace: Send + Sync {
    /// Text files reachable from the reconciled base.
    fn base_files(&self) -> Result<Vec<RepoFile>, CheckoutError>;
    /// Clean the tree and start a fresh candidate branch at the base.
    fn begin_branch(&self, name: &str) -> Result<(), CheckoutError>;
    /// Write + stage exactly `files`, commit with `message`.
    fn commit_files(
        &self,
        files: &[(String, String)],
        message: &str,
        author: &CommitterConfig,
    ) -> Result<(), CheckoutError>;
    /// Stage everything changed in the tree, commit with `message`.
    fn commit_all(&self, message: &str, author: &CommitterConfig) -> Result<(), CheckoutError>;
    fn status_is_empty(&self) -> Result<bool, CheckoutError>;
    fn workdir(&self) -> &std::path::Path;
}

impl ChangerWorkspace for Checkout {
    fn base_files(&self) -> Result<Vec<RepoFile>, CheckoutError> {
        Checkout::base_files(self)
    }

    fn begin_branch(&self, name: &str) -> Result<(), CheckoutError> {
        Checkout::begin_branch(self, name)
    }

    fn commit_files(
        &self,
        files: &[(String, String)],
        message: &str,
        author: &CommitterConfig,
    ) -> Result<(), CheckoutError> {
        Checkout::commit_files(self, files, message, author).map(|_| ())
    }

    fn commit_all(&self, message: &str, author: &CommitterConfig) -> Result<(), CheckoutError> {
        Checkout::commit_all(self, message, author).map(|_| ())
    }

    fn status_is_empty(&self) -> Result<bool, CheckoutError> {
        Checkout::status_is_empty(self)
    }

    fn workdir(&self) -> &std::path::Path {
        Checkout::workdir(self)
    }
}

// ---------------------------------------------------------------------------
// Operator + factory
// ---------------------------------------------------------------------------

/// One concrete per-run operator. Every branch it creates must begin from a
/// clean tree at the base, check out a newly named branch, and commit exactly
/// one logical change.
#[async_trait]
pub trait WorkingTreeChanger: Send + Sync {
    async fn change_working_tree(
        &self,
        work: &dyn ChangerWorkspace,
        committer: &CommitterConfig,
    ) -> Result<(), ChangerError>;
}

/// Inspects a kind + activation pair. `Ok(None)` means "not my kind".
pub trait ChangerFactory: Send + Sync {
    fn make(
        &self,
        kind: &ChangeMakerConfig,
        activation: &PerRepoChangeMaker,
    ) -> Result<Option<Vec<Arc<dyn WorkingTreeChanger>>>, ChangerError>;
}

/// Tagged registry of factories, consulted in registration order.
#[derive(Default)]
pub struct ChangerRegistry {
    factories: Vec<Box<dyn ChangerFactory>>,
}

impl ChangerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, factory: Box<dyn ChangerFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    /// Resolve the policy's activations, in the order they appear, against
    /// the engine's registered kinds. A kind no factory claims is a config
    /// inconsistency and fails the load.
    pub fn load(
        &self,
        kinds: &[ChangeMakerConfig],
        policy: &AutobotPerRepoConfig,
    ) -> Result<Vec<Arc<dyn WorkingTreeChanger>>, ChangerError> {
        let mut out = Vec::new();
        for activation in &policy.change_makers {
            for kind in kinds.iter().filter(|k| k.name == activation.name) {
                let mut loaded = false;
                for factory in &self.factories {
                    if let Some(changers) = factory.make(kind, activation)? {
                        out.extend(changers);
                        loaded = true;
                        break;
                    }
                }
                if !loaded {
                    return Err(ChangerError::UnknownChangeMaker(kind.name.clone()));
                }
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// `Title\n\nBody` with the annotation lines appended.
pub fn compose_message(title: &str, body: &str, annotations: CommitAnnotations) -> String {
    annotations.append_to(&format!("{title}\n\n{body}"))
}

/// The activation-level annotation flags.
pub fn activation_annotations(activation: &PerRepoChangeMaker) -> CommitAnnotations {
    CommitAnnotations {
        auto_approve: activation.auto_approve,
        auto_merge: activation.auto_merge,
    }
}

/// Re-decode an opaque `data` value into a producer's own config type.
pub fn decode_data<T>(data: &Option<serde_yaml::Value>) -> Result<T, ChangerError>
where
    T: DeserializeOwned + Default,
{
    match data {
        None => Ok(T::default()),
        Some(value) => Ok(serde_yaml::from_value(value.clone())?),
    }
}

/// Branch names keep `[A-Za-z0-9._]` and replace everything else with `_`,
/// capped at 100 characters.
pub(crate) fn sanitize_branch(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(100);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_message_appends_annotations() {
        let msg = compose_message(
            "time update",
            "Updated time to now",
            CommitAnnotations {
                auto_approve: true,
                auto_merge: false,
            },
        );
        assert_eq!(
            msg,
            "time update\n\nUpdated time to now\ngitops-autobot: auto-approve=true"
        );
    }

    #[test]
    fn sanitize_branch_replaces_and_truncates() {
        assert_eq!(sanitize_branch("a/b c.yaml"), "a_b_c.yaml");
        assert_eq!(sanitize_branch(&"x".repeat(300)).len(), 100);
    }

    #[test]
    fn registry_errors_on_unclaimed_kind() {
        let registry = ChangerRegistry::new();
        let kinds = vec![ChangeMakerConfig {
            name: "time".into(),
            data: None,
        }];
        let policy =
            AutobotPerRepoConfig::from_yaml("changeMakers:\n  - name: time\n").expect("policy");
        let err = registry.load(&kinds, &policy);
        assert!(matches!(err, Err(ChangerError::UnknownChangeMaker(_))));
    }

    #[test]
    fn registry_skips_activations_without_a_registered_kind() {
        let registry = ChangerRegistry::new();
        let kinds: Vec<ChangeMakerConfig> = Vec::new();
        let policy =
            AutobotPerRepoConfig::from_yaml("changeMakers:\n  - name: unheard-of\n").expect("policy");
        let loaded = registry.load(&kinds, &policy).expect("load");
        assert!(loaded.is_empty());
    }
}
