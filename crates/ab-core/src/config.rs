//! Engine and per-repo configuration.
//!
//! Both files are YAML and are parsed strictly: unknown keys reject the
//! load. The engine config is read once at startup; the per-repo policy
//! (`.gitops-autobot`) is re-read from the tracked branch tip on every tick.

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default delay before a PR becomes eligible for auto-approval.
const DEFAULT_APPROVAL_DELAY_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("unable to decode config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unable to find PEM key {0}")]
    MissingPemKey(String),

    #[error("invalid regex {pattern}: {source}")]
    InvalidRegex {
        pattern: String,
        source: regex::Error,
    },
}

// ---------------------------------------------------------------------------
// Engine config
// ---------------------------------------------------------------------------

/// Top-level engine configuration, immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutobotConfig {
    /// Identity that clones, commits, pushes, and opens pull requests.
    #[serde(rename = "prCreator")]
    pub pr_creator: GithubAppConfig,
    /// Optional second identity that reviews and merges. A PR cannot be
    /// approved by its own author, so this is a distinct GitHub App.
    #[serde(rename = "prReviewer", default)]
    pub pr_reviewer: Option<GithubAppConfig>,
    /// Change producer kinds available to per-repo policies.
    #[serde(rename = "changeMakers", default)]
    pub change_makers: Vec<ChangeMakerConfig>,
    /// Scratch directory for clones. Defaults to the system temp dir.
    #[serde(rename = "cloneDataDir", default)]
    pub clone_data_dir: String,
    #[serde(default)]
    pub repos: Vec<RepoConfig>,
    #[serde(rename = "committerConfig")]
    pub committer_config: CommitterConfig,
    /// Seconds a PR must sit untouched before auto-approval.
    #[serde(
        rename = "delayForAutoApproval",
        default = "default_approval_delay_secs"
    )]
    pub delay_for_auto_approval: u64,
}

fn default_approval_delay_secs() -> u64 {
    DEFAULT_APPROVAL_DELAY_SECS
}

impl AutobotConfig {
    /// Parse and validate an engine config from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let mut cfg: AutobotConfig = serde_yaml::from_str(text)?;
        if cfg.clone_data_dir.is_empty() {
            cfg.clone_data_dir = std::env::temp_dir().display().to_string();
        }
        cfg.pr_creator.validate()?;
        if let Some(reviewer) = &cfg.pr_reviewer {
            reviewer.validate()?;
        }
        Ok(cfg)
    }

    /// Load an engine config from a file on disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }
}

/// A GitHub App identity: the App's id, the installation to act as, and the
/// private key that signs installation-token requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GithubAppConfig {
    #[serde(rename = "appID")]
    pub app_id: u64,
    #[serde(rename = "installationID")]
    pub installation_id: u64,
    #[serde(rename = "pemKeyLoc")]
    pub pem_key_loc: String,
    pub name: String,
}

impl GithubAppConfig {
    /// GitHub reports app identities both bare and with a `[bot]` suffix,
    /// depending on the API surface.
    pub fn matches_login(&self, login: &str) -> bool {
        self.name == login || format!("{}[bot]", self.name) == login
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !Path::new(&self.pem_key_loc).exists() {
            return Err(ConfigError::MissingPemKey(self.pem_key_loc.clone()));
        }
        Ok(())
    }
}

/// One repository the bot reconciles. Identity is `(owner, name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepoConfig {
    pub owner: String,
    pub name: String,
    /// Tracked branch. Blank means "use the remote's default branch",
    /// resolved at startup.
    #[serde(default)]
    pub branch: String,
}

impl RepoConfig {
    pub fn clone_url(&self) -> String {
        format!("https://github.com/{}/{}.git", self.owner, self.name)
    }
}

impl std::fmt::Display for RepoConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// A change producer kind registered with the engine. `data` is opaque to
/// the engine; the matching factory re-decodes it (the shell producer keeps
/// its command list here).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChangeMakerConfig {
    pub name: String,
    #[serde(default)]
    pub data: Option<serde_yaml::Value>,
}

/// Author identity stamped onto every commit the bot creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommitterConfig {
    #[serde(rename = "authorName")]
    pub author_name: String,
    #[serde(rename = "authorEmail")]
    pub author_email: String,
}

// ---------------------------------------------------------------------------
// Per-repo policy
// ---------------------------------------------------------------------------

/// Policy fetched live from `.gitops-autobot` at the tracked branch tip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutobotPerRepoConfig {
    #[serde(rename = "changeMakers", default)]
    pub change_makers: Vec<PerRepoChangeMaker>,
    #[serde(rename = "allowAutoReview", default)]
    pub allow_auto_review: bool,
    #[serde(rename = "allowUsersToTriggerAccept", default)]
    pub allow_users_to_trigger_accept: bool,
    #[serde(rename = "allowAutoMerge", default)]
    pub allow_auto_merge: bool,
}

impl AutobotPerRepoConfig {
    /// Parse a per-repo policy, compiling every file-match regex.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let mut cfg: AutobotPerRepoConfig = serde_yaml::from_str(text)?;
        for maker in &mut cfg.change_makers {
            maker.compiled = maker
                .file_match_regex
                .iter()
                .map(|pattern| {
                    Regex::new(pattern).map_err(|source| ConfigError::InvalidRegex {
                        pattern: pattern.clone(),
                        source,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
        }
        Ok(cfg)
    }
}

/// One producer activation inside a per-repo policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PerRepoChangeMaker {
    pub name: String,
    #[serde(rename = "fileMatchRegex", default)]
    pub file_match_regex: Vec<String>,
    #[serde(rename = "autoApprove", default)]
    pub auto_approve: bool,
    #[serde(rename = "autoMerge", default)]
    pub auto_merge: bool,
    /// Selects an entry from the kind's global `data` list (shell producer).
    #[serde(default)]
    pub which: Option<String>,
    #[serde(default)]
    pub data: Option<serde_yaml::Value>,
    #[serde(skip)]
    compiled: Vec<Regex>,
}

impl PerRepoChangeMaker {
    /// An empty regex list matches every file.
    pub fn matches_file(&self, name: &str) -> bool {
        if self.compiled.is_empty() {
            return true;
        }
        self.compiled.iter().any(|re| re.is_match(name))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const PER_REPO: &str = "\
changeMakers:
  - name: time
    fileMatchRegex:
      - \\.yaml$
    autoApprove: true
allowAutoReview: true
allowUsersToTriggerAccept: false
allowAutoMerge: true
";

    #[test]
    fn per_repo_config_parses_and_compiles_regex() {
        let cfg = AutobotPerRepoConfig::from_yaml(PER_REPO).unwrap();
        assert!(cfg.allow_auto_review);
        assert!(cfg.allow_auto_merge);
        assert!(!cfg.allow_users_to_trigger_accept);
        assert_eq!(cfg.change_makers.len(), 1);
        assert!(cfg.change_makers[0].matches_file("config.yaml"));
        assert!(!cfg.change_makers[0].matches_file("README.md"));
    }

    #[test]
    fn empty_regex_list_matches_everything() {
        let cfg = AutobotPerRepoConfig::from_yaml("changeMakers:\n  - name: time\n").unwrap();
        assert!(cfg.change_makers[0].matches_file("anything-at-all"));
    }

    #[test]
    fn unknown_keys_reject_the_load() {
        let err = AutobotPerRepoConfig::from_yaml("allowAutoReview: true\nbogusKey: 1\n");
        assert!(err.is_err());
    }

    #[test]
    fn invalid_regex_rejects_the_load() {
        let err = AutobotPerRepoConfig::from_yaml(
            "changeMakers:\n  - name: time\n    fileMatchRegex:\n      - '('\n",
        );
        assert!(matches!(err, Err(ConfigError::InvalidRegex { .. })));
    }

    #[test]
    fn app_config_matches_bot_suffix() {
        let cfg = GithubAppConfig {
            app_id: 1,
            installation_id: 2,
            pem_key_loc: "/dev/null".into(),
            name: "gitops-autobot".into(),
        };
        assert!(cfg.matches_login("gitops-autobot"));
        assert!(cfg.matches_login("gitops-autobot[bot]"));
        assert!(!cfg.matches_login("someone-else"));
    }

    #[test]
    fn engine_config_defaults() {
        let pem = tempfile::NamedTempFile::new().unwrap();
        let yaml = format!(
            "\
prCreator:
  appID: 1
  installationID: 2
  pemKeyLoc: {pem}
  name: creator
committerConfig:
  authorName: Bot
  authorEmail: bot@example.com
repos:
  - owner: acme
    name: deploys
",
            pem = pem.path().display()
        );
        let cfg = AutobotConfig::from_yaml(&yaml).unwrap();
        assert_eq!(cfg.delay_for_auto_approval, 60);
        assert!(!cfg.clone_data_dir.is_empty());
        assert!(cfg.repos[0].branch.is_empty());
        assert_eq!(cfg.repos[0].clone_url(), "https://github.com/acme/deploys.git");
    }

    #[test]
    fn missing_pem_key_fails_validation() {
        let yaml = "\
prCreator:
  appID: 1
  installationID: 2
  pemKeyLoc: /definitely/not/here.pem
  name: creator
committerConfig:
  authorName: Bot
  authorEmail: bot@example.com
";
        assert!(matches!(
            AutobotConfig::from_yaml(yaml),
            Err(ConfigError::MissingPemKey(_))
        ));
    }
}
