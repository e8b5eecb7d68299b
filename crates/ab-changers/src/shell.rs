//! The shell producer: runs an external command in the checkout and commits
//! whatever it changed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use ab_core::config::{ChangeMakerConfig, CommitterConfig, PerRepoChangeMaker};

use crate::changemaker::{
    activation_annotations, compose_message, decode_data, sanitize_branch, ChangerError,
    ChangerFactory, ChangerWorkspace, WorkingTreeChanger,
};

const KIND_NAME: &str = "cmd";

/// One runnable command from the kind's global `data` list.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShellData {
    pub name: String,
    pub bin: String,
    pub args: Vec<String>,
    /// Seconds; 0 = no timeout.
    pub timeout: u64,
}

pub struct ShellChanger {
    data: ShellData,
    activation: PerRepoChangeMaker,
}

impl ShellChanger {
    pub fn new(data: ShellData, activation: PerRepoChangeMaker) -> Self {
        Self { data, activation }
    }

    fn branch_name(&self) -> String {
        sanitize_branch(&format!("shellchange_{}", self.data.name))
    }
}

fn first_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl WorkingTreeChanger for ShellChanger {
    async fn change_working_tree(
        &self,
        work: &dyn ChangerWorkspace,
        committer: &CommitterConfig,
    ) -> Result<(), ChangerError> {
        work.begin_branch(&self.branch_name())?;

        let mut cmd = tokio::process::Command::new(&self.data.bin);
        cmd.args(&self.data.args)
            .current_dir(work.workdir())
            // The child is reaped even when the timeout abandons the future.
            .kill_on_drop(true);

        let output = if self.data.timeout > 0 {
            match tokio::time::timeout(Duration::from_secs(self.data.timeout), cmd.output()).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(ChangerError::ShellTimeout {
                        command: self.data.bin.clone(),
                        seconds: self.data.timeout,
                    })
                }
            }
        } else {
            cmd.output().await?
        };

        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                command = %self.data.bin,
                stdout = first_chars(&stdout, 128),
                stderr = first_chars(&stderr, 128),
                "command failed"
            );
            return Err(ChangerError::Shell {
                command: self.data.bin.clone(),
                status: output.status.code(),
            });
        }

        if work.status_is_empty()? {
            debug!(command = %self.data.bin, "command made no changes");
            return Ok(());
        }
        let message = compose_message(
            &format!("shell command {}", self.data.name),
            &format!("Ran command {}", self.data.bin),
            activation_annotations(&self.activation),
        );
        work.commit_all(&message, committer)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

pub struct ShellChangerFactory;

impl ChangerFactory for ShellChangerFactory {
    fn make(
        &self,
        kind: &ChangeMakerConfig,
        activation: &PerRepoChangeMaker,
    ) -> Result<Option<Vec<Arc<dyn WorkingTreeChanger>>>, ChangerError> {
        if kind.name != KIND_NAME {
            return Ok(None);
        }
        let commands: Vec<ShellData> = decode_data(&kind.data)?;
        let selected: Vec<Arc<dyn WorkingTreeChanger>> = commands
            .into_iter()
            .filter(|data| Some(&data.name) == activation.which.as_ref())
            .map(|data| {
                Arc::new(ShellChanger::new(data, activation.clone())) as Arc<dyn WorkingTreeChanger>
            })
            .collect();
        if selected.is_empty() {
            return Ok(None);
        }
        Ok(Some(selected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_is_sanitized() {
        let changer = ShellChanger::new(
            ShellData {
                name: "maker test!".into(),
                bin: "true".into(),
                args: Vec::new(),
                timeout: 0,
            },
            PerRepoChangeMaker::default(),
        );
        assert_eq!(changer.branch_name(), "shellchange_maker_test_");
    }

    #[test]
    fn factory_selects_commands_by_which() {
        let kind = ChangeMakerConfig {
            name: KIND_NAME.into(),
            data: Some(
                serde_yaml::from_str(
                    "- name: makertest\n  bin: /bin/true\n- name: other\n  bin: /bin/false\n",
                )
                .expect("data"),
            ),
        };
        let mut activation = PerRepoChangeMaker::default();
        activation.name = KIND_NAME.into();
        activation.which = Some("makertest".into());
        let made = ShellChangerFactory
            .make(&kind, &activation)
            .expect("make")
            .expect("selected");
        assert_eq!(made.len(), 1);
    }

    #[test]
    fn factory_with_no_match_declines() {
        let kind = ChangeMakerConfig {
            name: KIND_NAME.into(),
            data: Some(serde_yaml::from_str("- name: other\n  bin: /bin/true\n").expect("data")),
        };
        let mut activation = PerRepoChangeMaker::default();
        activation.name = KIND_NAME.into();
        activation.which = Some("makertest".into());
        assert!(ShellChangerFactory
            .make(&kind, &activation)
            .expect("make")
            .is_none());
    }

    #[test]
    fn first_chars_respects_boundaries() {
        assert_eq!(first_chars("hello", 3), "hel");
        assert_eq!(first_chars("hi", 10), "hi");
    }
}
