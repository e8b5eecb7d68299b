//! Driver for per-file content transformers.
//!
//! Collects one `FileChange` per matching file, then splits the collection
//! into branches: changes with an empty group key become one branch each,
//! changes sharing a non-empty key coalesce into a single branch with their
//! messages concatenated and annotations OR-merged.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use ab_core::annotations::CommitAnnotations;
use ab_core::checkout::RepoFile;
use ab_core::config::{CommitterConfig, PerRepoChangeMaker};

use crate::changemaker::{
    activation_annotations, compose_message, sanitize_branch, ChangerError, ChangerWorkspace,
    WorkingTreeChanger,
};

/// A proposed rewrite of one file.
#[derive(Debug, Clone)]
pub struct FileChange {
    pub new_content: String,
    pub commit_title: String,
    pub commit_message: String,
    /// Empty means "isolated"; equal non-empty keys coalesce.
    pub group_key: String,
    pub annotations: CommitAnnotations,
}

/// Per-file hook implemented by the concrete checks (`time`, `helm`).
/// Returns `None` when the file needs no change.
#[async_trait]
pub trait ContentCheck: Send + Sync {
    async fn new_content(&self, file: &RepoFile) -> Result<Option<FileChange>, ChangerError>;
}

/// The operator wrapping a [`ContentCheck`].
pub struct FileContentChanger {
    check: Arc<dyn ContentCheck>,
    activation: PerRepoChangeMaker,
}

impl FileContentChanger {
    pub fn new(check: Arc<dyn ContentCheck>, activation: PerRepoChangeMaker) -> Self {
        Self { check, activation }
    }
}

#[async_trait]
impl WorkingTreeChanger for FileContentChanger {
    async fn change_working_tree(
        &self,
        work: &dyn ChangerWorkspace,
        committer: &CommitterConfig,
    ) -> Result<(), ChangerError> {
        let files = work.base_files()?;
        let mut expected = Vec::new();
        for file in &files {
            if !self.activation.matches_file(&file.name) {
                continue;
            }
            if let Some(change) = self.check.new_content(file).await? {
                expected.push(ExpectedChange {
                    file_name: file.name.clone(),
                    change,
                });
            }
        }

        for group in split_changes(expected) {
            work.begin_branch(&branch_name(&group.changes))?;
            let annotations = group
                .annotations
                .merge(activation_annotations(&self.activation));
            let message = compose_message(&group.commit_title, &group.commit_message, annotations);
            work.commit_files(&group.changes, &message, committer)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Grouping
// ---------------------------------------------------------------------------

struct ExpectedChange {
    file_name: String,
    change: FileChange,
}

struct GroupedChange {
    commit_title: String,
    commit_message: String,
    annotations: CommitAnnotations,
    /// (file name, new content) in collection order.
    changes: Vec<(String, String)>,
}

fn split_changes(expected: Vec<ExpectedChange>) -> Vec<GroupedChange> {
    let mut groups: Vec<GroupedChange> = Vec::new();
    let mut index_by_key: HashMap<String, usize> = HashMap::new();
    for ec in expected {
        let key = ec.change.group_key.clone();
        if key.is_empty() {
            groups.push(GroupedChange {
                commit_title: ec.change.commit_title,
                commit_message: ec.change.commit_message,
                annotations: ec.change.annotations,
                changes: vec![(ec.file_name, ec.change.new_content)],
            });
            continue;
        }
        match index_by_key.get(&key) {
            Some(&i) => {
                let group = &mut groups[i];
                group.changes.push((ec.file_name, ec.change.new_content));
                group.commit_message.push('\n');
                group.commit_message.push_str(&ec.change.commit_message);
                group.annotations = group.annotations.merge(ec.change.annotations);
            }
            None => {
                index_by_key.insert(key, groups.len());
                groups.push(GroupedChange {
                    commit_title: ec.change.commit_title,
                    commit_message: ec.change.commit_message,
                    annotations: ec.change.annotations,
                    changes: vec![(ec.file_name, ec.change.new_content)],
                });
            }
        }
    }
    groups
}

/// `filechange_` + the first file name, sanitized; bare `filechange` when the
/// group is empty.
fn branch_name(changes: &[(String, String)]) -> String {
    match changes.first() {
        Some((first, _)) => sanitize_branch(&format!("filechange_{first}")),
        None => "filechange".to_string(),
    }
}
