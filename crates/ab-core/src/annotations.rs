//! The commit-annotation grammar.
//!
//! Producers append machine-readable lines to the commit body; GitHub copies
//! the first commit body into the PR body when a PR is opened, so the same
//! lines drive the reviewer and merger. The exact line forms are external
//! interface; they round-trip through the code host verbatim.

use serde::{Deserialize, Serialize};

pub const AUTO_APPROVE_LINE: &str = "gitops-autobot: auto-approve=true";
pub const AUTO_MERGE_LINE: &str = "gitops-autobot: auto-merge=true";

/// Which directive to look for in free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationKind {
    Approve,
    Merge,
}

impl AnnotationKind {
    fn line(self) -> &'static str {
        match self {
            AnnotationKind::Approve => AUTO_APPROVE_LINE,
            AnnotationKind::Merge => AUTO_MERGE_LINE,
        }
    }
}

/// Returns true iff any line of `text`, after trimming whitespace, is the
/// exact directive line. Only `=true` triggers behavior.
pub fn detect(text: &str, kind: AnnotationKind) -> bool {
    text.lines().any(|line| line.trim() == kind.line())
}

/// Annotations attached to a change, OR-merged when changes coalesce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitAnnotations {
    pub auto_approve: bool,
    pub auto_merge: bool,
}

impl CommitAnnotations {
    /// Componentwise OR.
    pub fn merge(self, other: CommitAnnotations) -> CommitAnnotations {
        CommitAnnotations {
            auto_approve: self.auto_approve || other.auto_approve,
            auto_merge: self.auto_merge || other.auto_merge,
        }
    }

    /// Append the directive lines to a commit message, each on its own line.
    pub fn append_to(&self, msg: &str) -> String {
        let mut out = msg.to_string();
        if self.auto_approve {
            out.push('\n');
            out.push_str(AUTO_APPROVE_LINE);
        }
        if self.auto_merge {
            out.push('\n');
            out.push_str(AUTO_MERGE_LINE);
        }
        out
    }
}
