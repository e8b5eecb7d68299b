//! The Helm bump producer.
//!
//! Scans files for `# gitops-autobot:` marker comments carrying logfmt
//! tokens, resolves the chart's published versions from its repository
//! index, and rewrites the `version:` line to the greatest version that
//! satisfies the constraint.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use semver::{Version, VersionReq};
use tracing::warn;

use ab_core::annotations::CommitAnnotations;
use ab_core::checkout::RepoFile;
use ab_core::config::{ChangeMakerConfig, PerRepoChangeMaker};

use crate::changemaker::{ChangerError, ChangerFactory, WorkingTreeChanger};
use crate::file_content::{ContentCheck, FileChange, FileContentChanger};
use crate::helm_repo::IndexSource;

const AUTOBOT_MARKER: &str = "# gitops-autobot:";
const KIND_NAME: &str = "helm";

// ---------------------------------------------------------------------------
// Marker parsing
// ---------------------------------------------------------------------------

/// One chart upgrade directive found in a file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineHelmChange {
    pub repository: String,
    pub chart_name: String,
    pub current_version: String,
    pub version_constraint: String,
    /// Index of the `version:` line to rewrite.
    pub version_line: Option<usize>,
    /// `autoApprove` / `autoMerge` marker keys, tri-state.
    pub auto_approve: Option<bool>,
    pub auto_merge: Option<bool>,
}

impl LineHelmChange {
    fn is_valid(&self) -> bool {
        !self.repository.is_empty()
            && !self.chart_name.is_empty()
            && !self.current_version.is_empty()
            && !self.version_constraint.is_empty()
            && self.version_line.is_some()
    }
}

/// Indent as YAML sees it: leading spaces and list dashes.
fn yaml_indent(line: &str) -> usize {
    line.len() - line.trim_start_matches([' ', '-']).len()
}

/// Whitespace-separated `key=value` tokens; values may be double-quoted.
fn parse_logfmt(text: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for token in text.split_whitespace() {
        if let Some((key, value)) = token.split_once('=') {
            out.insert(key.to_string(), value.trim_matches('"').to_string());
        }
    }
    out
}

fn parse_bool_key(keys: &HashMap<String, String>, names: &[&str]) -> Option<bool> {
    for name in names {
        match keys.get(*name).map(String::as_str) {
            Some("true") => return Some(true),
            Some("false") => return Some(false),
            _ => {}
        }
    }
    None
}

/// Find every valid upgrade directive in `lines`.
///
/// A directive is a marker comment whose tokens include `changer=helm`;
/// missing fields may be satisfied by sibling YAML keys (`repository`,
/// `name`, `version`) within the three following lines at equal indent.
pub fn parse_helm_markers(lines: &[&str]) -> Vec<LineHelmChange> {
    let mut out = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        let Some(start) = trimmed.rfind(AUTOBOT_MARKER) else {
            continue;
        };
        let keys = parse_logfmt(trimmed[start + AUTOBOT_MARKER.len()..].trim());
        if keys.get("changer").map(String::as_str) != Some(KIND_NAME) {
            continue;
        }
        let indent = yaml_indent(line);
        if idx + 3 >= lines.len() {
            continue;
        }

        let mut change = LineHelmChange::default();
        for (idx2, &sibling) in lines.iter().enumerate().take(idx + 4).skip(idx + 1) {
            if yaml_indent(sibling) != indent {
                continue;
            }
            let Ok(values) = serde_yaml::from_str::<HashMap<String, String>>(sibling) else {
                continue;
            };
            if let Some(repository) = values.get("repository") {
                change.repository = repository.clone();
            }
            if let Some(name) = values.get("name") {
                change.chart_name = name.clone();
            }
            if let Some(version) = values.get("version") {
                change.current_version = version.clone();
                change.version_line = Some(idx2);
            }
        }
        if let Some(repository) = keys.get("repository") {
            change.repository = repository.clone();
        }
        if let Some(name) = keys.get("name") {
            change.chart_name = name.clone();
        }
        if let Some(constraint) = keys.get("versionConstraint") {
            change.version_constraint = constraint.clone();
        }
        if let Some(current) = keys.get("currentVersion") {
            change.current_version = current.clone();
        }
        change.auto_approve = parse_bool_key(&keys, &["autoApprove", "autoAccept"]);
        change.auto_merge = parse_bool_key(&keys, &["autoMerge"]);

        if change.is_valid() {
            out.push(change);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Content check
// ---------------------------------------------------------------------------

pub struct HelmCheck {
    source: Arc<dyn IndexSource>,
}

impl HelmCheck {
    pub fn new(source: Arc<dyn IndexSource>) -> Self {
        Self { source }
    }
}

/// Parse a chart version, tolerating a leading `v`.
fn parse_version(raw: &str) -> Result<Version, semver::Error> {
    Version::parse(raw.trim_start_matches('v'))
}

/// Rewrite the value of a `version:` line, preserving everything before the
/// key and the `v` prefix style of the old value.
fn rewrite_version_line(line: &str, old: &str, new: &Version) -> String {
    let rendered = if old.starts_with('v') {
        format!("v{new}")
    } else {
        new.to_string()
    };
    match line.find("version:") {
        Some(pos) => format!("{}version: {}", &line[..pos], rendered),
        None => line.to_string(),
    }
}

#[async_trait]
impl ContentCheck for HelmCheck {
    async fn new_content(&self, file: &RepoFile) -> Result<Option<FileChange>, ChangerError> {
        let lines: Vec<&str> = file.content.split('\n').collect();
        let changes = parse_helm_markers(&lines);
        if changes.is_empty() {
            return Ok(None);
        }

        let mut new_lines: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        let mut message = String::new();
        let mut annotations = CommitAnnotations::default();
        let mut changed = false;

        for change in &changes {
            let current =
                parse_version(&change.current_version).map_err(|source| {
                    ChangerError::InvalidVersion {
                        raw: change.current_version.clone(),
                        source,
                    }
                })?;
            let constraint = VersionReq::parse(&change.version_constraint).map_err(|source| {
                ChangerError::InvalidConstraint {
                    raw: change.version_constraint.clone(),
                    source,
                }
            })?;

            let index = self.source.load_index(&change.repository).await?;
            let Some(entries) = index.entries.get(&change.chart_name) else {
                warn!(
                    file = %file.name,
                    chart = %change.chart_name,
                    repository = %change.repository,
                    "chart not present in repository index"
                );
                continue;
            };
            let best = entries
                .iter()
                .filter_map(|e| parse_version(&e.version).ok())
                .filter(|v| constraint.matches(v))
                .max();
            let Some(best) = best else {
                continue;
            };
            if best <= current {
                continue;
            }

            // version_line is checked by is_valid.
            if let Some(line_no) = change.version_line {
                new_lines[line_no] =
                    rewrite_version_line(lines[line_no], &change.current_version, &best);
                message.push_str(&format!(
                    "Changed {} {} => {}\n",
                    change.chart_name, change.current_version, best
                ));
                annotations = annotations.merge(CommitAnnotations {
                    auto_approve: change.auto_approve == Some(true),
                    auto_merge: change.auto_merge == Some(true),
                });
                changed = true;
            }
        }

        if !changed {
            return Ok(None);
        }
        Ok(Some(FileChange {
            new_content: new_lines.join("\n"),
            commit_title: "Deploying new helm version".to_string(),
            commit_message: message,
            group_key: String::new(),
            annotations,
        }))
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

pub struct HelmChangerFactory {
    source: Arc<dyn IndexSource>,
}

impl HelmChangerFactory {
    pub fn new(source: Arc<dyn IndexSource>) -> Self {
        Self { source }
    }
}

impl ChangerFactory for HelmChangerFactory {
    fn make(
        &self,
        kind: &ChangeMakerConfig,
        activation: &PerRepoChangeMaker,
    ) -> Result<Option<Vec<Arc<dyn WorkingTreeChanger>>>, ChangerError> {
        if kind.name != KIND_NAME {
            return Ok(None);
        }
        Ok(Some(vec![Arc::new(FileContentChanger::new(
            Arc::new(HelmCheck::new(Arc::clone(&self.source))),
            activation.clone(),
        ))]))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const FLUX_RELEASE: &str = "\
apiVersion: helm.fluxcd.io/v1
kind: HelmRelease
metadata:
  name: gitdb
  namespace: gitdb
spec:
  releaseName: gitdb
  chart:
    # gitops-autobot: changer=helm versionConstraint=1.x.x
    repository: https://charts.example.com/gitdb/
    name: gitdb
    version: 0.1.25
  values:
    image:
      tag: master-gh.241-a9aef22";

    #[test]
    fn parses_a_flux_helm_release() {
        let lines: Vec<&str> = FLUX_RELEASE.split('\n').collect();
        let changes = parse_helm_markers(&lines);
        assert_eq!(changes.len(), 1);
        let change = &changes[0];
        assert_eq!(change.repository, "https://charts.example.com/gitdb/");
        assert_eq!(change.chart_name, "gitdb");
        assert_eq!(change.current_version, "0.1.25");
        assert_eq!(change.version_constraint, "1.x.x");
        assert_eq!(change.version_line, Some(11));
        assert_eq!(change.auto_approve, None);
        assert_eq!(change.auto_merge, None);
    }

    #[test]
    fn marker_keys_override_sibling_lines() {
        let text = "\
  # gitops-autobot: changer=helm versionConstraint=2.x.x currentVersion=2.0.0 name=other repository=https://other.example/
  repository: https://charts.example.com/
  name: gitdb
  version: 0.1.25
";
        let lines: Vec<&str> = text.split('\n').collect();
        let changes = parse_helm_markers(&lines);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].chart_name, "other");
        assert_eq!(changes[0].repository, "https://other.example/");
        assert_eq!(changes[0].current_version, "2.0.0");
    }

    #[test]
    fn marker_without_changer_helm_is_ignored() {
        let text = "\
  # gitops-autobot: changer=docker versionConstraint=1.x.x
  repository: https://charts.example.com/
  name: gitdb
  version: 0.1.25
";
        let lines: Vec<&str> = text.split('\n').collect();
        assert!(parse_helm_markers(&lines).is_empty());
    }

    #[test]
    fn sibling_lines_at_other_indent_do_not_count() {
        let text = "\
    # gitops-autobot: changer=helm versionConstraint=1.x.x
  repository: https://charts.example.com/
  name: gitdb
  version: 0.1.25
";
        let lines: Vec<&str> = text.split('\n').collect();
        // Nothing at the marker's indent supplies the chart fields.
        assert!(parse_helm_markers(&lines).is_empty());
    }

    #[test]
    fn annotation_keys_are_tri_state() {
        let text = "\
  # gitops-autobot: changer=helm versionConstraint=1.x.x autoMerge=true autoAccept=false
  repository: https://charts.example.com/
  name: gitdb
  version: 0.1.25
";
        let lines: Vec<&str> = text.split('\n').collect();
        let changes = parse_helm_markers(&lines);
        assert_eq!(changes[0].auto_merge, Some(true));
        assert_eq!(changes[0].auto_approve, Some(false));
    }

    #[test]
    fn rewrite_preserves_prefix_and_v_style() {
        let version = Version::parse("1.4.0").unwrap();
        assert_eq!(
            rewrite_version_line("    version: 1.2.3", "1.2.3", &version),
            "    version: 1.4.0"
        );
        assert_eq!(
            rewrite_version_line("    version: v1.2.3", "v1.2.3", &version),
            "    version: v1.4.0"
        );
    }

    #[test]
    fn constraint_with_wildcards_parses() {
        let req = VersionReq::parse("1.x.x").unwrap();
        assert!(req.matches(&Version::parse("1.4.0").unwrap()));
        assert!(!req.matches(&Version::parse("2.0.0").unwrap()));
    }
}
