//! The time-marker producer: rewrites `time=` lines to the current time.
//!
//! Exists mostly to exercise the whole pipeline end to end: a repo with a
//! `time=` marker gets a fresh PR on every tick that the marker is stale.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use ab_core::checkout::RepoFile;
use ab_core::config::{ChangeMakerConfig, PerRepoChangeMaker};

use crate::changemaker::{decode_data, ChangerError, ChangerFactory, WorkingTreeChanger};
use crate::file_content::{ContentCheck, FileChange, FileContentChanger};

/// Mirrors the reference layout `2006-01-02 15:04:05.999999999 -0700 MST`:
/// fractional seconds are trimmed, offset and zone name are appended.
const DEFAULT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f %z %Z";

const KIND_NAME: &str = "time";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeChangerData {
    /// chrono format string; empty means the default layout.
    pub format: String,
    /// Truncate `now` to a multiple of this many seconds. 0 = no rounding.
    #[serde(rename = "roundTo")]
    pub round_to: u64,
}

pub struct TimeCheck {
    data: TimeChangerData,
}

impl TimeCheck {
    pub fn new(data: TimeChangerData) -> Self {
        Self { data }
    }

    fn formatted_now(&self) -> String {
        let mut now: DateTime<Utc> = Utc::now();
        if self.data.round_to > 0 {
            let secs = now.timestamp();
            let truncated = secs - secs.rem_euclid(self.data.round_to as i64);
            now = DateTime::from_timestamp(truncated, 0).unwrap_or(now);
        }
        let format = if self.data.format.is_empty() {
            DEFAULT_TIME_FORMAT
        } else {
            &self.data.format
        };
        now.format(format).to_string()
    }
}

#[async_trait]
impl ContentCheck for TimeCheck {
    async fn new_content(&self, file: &RepoFile) -> Result<Option<FileChange>, ChangerError> {
        let target = self.formatted_now();
        let new_line = format!("time={target}");
        let mut changed = false;
        let lines: Vec<&str> = file
            .content
            .split('\n')
            .map(|line| {
                if line.starts_with("time=") && line != new_line {
                    changed = true;
                    new_line.as_str()
                } else {
                    line
                }
            })
            .collect();
        if !changed {
            return Ok(None);
        }
        Ok(Some(FileChange {
            new_content: lines.join("\n"),
            commit_title: "time update".to_string(),
            commit_message: format!("Updated time to {target}"),
            group_key: "time".to_string(),
            annotations: Default::default(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

pub struct TimeChangerFactory;

impl ChangerFactory for TimeChangerFactory {
    fn make(
        &self,
        kind: &ChangeMakerConfig,
        activation: &PerRepoChangeMaker,
    ) -> Result<Option<Vec<Arc<dyn WorkingTreeChanger>>>, ChangerError> {
        if kind.name != KIND_NAME {
            return Ok(None);
        }
        let data: TimeChangerData = decode_data(&activation.data)?;
        Ok(Some(vec![Arc::new(FileContentChanger::new(
            Arc::new(TimeCheck::new(data)),
            activation.clone(),
        ))]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(data: TimeChangerData) -> TimeCheck {
        TimeCheck::new(data)
    }

    #[tokio::test]
    async fn rewrites_time_lines_and_groups_under_time() {
        let file = RepoFile {
            name: "config.yaml".into(),
            content: "time=old\nx: 1\n".into(),
        };
        let change = check(TimeChangerData::default())
            .new_content(&file)
            .await
            .unwrap()
            .expect("a change");
        assert!(change.new_content.starts_with("time="));
        assert!(change.new_content.ends_with("\nx: 1\n"));
        assert_eq!(change.group_key, "time");
        assert_eq!(change.commit_title, "time update");
        assert!(change.commit_message.starts_with("Updated time to "));
    }

    #[tokio::test]
    async fn file_without_marker_is_untouched() {
        let file = RepoFile {
            name: "config.yaml".into(),
            content: "x: 1\ny: 2\n".into(),
        };
        let change = check(TimeChangerData::default())
            .new_content(&file)
            .await
            .unwrap();
        assert!(change.is_none());
    }

    #[tokio::test]
    async fn line_already_at_target_is_skipped() {
        let data = TimeChangerData {
            format: String::new(),
            round_to: 3600,
        };
        let current = check(data.clone()).formatted_now();
        let file = RepoFile {
            name: "config.yaml".into(),
            content: format!("time={current}\n"),
        };
        let change = check(data).new_content(&file).await.unwrap();
        assert!(change.is_none());
    }

    #[test]
    fn rounding_truncates_to_the_interval() {
        let data = TimeChangerData {
            format: "%S".into(),
            round_to: 60,
        };
        assert_eq!(check(data).formatted_now(), "00");
    }
}
