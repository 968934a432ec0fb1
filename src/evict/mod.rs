//! Evictor: per-repository Lookup/Decide/Apply policy that
//! drives manifest deletion.
//!
//! Grounded directly in `registry-evictor.py`'s `repo_lookup` /
//! `delete_most_manifests` / `delete_all_manifests` / `evict_repo`.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::error::CoreResult;
use crate::keeprules::Ruleset;
use crate::model::ImageUsage;
use crate::registry::RegistryClient;

#[derive(Debug, Clone)]
struct TagRecord {
    tag: String,
    digest: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EvictionAction {
    Kept,
    Deleted,
    DeleteFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvictionLogEntry {
    pub repo: String,
    pub tag: String,
    pub digest: String,
    pub action: EvictionAction,
    pub dry_run: bool,
}

impl EvictionAction {
    fn as_str(&self) -> &'static str {
        match self {
            EvictionAction::Kept => "kept",
            EvictionAction::Deleted => "deleted",
            EvictionAction::DeleteFailed => "delete_failed",
        }
    }
}

impl EvictionLogEntry {
    /// Flatten into the fixed CSV column set, mirroring
    /// `Finding::csv_row`'s convention in `src/model/mod.rs`.
    pub fn csv_row(&self) -> [(&'static str, String); 5] {
        [
            ("repo", self.repo.clone()),
            ("tag", self.tag.clone()),
            ("digest", self.digest.clone()),
            ("action", self.action.as_str().to_string()),
            ("dry_run", self.dry_run.to_string()),
        ]
    }
}

pub struct Evictor<'a> {
    registry: &'a RegistryClient,
    host: &'a str,
    rules: &'a Ruleset,
    usage: &'a ImageUsage,
    dry_run: bool,
    cancel: &'a CancellationToken,
}

impl<'a> Evictor<'a> {
    pub fn new(
        registry: &'a RegistryClient,
        host: &'a str,
        rules: &'a Ruleset,
        usage: &'a ImageUsage,
        dry_run: bool,
        cancel: &'a CancellationToken,
    ) -> Evictor<'a> {
        Evictor {
            registry,
            host,
            rules,
            cancel,
            usage,
            dry_run,
        }
    }

    /// Evict every repository in `repos`, or every repository the
    /// registry reports when `repos` is `None`. A failure to list
    /// repositories is fatal.
    #[instrument(skip(self))]
    pub async fn evict_all(&self, repos: Option<Vec<String>>) -> CoreResult<Vec<EvictionLogEntry>> {
        let repos = match repos {
            Some(repos) => repos,
            None => self.registry.list_repositories(self.cancel).await?,
        };

        let mut log = Vec::new();
        for repo in repos {
            log.extend(self.evict_repo(&repo).await?);
        }
        Ok(log)
    }

    async fn evict_repo(&self, repo: &str) -> CoreResult<Vec<EvictionLogEntry>> {
        let Some(tags) = self.lookup(repo).await? else {
            return Ok(Vec::new());
        };

        let decisions = if self.repo_in_use(repo) || self.rules.keep_repo(repo) {
            decide_most(self.host, self.rules, self.usage, repo, tags)
        } else {
            decide_all(self.rules, repo, tags)
        };

        self.apply(repo, decisions).await
    }

    /// List tags and fetch each manifest once. Tags with no manifest
    /// or no parseable history are counted as a problem and dropped
    /// from further consideration entirely (never kept, never
    /// deleted) — matches `repo_lookup`'s `problems` counter.
    async fn lookup(&self, repo: &str) -> CoreResult<Option<Vec<TagRecord>>> {
        let tag_names = self.registry.list_tags(repo, self.cancel).await?;
        if tag_names.is_empty() {
            return Ok(None);
        }

        let mut tags = Vec::new();
        let mut problems = 0u32;
        for tag in tag_names {
            let manifest = self.registry.get_manifest(repo, &tag, self.cancel).await?;
            if !manifest.is_present() {
                problems += 1;
                continue;
            }
            match parse_created(&manifest.body) {
                Some(created_at) => tags.push(TagRecord {
                    tag,
                    digest: manifest.digest,
                    created_at,
                }),
                None => problems += 1,
            }
        }
        if problems > 0 {
            warn!(repo, problems, "manifests with unreadable or missing history");
        }
        Ok(Some(tags))
    }

    async fn apply(&self, repo: &str, decisions: Vec<(TagRecord, bool)>) -> CoreResult<Vec<EvictionLogEntry>> {
        let mut log = Vec::with_capacity(decisions.len());

        for (tag, keep) in decisions {
            if keep {
                log.push(EvictionLogEntry {
                    repo: repo.to_string(),
                    tag: tag.tag,
                    digest: tag.digest,
                    action: EvictionAction::Kept,
                    dry_run: self.dry_run,
                });
                continue;
            }

            if self.dry_run {
                log.push(EvictionLogEntry {
                    repo: repo.to_string(),
                    tag: tag.tag,
                    digest: tag.digest,
                    action: EvictionAction::Deleted,
                    dry_run: true,
                });
                continue;
            }

            let deleted = match self.registry.delete_manifest(repo, &tag.digest, self.cancel).await {
                Ok(ok) => ok,
                Err(err) => {
                    warn!(repo, tag = %tag.tag, error = %err, "manifest deletion request failed");
                    false
                },
            };

            log.push(EvictionLogEntry {
                repo: repo.to_string(),
                tag: tag.tag,
                digest: tag.digest,
                action: if deleted {
                    EvictionAction::Deleted
                } else {
                    EvictionAction::DeleteFailed
                },
                dry_run: false,
            });
        }

        Ok(log)
    }

    fn repo_in_use(&self, repo: &str) -> bool {
        let prefix = format!("{}/{repo}:", self.host);
        self.usage.keys().any(|reference| reference.starts_with(&prefix))
    }
}

/// `delete_most_manifests`: keep the 3 newest tags, the 2 preceding any
/// in-use tag, and every keep-rule match; spare by digest alias. A free
/// function (rather than an `Evictor` method) so it can be unit-tested
/// without a live `RegistryClient`.
fn decide_most(
    host: &str,
    rules: &Ruleset,
    usage: &ImageUsage,
    repo: &str,
    mut tags: Vec<TagRecord>,
) -> Vec<(TagRecord, bool)> {
    tags.sort_by_key(|t| t.created_at);
    let n = tags.len();

    let mut keep = vec![false; n];
    for i in n.saturating_sub(3)..n {
        keep[i] = true;
    }

    for (i, t) in tags.iter().enumerate() {
        let key = format!("{host}/{repo}:{}", t.tag);
        if usage.contains_key(&key) {
            keep[i] = true;
            if i >= 1 {
                keep[i - 1] = true;
            }
            if i >= 2 {
                keep[i - 2] = true;
            }
        }
    }

    for (i, t) in tags.iter().enumerate() {
        if rules.keep_tag(repo, &t.tag) {
            keep[i] = true;
        }
    }

    let digests_to_keep: HashSet<&str> = tags
        .iter()
        .enumerate()
        .filter(|(i, _)| keep[*i])
        .map(|(_, t)| t.digest.as_str())
        .collect();

    tags.into_iter()
        .map(|t| {
            let spared = digests_to_keep.contains(t.digest.as_str());
            (t, spared)
        })
        .collect()
}

/// `delete_all_manifests`: nothing is implicitly kept; a keep-rule
/// match still spares its tag.
fn decide_all(rules: &Ruleset, repo: &str, tags: Vec<TagRecord>) -> Vec<(TagRecord, bool)> {
    tags.into_iter()
        .map(|t| {
            let keep = rules.keep_tag(repo, &t.tag);
            (t, keep)
        })
        .collect()
}

/// Parse `manifest.history[0].v1Compatibility` (a JSON string embedded
/// in the manifest body) and read its `created` RFC-3339 timestamp.
fn parse_created(body: &Value) -> Option<DateTime<Utc>> {
    let v1compat = body.get("history")?.get(0)?.get("v1Compatibility")?.as_str()?;
    let inner: Value = serde_json::from_str(v1compat).ok()?;
    let created = inner.get("created")?.as_str()?;
    DateTime::parse_from_rfc3339(created)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{KeepDecision, KeepRule, UsageRecord};
    use serde_json::json;

    fn manifest_body(created: &str) -> Value {
        let v1compat = json!({"created": created}).to_string();
        json!({ "history": [{ "v1Compatibility": v1compat }] })
    }

    #[test]
    fn parses_created_from_nested_v1_compatibility() {
        let body = manifest_body("2024-01-02T03:04:05Z");
        let created = parse_created(&body).unwrap();
        assert_eq!(created.to_rfc3339(), "2024-01-02T03:04:05+00:00");
    }

    #[test]
    fn missing_history_yields_none() {
        assert!(parse_created(&json!({})).is_none());
    }

    fn tag(name: &str, digest: &str, created: &str) -> TagRecord {
        TagRecord {
            tag: name.to_string(),
            digest: digest.to_string(),
            created_at: created.parse().unwrap(),
        }
    }

    #[test]
    fn decide_most_keeps_three_newest() {
        let rules = Ruleset::load(vec![]).unwrap();
        let usage = ImageUsage::new();

        let tags = vec![
            tag("t1", "d1", "2024-01-01T00:00:00Z"),
            tag("t2", "d2", "2024-01-02T00:00:00Z"),
            tag("t3", "d3", "2024-01-03T00:00:00Z"),
            tag("t4", "d4", "2024-01-04T00:00:00Z"),
            tag("t5", "d5", "2024-01-05T00:00:00Z"),
        ];

        let decisions = decide_most("reg.example.com", &rules, &usage, "svc/a", tags);
        let kept: Vec<&str> = decisions
            .iter()
            .filter(|(_, keep)| *keep)
            .map(|(t, _)| t.tag.as_str())
            .collect();
        assert_eq!(kept, vec!["t3", "t4", "t5"]);
    }

    #[test]
    fn decide_most_keeps_backing_ramp_for_in_use_tag() {
        let rules = Ruleset::load(vec![]).unwrap();
        let mut usage = ImageUsage::new();
        usage.insert("reg.example.com/svc/a:t5".to_string(), UsageRecord::default());

        let tags = vec![
            tag("t1", "d1", "2024-01-01T00:00:00Z"),
            tag("t2", "d2", "2024-01-02T00:00:00Z"),
            tag("t3", "d3", "2024-01-03T00:00:00Z"),
            tag("t4", "d4", "2024-01-04T00:00:00Z"),
            tag("t5", "d5", "2024-01-05T00:00:00Z"),
            tag("t6", "d6", "2024-01-06T00:00:00Z"),
            tag("t7", "d7", "2024-01-07T00:00:00Z"),
        ];

        let decisions = decide_most("reg.example.com", &rules, &usage, "svc/a", tags);
        let mut kept: Vec<&str> = decisions
            .iter()
            .filter(|(_, keep)| *keep)
            .map(|(t, _)| t.tag.as_str())
            .collect();
        kept.sort();
        assert_eq!(kept, vec!["t3", "t4", "t5", "t6", "t7"]);
    }

    #[test]
    fn decide_most_spares_digest_alias_of_a_kept_tag() {
        let rules = Ruleset::load(vec![]).unwrap();
        let usage = ImageUsage::new();

        // `a` and `d` share digest D1; newest-three is {b, c, d}, so `a`
        // is spared as an alias of `d` even though it would otherwise
        // have been deleted.
        let tags = vec![
            tag("a", "D1", "2024-01-01T00:00:00Z"),
            tag("b", "D2", "2024-01-02T00:00:00Z"),
            tag("c", "D3", "2024-01-03T00:00:00Z"),
            tag("d", "D1", "2024-01-04T00:00:00Z"),
        ];

        let decisions = decide_most("reg.example.com", &rules, &usage, "svc/a", tags);
        assert!(decisions.iter().all(|(_, keep)| *keep));
    }

    #[test]
    fn decide_all_spares_only_keep_rule_matches() {
        let rules = Ruleset::load(vec![KeepRule {
            pattern: "^infra/".to_string(),
            keep: KeepDecision::All,
        }])
        .unwrap();

        let tags = vec![tag("v1", "d1", "2024-01-01T00:00:00Z")];

        let decisions = decide_all(&rules, "infra/base", tags);
        assert!(decisions[0].1);
    }

    #[test]
    fn decide_all_deletes_unmatched_tags() {
        let rules = Ruleset::load(vec![]).unwrap();
        let tags = vec![tag("v1", "d1", "2024-01-01T00:00:00Z")];
        let decisions = decide_all(&rules, "acme/scratch", tags);
        assert!(!decisions[0].1);
    }
}
