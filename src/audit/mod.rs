//! Auditor: joins ImageUsage with registry state to produce
//! a `HealthReport`.
//!
//! Grounded in `registry-checker.py` for the by-usage traversal
//! (registry-host-prefixed references, manifest re-fetch per
//! reference); the by-registry mode has no 1:1 Python original and is
//! implemented directly from the specification's repo-then-tag
//! traversal.

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::CoreResult;
use crate::model::{self, Finding, HealthReport, ImageUsage, RepoFinding, TagFinding, UsageRecord};
use crate::registry::RegistryClient;

/// `context;namespace` pairs where a reference is currently Running,
/// Pending, or in ImagePullBackOff, deduplicated and lexicographically
/// sorted.
fn live_namespaces(record: &UsageRecord) -> Vec<String> {
    let mut namespaces: Vec<String> = record
        .occurrences
        .iter()
        .filter(|(_, occurrence)| occurrence.phase.is_live())
        .filter_map(|(key, _)| {
            let mut parts = key.split(';');
            let context = parts.nth(1)?;
            let namespace = parts.next()?;
            Some(format!("{context};{namespace}"))
        })
        .collect();
    namespaces.sort();
    namespaces.dedup();
    namespaces
}

pub struct Auditor<'a> {
    registry: &'a RegistryClient,
    host: &'a str,
    usage: &'a ImageUsage,
    cancel: &'a CancellationToken,
}

impl<'a> Auditor<'a> {
    pub fn new(
        registry: &'a RegistryClient,
        host: &'a str,
        usage: &'a ImageUsage,
        cancel: &'a CancellationToken,
    ) -> Auditor<'a> {
        Auditor {
            registry,
            host,
            usage,
            cancel,
        }
    }

    /// Default mode: walk every `ImageUsage` entry under this
    /// registry's host and flag the ones whose manifest is missing or
    /// whose usage shows `ImagePullBackOff`.
    #[instrument(skip(self))]
    pub async fn audit_by_usage(&self) -> CoreResult<HealthReport> {
        let prefix = format!("{}/", self.host);
        let mut report = HealthReport::new();

        for (reference, record) in self.usage {
            if !reference.starts_with(&prefix) {
                continue;
            }
            if !record.phase_any.is_live() {
                continue;
            }

            let stripped = &reference[prefix.len()..];
            let parsed = model::parse_reference(stripped);
            let lookup_reference = parsed.digest.clone().or(parsed.tag.clone());
            let Some(lookup_reference) = lookup_reference else {
                continue;
            };

            let manifest = self
                .registry
                .get_manifest(&parsed.repo, &lookup_reference, self.cancel)
                .await?;

            let mut problems = Vec::new();
            if !manifest.is_present() {
                problems.push("no digest".to_string());
            }
            if record.phase_any.image_pull_back_off {
                problems.push("ImagePullBackOff".to_string());
            }
            if problems.is_empty() {
                continue;
            }

            report.push(Finding::Tag(TagFinding {
                reference: reference.clone(),
                problems,
                namespaces: live_namespaces(record),
                phases: record.phase_any.sorted_names(),
            }));
        }

        Ok(report)
    }

    /// `--by-registry` mode: walk repositories (or the caller-supplied
    /// subset), listing tags and re-fetching each manifest.
    #[instrument(skip(self))]
    pub async fn audit_by_registry(&self, repos: Option<Vec<String>>) -> CoreResult<HealthReport> {
        let repos = match repos {
            Some(repos) => repos,
            None => self.registry.list_repositories(self.cancel).await?,
        };

        let mut report = HealthReport::new();

        for repo in repos {
            let tags = self.registry.list_tags(&repo, self.cancel).await?;
            if tags.is_empty() {
                let in_use = self.repo_in_use(&repo);
                report.push(Finding::Repo(RepoFinding {
                    name: repo.clone(),
                    problem: if in_use {
                        "no tags - but in use".to_string()
                    } else {
                        "no tags".to_string()
                    },
                    in_use,
                }));
                continue;
            }

            let mut tag_findings = Vec::new();
            for tag in &tags {
                let manifest = self.registry.get_manifest(&repo, tag, self.cancel).await?;
                if manifest.is_present() {
                    continue;
                }
                tag_findings.push(format!("{}/{repo}:{tag}", self.host));
            }

            if tag_findings.len() == tags.len() {
                report.push(Finding::Repo(RepoFinding {
                    name: repo.clone(),
                    problem: "all tags unhealthy".to_string(),
                    in_use: self.repo_in_use(&repo),
                }));
                continue;
            }

            if !tag_findings.is_empty() {
                for reference in tag_findings {
                    let (namespaces, phases) = self
                        .usage
                        .get(&reference)
                        .map(|record| (live_namespaces(record), record.phase_any.sorted_names()))
                        .unwrap_or_default();
                    report.push(Finding::Tag(TagFinding {
                        reference,
                        problems: vec!["no manifest".to_string()],
                        namespaces,
                        phases,
                    }));
                }
                report.push(Finding::Repo(RepoFinding {
                    name: repo.clone(),
                    problem: "See tags above".to_string(),
                    in_use: self.repo_in_use(&repo),
                }));
            }
        }

        Ok(report)
    }

    fn repo_in_use(&self, repo: &str) -> bool {
        let prefix = format!("{}/{repo}:", self.host);
        self.usage.keys().any(|reference| reference.starts_with(&prefix))
    }
}
