//! Shared data model: `ImageReference`, `ImageUsage`, `RegistryView`,
//! `HealthReport` and the `KeepRule` ruleset.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Mapping from image reference to usage record. The top-level key order
/// matters for the on-disk snapshot: serializing via a
/// `BTreeMap` keeps it sorted the way `images.json` requires.
pub type ImageUsage = BTreeMap<String, UsageRecord>;

/// Per-phase flags shared by `UsageRecord::phase_any` (a union across all
/// occurrences) and `Occurrence` (a single occurrence's own flags).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseFlags {
    #[serde(rename = "Running", default)]
    pub running: bool,
    #[serde(rename = "Pending", default)]
    pub pending: bool,
    #[serde(rename = "Succeeded", default)]
    pub succeeded: bool,
    #[serde(rename = "Failed", default)]
    pub failed: bool,
    #[serde(rename = "Unknown", default)]
    pub unknown: bool,
    #[serde(rename = "ImagePullBackOff", default)]
    pub image_pull_back_off: bool,
}

impl PhaseFlags {
    /// True if this set of flags implies the occurrence is currently
    /// live.
    pub fn is_live(&self) -> bool {
        self.running || self.pending || self.image_pull_back_off
    }

    pub fn merge(&mut self, other: &PhaseFlags) {
        self.running |= other.running;
        self.pending |= other.pending;
        self.succeeded |= other.succeeded;
        self.failed |= other.failed;
        self.unknown |= other.unknown;
        self.image_pull_back_off |= other.image_pull_back_off;
    }

    /// Lexicographically sorted names of the phases that are set, the
    /// way `Finding::phases` and `Finding::namespaces` are reported
    ///.
    pub fn sorted_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if self.failed {
            names.push("Failed".to_string());
        }
        if self.image_pull_back_off {
            names.push("ImagePullBackOff".to_string());
        }
        if self.pending {
            names.push("Pending".to_string());
        }
        if self.running {
            names.push("Running".to_string());
        }
        if self.succeeded {
            names.push("Succeeded".to_string());
        }
        if self.unknown {
            names.push("Unknown".to_string());
        }
        names
    }
}

/// A single `(context, namespace, pod)` appearance of an image reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Occurrence {
    #[serde(flatten)]
    pub phase: PhaseFlags,
    #[serde(rename = "_last_wanted")]
    pub last_wanted_days: f64,
    #[serde(rename = "_node", skip_serializing_if = "Option::is_none", default)]
    pub node: Option<String>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Usage summary for one `ImageReference`. Serializes as a single flat
/// JSON object mixing underscore-prefixed synthetic attributes with
/// occurrence-keyed entries — this shape is a
/// serialization compatibility contract with existing consumers and
/// must be preserved exactly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageRecord {
    #[serde(rename = "_phase", default)]
    pub phase_any: PhaseFlags,
    #[serde(rename = "_last_wanted", default)]
    pub last_wanted_days: f64,
    #[serde(rename = "_cronjob", default, skip_serializing_if = "is_false")]
    pub cronjob: bool,
    #[serde(rename = "_digest", default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(flatten)]
    pub occurrences: BTreeMap<String, Occurrence>,
}

impl UsageRecord {
    /// Build the `occurrence-key = "k8s;<context>;<namespace>;<pod-name>"`
    /// format from spec §3.
    pub fn occurrence_key(context: &str, namespace: &str, pod_name: &str) -> String {
        format!("k8s;{context};{namespace};{pod_name}")
    }
}

/// Result of decomposing an `ImageReference` into its repository path,
/// optional tag and optional digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReference {
    pub repo: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

/// Split an image reference into `(repo, tag, digest)`. The tag
/// separator is only recognized after the last `/`, so a registry port
/// (`localhost:5000/repo:tag`) is never mistaken for a tag separator.
pub fn parse_reference(reference: &str) -> ParsedReference {
    let (before_digest, digest) = match reference.split_once('@') {
        Some((left, right)) => (left, Some(right.to_string())),
        None => (reference, None),
    };

    let last_slash = before_digest.rfind('/');
    let search_from = last_slash.map(|p| p + 1).unwrap_or(0);

    let (repo, tag) = match before_digest[search_from..].find(':') {
        Some(rel) => {
            let pos = search_from + rel;
            (
                before_digest[..pos].to_string(),
                Some(before_digest[pos + 1..].to_string()),
            )
        },
        None => (before_digest.to_string(), None),
    };

    ParsedReference { repo, tag, digest }
}

/// Per-tag registry state, as assembled by the Auditor/Evictor from
/// repository and manifest listings. Never serialized directly.
#[derive(Debug, Clone)]
pub struct TagInfo {
    pub digest: String,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// `{pattern, keep}` entry of a keep-ruleset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepDecision {
    All,
    Latest,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepRule {
    pub pattern: String,
    pub keep: KeepDecision,
}

/// One finding in a `HealthReport`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Finding {
    Tag(TagFinding),
    Repo(RepoFinding),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagFinding {
    #[serde(rename = "ref")]
    pub reference: String,
    pub problems: Vec<String>,
    pub namespaces: Vec<String>,
    pub phases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoFinding {
    pub name: String,
    pub problem: String,
    pub in_use: bool,
}

pub type HealthReport = Vec<Finding>;

impl Finding {
    /// Flatten into the fixed CSV column set shared by both variants, so
    /// every row in `registry-check.csv` carries the same header (spec
    /// §4.6: "the caller MUST ensure every finding has identical keys").
    pub fn csv_row(&self) -> [(&'static str, String); 7] {
        match self {
            Finding::Tag(t) => [
                ("ref", t.reference.clone()),
                ("problems", t.problems.join(";")),
                ("namespaces", t.namespaces.join(";")),
                ("phases", t.phases.join(";")),
                ("name", String::new()),
                ("problem", String::new()),
                ("in_use", String::new()),
            ],
            Finding::Repo(r) => [
                ("ref", String::new()),
                ("problems", String::new()),
                ("namespaces", String::new()),
                ("phases", String::new()),
                ("name", r.name.clone()),
                ("problem", r.problem.clone()),
                ("in_use", r.in_use.to_string()),
            ],
        }
    }
}
