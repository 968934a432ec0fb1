//! CLI argument surface: the thin `inventory`/`audit`/`evict` wrapper
//! spec §1 calls an external collaborator, and spec §6's shared flag
//! set. Grounded in `Rynoxx-docker-registry-cleanup`'s `clap::Parser`
//! derive and `TobiasDeBruijn-DRC`'s subcommand layout.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

const DEFAULT_MAX_AGE_DAYS: f64 = 31.0;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Cross-references a container registry against live cluster workload
/// state to audit and garbage-collect stale image references.
#[derive(Debug, Parser)]
#[command(name = "registry-janitor", version, about)]
pub struct Cli {
    /// Registry host, e.g. `registry.example.com`.
    pub host: String,

    /// Restrict scope to these repositories (repeatable). Unset means
    /// "every repository the registry reports".
    #[arg(short = 'r', long = "repository")]
    pub repository: Vec<String>,

    /// Per-request timeout, in seconds, for registry calls.
    #[arg(long = "timeout", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout_secs: u64,

    /// Path to the keep-ruleset file.
    #[arg(long = "keep-rules", default_value = "images-keep.json")]
    pub keep_rules: PathBuf,

    /// Path to a previously written `images.json` snapshot. Required by
    /// `audit` and `evict`; ignored by `inventory`, which produces it.
    #[arg(long = "images", default_value = "images.json")]
    pub images: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Walk cluster contexts and write an `ImageUsage` snapshot.
    Inventory {
        /// Cluster contexts to walk (repeatable). Unset means every
        /// context in the ambient kubeconfig, or in-cluster credentials
        /// if no kubeconfig is found.
        #[arg(long = "context")]
        context: Vec<String>,

        /// Age, in days, above which a non-live occurrence is dropped.
        #[arg(short = 'a', long = "age", default_value_t = DEFAULT_MAX_AGE_DAYS)]
        age: f64,
    },
    /// Cross-reference usage against the registry and report unhealthy
    /// references.
    Audit {
        /// Walk every repository and its tags instead of the default
        /// by-usage traversal.
        #[arg(short = 'R', long = "by-registry")]
        by_registry: bool,
    },
    /// Decide and delete stale tags per repository.
    Evict {
        /// Actually issue deletions. Without this flag, the run is a
        /// dry run: decisions are logged but nothing is deleted.
        #[arg(short = 'd', long = "delete")]
        delete: bool,
    },
    /// Count repositories and tags in the registry, without touching
    /// cluster usage at all.
    List,
    /// Delete specific `repo:tag` or `repo@digest` references directly,
    /// bypassing the usage/keep-rule policy entirely.
    Rm {
        /// One or more `repo:tag`/`repo@digest` references to delete.
        #[arg(required = true)]
        images: Vec<String>,
    },
}

impl Cli {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn repository_scope(&self) -> Option<Vec<String>> {
        if self.repository.is_empty() {
            None
        } else {
            Some(self.repository.clone())
        }
    }
}
