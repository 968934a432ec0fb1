//! Keep-Rule Engine: an ordered ruleset deciding whether a
//! repository or tag is exempt from eviction.
//!
//! Grounded in `keeprules.py`: rules are evaluated in order, and the
//! decision is taken from the first rule whose `pattern` matches.
//! Unlike the Python original we actually apply "first match wins"
//! pattern-by-pattern instead of only ever looking at `keeprules[0]`.

use std::path::Path;

use regex::Regex;

use crate::error::{CoreError, CoreResult};
use crate::model::{KeepDecision, KeepRule};

struct CompiledRule {
    pattern: Regex,
    keep: KeepDecision,
}

/// An immutable, compiled keep-ruleset. Loaded once at process start
///.
pub struct Ruleset {
    rules: Vec<CompiledRule>,
}

impl Ruleset {
    /// Compile every rule and run the post-load no-op validation call
    /// against an unmatchable repository name, mirroring
    /// `keeprules.py::load_keep_list`'s closing sanity check.
    pub fn load(rules: Vec<KeepRule>) -> CoreResult<Ruleset> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.pattern.is_empty() {
                return Err(CoreError::KeepRuleError(
                    "rule has an empty pattern".to_string(),
                ));
            }
            let pattern = Regex::new(&rule.pattern).map_err(|e| {
                CoreError::KeepRuleError(format!("pattern {:?} does not compile: {e}", rule.pattern))
            })?;
            compiled.push(CompiledRule {
                pattern,
                keep: rule.keep,
            });
        }

        let ruleset = Ruleset { rules: compiled };
        // Force full iteration over every compiled pattern with a
        // repository name that cannot match any realistic rule, so a
        // rule with a subtly broken pattern still gets exercised once
        // before any eviction decision is made in anger.
        let _ = ruleset.keep_tag(
            "this:is:an:unmatchable:repository:name:\0",
            "this-tag-does-not-exist",
        );
        Ok(ruleset)
    }

    /// Read `images-keep.json` (a JSON array of `KeepRule` objects,
    /// spec §6) and compile it. A missing file is treated as an empty
    /// ruleset — a deployment with no keep-rules configured is
    /// legitimate, not a config error.
    pub fn load_from_file(path: &Path) -> CoreResult<Ruleset> {
        let rules = match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| CoreError::KeepRuleError(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(CoreError::KeepRuleError(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            },
        };
        Ruleset::load(rules)
    }

    fn first_match(&self, repo: &str) -> Option<&CompiledRule> {
        self.rules.iter().find(|rule| rule.pattern.is_match(repo))
    }

    /// True iff the first matching rule's decision keeps `tag` in
    /// `repo`: `keep:"all"` always keeps, `keep:"latest"`
    /// keeps only when `tag == "latest"`.
    pub fn keep_tag(&self, repo: &str, tag: &str) -> bool {
        match self.first_match(repo) {
            Some(rule) => match rule.keep {
                KeepDecision::All => true,
                KeepDecision::Latest => tag == "latest",
                KeepDecision::None => false,
            },
            None => false,
        }
    }

    /// True iff a matching rule exists with `keep ∈ {all, latest}`. A
    /// `keep:"none"` match halts further consideration and returns
    /// false outright.
    pub fn keep_repo(&self, repo: &str) -> bool {
        match self.first_match(repo) {
            Some(rule) => !matches!(rule.keep, KeepDecision::None),
            None => false,
        }
    }
}
