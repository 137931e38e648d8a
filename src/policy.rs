//! Placement policy
//!
//! Maps a file type and size to an ordered list of backends. The most
//! specific matching rule wins; unmatched files fall back to the default
//! ordering. Selection is pure and deterministic for a given table.

use std::collections::HashSet;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::backend::BackendId;
use crate::error::{Error, Result};

/// One row of the policy table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyRule {
    /// File type pattern, e.g. "txt", ".MP4" or "tar.*"
    pub pattern: String,

    /// Target backends, primary first
    pub backends: Vec<BackendId>,

    /// Rule applies only to files at least this large
    #[serde(default)]
    pub min_size: Option<u64>,

    /// Rule applies only to files at most this large
    #[serde(default)]
    pub max_size: Option<u64>,
}

impl PolicyRule {
    pub fn new(pattern: impl Into<String>, backends: Vec<BackendId>) -> Self {
        PolicyRule {
            pattern: pattern.into(),
            backends,
            min_size: None,
            max_size: None,
        }
    }

    pub fn with_size_range(mut self, min_size: Option<u64>, max_size: Option<u64>) -> Self {
        self.min_size = min_size;
        self.max_size = max_size;
        self
    }
}

/// The policy table
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyConfig {
    #[serde(default)]
    pub rules: Vec<PolicyRule>,

    /// Ordering used when no rule matches
    #[serde(default)]
    pub default: Vec<BackendId>,
}

/// Ordered target backends for one upload generation
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Placement {
    backends: Vec<BackendId>,
}

impl Placement {
    pub fn new(backends: Vec<BackendId>) -> Self {
        Placement { backends }
    }

    pub fn primary(&self) -> Option<&BackendId> {
        self.backends.first()
    }

    pub fn secondary(&self) -> Option<&BackendId> {
        self.backends.get(1)
    }

    pub fn tertiary(&self) -> Option<&BackendId> {
        self.backends.get(2)
    }

    pub fn backends(&self) -> &[BackendId] {
        &self.backends
    }

    pub fn contains(&self, id: &BackendId) -> bool {
        self.backends.contains(id)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// File type of a path: the lowercased final extension without the dot
pub fn file_type_of(path: &Path) -> String {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn normalize(pattern: &str) -> String {
    pattern.trim().trim_start_matches('.').to_lowercase()
}

#[derive(Debug)]
struct CompiledRule {
    regex: Regex,
    specificity: usize,
    backends: Vec<BackendId>,
    min_size: Option<u64>,
    max_size: Option<u64>,
}

impl CompiledRule {
    fn matches(&self, file_type: &str, size: u64) -> bool {
        if self.min_size.map_or(false, |min| size < min) {
            return false;
        }
        if self.max_size.map_or(false, |max| size > max) {
            return false;
        }
        self.regex.is_match(file_type)
    }
}

/// Compiled policy table
#[derive(Debug)]
pub struct PolicyEngine {
    rules: Vec<CompiledRule>,
    default: Vec<BackendId>,
}

impl PolicyEngine {
    /// Compile and validate a policy table against the configured backends
    pub fn new(config: &PolicyConfig, known: &[BackendId]) -> Result<Self> {
        let known: HashSet<&BackendId> = known.iter().collect();

        check_backends("default", &config.default, &known)?;

        let mut rules = Vec::with_capacity(config.rules.len());
        for rule in &config.rules {
            check_backends(&rule.pattern, &rule.backends, &known)?;

            if let (Some(min), Some(max)) = (rule.min_size, rule.max_size) {
                if min > max {
                    return Err(Error::InvalidConfig(format!(
                        "policy rule '{}': min_size {} exceeds max_size {}",
                        rule.pattern, min, max
                    )));
                }
            }

            let pattern = normalize(&rule.pattern);
            let specificity = pattern.chars().filter(|c| *c != '*').count();
            let body = pattern
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*");
            let regex = Regex::new(&format!("^{}$", body)).map_err(|e| {
                Error::InvalidConfig(format!("policy rule '{}': {}", rule.pattern, e))
            })?;

            rules.push(CompiledRule {
                regex,
                specificity,
                backends: rule.backends.clone(),
                min_size: rule.min_size,
                max_size: rule.max_size,
            });
        }

        Ok(PolicyEngine {
            rules,
            default: config.default.clone(),
        })
    }

    /// Select the placement for a file of the given type and size
    ///
    /// The matching rule with the most literal characters wins; ties go to
    /// the rule listed first.
    pub fn select(&self, file_type: &str, size: u64) -> Placement {
        let file_type = normalize(file_type);

        let mut best: Option<&CompiledRule> = None;
        for rule in &self.rules {
            if !rule.matches(&file_type, size) {
                continue;
            }
            if best.map_or(true, |b| rule.specificity > b.specificity) {
                best = Some(rule);
            }
        }

        match best {
            Some(rule) => Placement::new(rule.backends.clone()),
            None => Placement::new(self.default.clone()),
        }
    }

    /// Convenience wrapper deriving the file type from a path
    pub fn select_for_path(&self, path: &Path, size: u64) -> Placement {
        self.select(&file_type_of(path), size)
    }
}

fn check_backends(what: &str, backends: &[BackendId], known: &HashSet<&BackendId>) -> Result<()> {
    if backends.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "policy '{}' has an empty backend list",
            what
        )));
    }

    let mut seen = HashSet::new();
    for id in backends {
        if !seen.insert(id) {
            return Err(Error::InvalidConfig(format!(
                "policy '{}' lists backend {} twice",
                what, id
            )));
        }
        if !known.contains(id) {
            return Err(Error::UnknownBackend(id.to_string()));
        }
    }
    Ok(())
}
