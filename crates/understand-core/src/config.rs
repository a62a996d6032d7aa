//! Configuration supplier: seed presets, hop default, scan patterns, trace
//! limits and side-effect rules.
//!
//! The file is YAML (`.understand-first.yml` at the repository root); JSON
//! documents parse too. A missing or empty file yields defaults; a malformed
//! one is an error. Environment overrides are applied after the file is read.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{UnderstandError, UnderstandResult};
use crate::indexer::pipeline::ScanOptions;
use crate::indexer::side_effects::{RuleClassifier, SideEffectRule};
use crate::query::guards::{
    clamp_hops, clamp_workers, DEFAULT_LENS_HOPS, DEFAULT_TRACE_TIMEOUT, MAX_LENS_HOPS,
    MAX_TRACE_CALLS,
};
use crate::query::lens::SeedPresets;
use crate::trace::python::{PythonAdapter, DEFAULT_PYTHON};
use crate::trace::recorder::{ExceptionMode, RecordLimits, RecordOptions};

pub const DEFAULT_CONFIG_FILE: &str = ".understand-first.yml";
pub const DEFAULT_GLOSSARY_PATH: &str = "docs/glossary.md";
pub const HOPS_ENV: &str = "UNDERSTAND_HOPS";
pub const PYTHON_ENV: &str = "UNDERSTAND_PYTHON";

const TOP_LEVEL_KEYS: &[&str] = &[
    "seeds",
    "hops",
    "contracts_paths",
    "glossary_path",
    "seeds_for",
    "metrics",
    "include",
    "exclude",
    "side_effects",
    "trace",
];
const TRACE_KEYS: &[&str] = &["timeout_ms", "max_calls", "mode", "python"];
const METRICS_KEYS: &[&str] = &["enabled"];

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// Trace recording settings. A zero `timeout_ms` or `max_calls` disables
/// that limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TraceConfig {
    pub timeout_ms: u64,
    pub max_calls: u64,
    pub mode: ExceptionMode,
    pub python: String,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TRACE_TIMEOUT.as_millis() as u64,
            max_calls: MAX_TRACE_CALLS,
            mode: ExceptionMode::default(),
            python: DEFAULT_PYTHON.to_string(),
        }
    }
}

/// Usage-metrics switch read by the embedding CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub seeds: Vec<String>,
    pub hops: u32,
    /// Interface contract files consumed by the contract subsystem.
    pub contracts_paths: Vec<String>,
    pub glossary_path: String,
    pub seeds_for: BTreeMap<String, Vec<String>>,
    pub metrics: Option<MetricsConfig>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Replaces the built-in rules when present.
    pub side_effects: Option<Vec<SideEffectRule>>,
    pub trace: TraceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            hops: DEFAULT_LENS_HOPS,
            contracts_paths: Vec::new(),
            glossary_path: DEFAULT_GLOSSARY_PATH.to_string(),
            seeds_for: BTreeMap::new(),
            metrics: None,
            include: Vec::new(),
            exclude: Vec::new(),
            side_effects: None,
            trace: TraceConfig::default(),
        }
    }
}

impl Config {
    /// Load `path`, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> UnderstandResult<Self> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            Self::from_yaml(&text).map_err(|err| match err {
                UnderstandError::Config(message) => {
                    UnderstandError::Config(format!("{}: {message}", path.display()))
                }
                other => other,
            })?
        } else {
            debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load the default config file of the repository at `root`.
    pub fn discover(root: &Path) -> UnderstandResult<Self> {
        Self::load(&root.join(DEFAULT_CONFIG_FILE))
    }

    pub fn from_yaml(text: &str) -> UnderstandResult<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Config =
            serde_yaml::from_str(text).map_err(|e| UnderstandError::Config(e.to_string()))?;
        if config.hops > MAX_LENS_HOPS {
            return Err(UnderstandError::Config(format!(
                "hops must be between 0 and {MAX_LENS_HOPS}, got {}",
                config.hops
            )));
        }
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides read through `lookup`. Invalid values are logged and
    /// ignored.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup(HOPS_ENV) {
            match raw.trim().parse::<i64>() {
                Ok(hops) => self.hops = clamp_hops(hops),
                Err(_) => warn!(value = %raw, "ignoring invalid {HOPS_ENV}"),
            }
        }
        if let Some(raw) = lookup(PYTHON_ENV) {
            let python = raw.trim();
            if !python.is_empty() {
                self.trace.python = python.to_string();
            }
        }
    }

    pub fn scan_options(&self, workers: usize) -> ScanOptions {
        ScanOptions {
            include: self.include.clone(),
            exclude: self.exclude.clone(),
            workers: clamp_workers(workers),
        }
    }

    pub fn classifier(&self) -> RuleClassifier {
        match &self.side_effects {
            Some(rules) => RuleClassifier::new(rules.clone()),
            None => RuleClassifier::builtin(),
        }
    }

    pub fn record_options(&self) -> RecordOptions {
        RecordOptions {
            limits: RecordLimits {
                timeout: (self.trace.timeout_ms > 0)
                    .then(|| Duration::from_millis(self.trace.timeout_ms)),
                max_calls: (self.trace.max_calls > 0).then_some(self.trace.max_calls),
            },
            mode: self.trace.mode,
        }
    }

    pub fn python_adapter(&self, root: impl Into<PathBuf>) -> PythonAdapter {
        PythonAdapter::new(root).with_interpreter(self.trace.python.clone())
    }
}

impl SeedPresets for Config {
    fn preset(&self, label: &str) -> Option<Vec<String>> {
        self.seeds_for.get(label).cloned()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Parse a YAML (or JSON) config text and report its schema problems.
pub fn validate_config_text(text: &str) -> UnderstandResult<Vec<String>> {
    let value: Value =
        serde_yaml::from_str(text).map_err(|e| UnderstandError::Config(e.to_string()))?;
    Ok(validate_config_value(&value))
}

/// Report schema problems in a raw config document without failing.
pub fn validate_config_value(value: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    let Some(object) = value.as_object() else {
        errors.push("configuration must be a mapping".to_string());
        return errors;
    };
    if !object.contains_key("hops") {
        errors.push("'hops' is a required property".to_string());
    }
    for (key, item) in object {
        match key.as_str() {
            "seeds" | "include" | "exclude" | "contracts_paths" => {
                check_string_array(key, item, &mut errors)
            }
            "glossary_path" => {
                if !item.is_string() {
                    errors.push("'glossary_path' must be a string".to_string());
                }
            }
            "metrics" => check_metrics(item, &mut errors),
            "hops" => match item.as_i64() {
                Some(hops) if (0..=i64::from(MAX_LENS_HOPS)).contains(&hops) => {}
                Some(hops) => errors.push(format!(
                    "'hops' must be between 0 and {MAX_LENS_HOPS}, got {hops}"
                )),
                None => errors.push(format!("'hops' must be an integer, got {item}")),
            },
            "seeds_for" => match item.as_object() {
                Some(presets) => {
                    for (label, seeds) in presets {
                        check_string_array(&format!("seeds_for.{label}"), seeds, &mut errors);
                    }
                }
                None => errors.push("'seeds_for' must be an object".to_string()),
            },
            "side_effects" => match item.as_array() {
                Some(rules) => {
                    for (index, rule) in rules.iter().enumerate() {
                        if let Err(err) = SideEffectRule::deserialize(rule) {
                            errors.push(format!("side_effects[{index}]: {err}"));
                        }
                    }
                }
                None => errors.push("'side_effects' must be an array".to_string()),
            },
            "trace" => check_trace(item, &mut errors),
            unknown => errors.push(unexpected_key(unknown, TOP_LEVEL_KEYS)),
        }
    }
    errors
}

fn check_string_array(path: &str, value: &Value, errors: &mut Vec<String>) {
    let valid = value
        .as_array()
        .is_some_and(|items| items.iter().all(Value::is_string));
    if !valid {
        errors.push(format!("'{path}' must be an array of strings"));
    }
}

fn check_metrics(value: &Value, errors: &mut Vec<String>) {
    let Some(metrics) = value.as_object() else {
        errors.push("'metrics' must be an object".to_string());
        return;
    };
    for (key, item) in metrics {
        match key.as_str() {
            "enabled" => {
                if !item.is_boolean() {
                    errors.push("'metrics.enabled' must be a boolean".to_string());
                }
            }
            unknown => errors.push(unexpected_key(unknown, METRICS_KEYS)),
        }
    }
}

fn check_trace(value: &Value, errors: &mut Vec<String>) {
    let Some(trace) = value.as_object() else {
        errors.push("'trace' must be an object".to_string());
        return;
    };
    for (key, item) in trace {
        match key.as_str() {
            "timeout_ms" | "max_calls" => {
                if item.as_u64().is_none() {
                    errors.push(format!("'trace.{key}' must be a non-negative integer"));
                }
            }
            "mode" => {
                if !matches!(item.as_str(), Some("propagate" | "suppress")) {
                    errors.push(format!(
                        "'trace.mode' must be \"propagate\" or \"suppress\", got {item}"
                    ));
                }
            }
            "python" => {
                if !item.is_string() {
                    errors.push("'trace.python' must be a string".to_string());
                }
            }
            unknown => errors.push(unexpected_key(unknown, TRACE_KEYS)),
        }
    }
}

fn unexpected_key(key: &str, valid: &[&str]) -> String {
    let mut message = format!("Additional properties are not allowed ('{key}' was unexpected)");
    if let Some(suggestion) = closest_key(key, valid) {
        message.push_str(&format!(" (did you mean '{suggestion}'?)"));
    }
    message
}

fn closest_key<'a>(key: &str, valid: &[&'a str]) -> Option<&'a str> {
    valid
        .iter()
        .map(|candidate| (levenshtein_distance(key, candidate), *candidate))
        .filter(|(distance, candidate)| distance * 2 <= key.len().max(candidate.len()))
        .min()
        .map(|(_, candidate)| candidate)
}

fn levenshtein_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, ca) in a.chars().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            current[j + 1] = (previous[j + 1] + 1)
                .min(current[j] + 1)
                .min(previous[j] + cost);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}
