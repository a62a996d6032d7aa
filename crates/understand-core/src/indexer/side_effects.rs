//! Side-effect classification over extracted call sites.
//!
//! Classification is a syntactic heuristic: a function is tagged when one of
//! its call sites (or a `global` declaration) matches a rule. No dataflow is
//! involved. The classifier is a trait so callers can swap the rule engine
//! entirely; [`RuleClassifier`] is the built-in implementation and its rules
//! can be replaced from configuration.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::indexer::functions::{CallSite, ExtractedFunction, FileFacts, STAR_ALIAS};

/// Assigns side-effect tags to one function of a file.
pub trait SideEffectClassifier: Send + Sync {
    fn classify(&self, function: &ExtractedFunction, facts: &FileFacts) -> BTreeSet<String>;
}

/// One recognizer rule. A call matches when any of the listed criteria does.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SideEffectRule {
    pub tag: String,
    /// Bare callee names (`open`, `print`).
    #[serde(default)]
    pub callees: Vec<String>,
    /// Dotted module prefixes reached through imports (`os`, `http.client`).
    #[serde(default)]
    pub modules: Vec<String>,
    /// Last segment of a receiver chain (`logger` in `self.logger.info`).
    #[serde(default)]
    pub receivers: Vec<String>,
    /// Attribute names called on any receiver (`write_text`).
    #[serde(default)]
    pub methods: Vec<String>,
    /// Also matches functions with a `global`/`nonlocal` statement.
    #[serde(default)]
    pub global_declarations: bool,
}

impl SideEffectRule {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            callees: Vec::new(),
            modules: Vec::new(),
            receivers: Vec::new(),
            methods: Vec::new(),
            global_declarations: false,
        }
    }

    fn matches_module(&self, module: &str) -> bool {
        self.modules.iter().any(|prefix| {
            module == prefix
                || module
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }

    fn matches_call(&self, site: &CallSite, module: Option<&str>) -> bool {
        if site.receiver.is_none() && self.callees.iter().any(|c| *c == site.name) {
            return true;
        }
        if module.is_some_and(|m| self.matches_module(m)) {
            return true;
        }
        if let Some(receiver) = site.receiver.as_deref().filter(|r| !r.is_empty()) {
            let last = receiver.rsplit('.').next().unwrap_or(receiver);
            if self.receivers.iter().any(|r| r == last) {
                return true;
            }
        }
        site.receiver.is_some() && self.methods.iter().any(|m| *m == site.name)
    }
}

/// Dotted module a call goes through, when an import binds its head name.
pub fn call_module(site: &CallSite, facts: &FileFacts) -> Option<String> {
    let (head, rest) = match site.receiver.as_deref() {
        Some("") => return None,
        Some(receiver) => match receiver.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (receiver, None),
        },
        None => (site.name.as_str(), None),
    };
    let binding = facts.binding(head).filter(|b| b.alias != STAR_ALIAS)?;
    let mut module = binding.module.replace('/', ".");
    if let Some(symbol) = &binding.symbol {
        if site.receiver.is_some() {
            module.push('.');
            module.push_str(symbol);
        }
    }
    if let Some(rest) = rest {
        module.push('.');
        module.push_str(rest);
    }
    Some(module)
}

/// Rule-driven classifier.
#[derive(Clone, Debug)]
pub struct RuleClassifier {
    rules: Vec<SideEffectRule>,
}

impl RuleClassifier {
    pub fn new(rules: Vec<SideEffectRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[SideEffectRule] {
        &self.rules
    }

    /// Built-in recognizers for I/O, logging, network, processes, databases
    /// and global state.
    pub fn builtin() -> Self {
        Self::new(builtin_rules())
    }
}

impl Default for RuleClassifier {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SideEffectClassifier for RuleClassifier {
    fn classify(&self, function: &ExtractedFunction, facts: &FileFacts) -> BTreeSet<String> {
        let modules: Vec<Option<String>> = function
            .calls
            .iter()
            .map(|site| call_module(site, facts))
            .collect();
        let mut tags = BTreeSet::new();
        for rule in &self.rules {
            let hit = (rule.global_declarations && function.declares_global)
                || function
                    .calls
                    .iter()
                    .zip(&modules)
                    .any(|(site, module)| rule.matches_call(site, module.as_deref()));
            if hit {
                tags.insert(rule.tag.clone());
            }
        }
        tags
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

pub fn builtin_rules() -> Vec<SideEffectRule> {
    vec![
        SideEffectRule {
            callees: strings(&["open", "print", "input"]),
            modules: strings(&["os", "shutil", "pathlib", "io", "tempfile", "glob"]),
            methods: strings(&[
                "read_text",
                "write_text",
                "read_bytes",
                "write_bytes",
                "mkdir",
                "unlink",
            ]),
            ..SideEffectRule::new("io")
        },
        SideEffectRule {
            modules: strings(&["logging", "loguru", "structlog"]),
            receivers: strings(&["logger", "log", "_logger", "LOGGER"]),
            ..SideEffectRule::new("logging")
        },
        SideEffectRule {
            callees: strings(&["urlopen"]),
            modules: strings(&[
                "requests", "httpx", "urllib", "socket", "aiohttp", "http", "grpc", "smtplib",
                "ftplib",
            ]),
            ..SideEffectRule::new("network")
        },
        SideEffectRule {
            modules: strings(&["subprocess", "multiprocessing"]),
            ..SideEffectRule::new("process")
        },
        SideEffectRule {
            modules: strings(&["sqlite3", "psycopg2", "pymysql", "sqlalchemy"]),
            receivers: strings(&["cursor", "conn", "connection", "db"]),
            methods: strings(&["execute", "executemany", "commit", "rollback"]),
            ..SideEffectRule::new("database")
        },
        SideEffectRule {
            callees: strings(&["globals"]),
            global_declarations: true,
            ..SideEffectRule::new("global_state")
        },
    ]
}
