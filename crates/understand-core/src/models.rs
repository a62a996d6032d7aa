//! Shared artifact models: Repository Map, Lens, Trace and Tour.
//!
//! Every artifact here is a plain value. Stages produce new values rather
//! than mutating their inputs, and each artifact has a stable JSON shape
//! (field order is irrelevant) used for flat-file persistence by callers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::UnderstandResult;

/// Unique function identifier: `<module path>:<dotted scope>`.
pub type QualifiedName = String;

/// Language tag written into maps produced by the Python scanner.
pub const LANGUAGE_PYTHON: &str = "python";

// ---------------------------------------------------------------------------
// Qualified name helpers
// ---------------------------------------------------------------------------

/// Build a qualified name from a module path and a dotted scope.
pub fn qualify(module_path: &str, scope: &str) -> QualifiedName {
    format!("{module_path}:{scope}")
}

/// Split a qualified name into `(module path, dotted scope)`.
///
/// Names without a `:` are treated as a bare scope with an empty module.
pub fn split_qualified_name(qualified_name: &str) -> (&str, &str) {
    match qualified_name.rsplit_once(':') {
        Some((module, scope)) => (module, scope),
        None => ("", qualified_name),
    }
}

/// The innermost simple name of a qualified name (`pkg/m:A.run` -> `run`).
pub fn simple_name(qualified_name: &str) -> &str {
    let (_, scope) = split_qualified_name(qualified_name);
    scope.rsplit('.').next().unwrap_or(scope)
}

// ---------------------------------------------------------------------------
// Repository Map
// ---------------------------------------------------------------------------

/// Outcome of best-effort call resolution for one call expression.
///
/// Ambiguity is preserved rather than guessed: an unresolved call keeps the
/// callee text plus every known function it could plausibly refer to.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CallTarget {
    Resolved(QualifiedName),
    Unresolved {
        name: String,
        candidates: Vec<QualifiedName>,
    },
}

impl CallTarget {
    pub fn unresolved(name: impl Into<String>) -> Self {
        CallTarget::Unresolved {
            name: name.into(),
            candidates: Vec::new(),
        }
    }

    pub fn resolved(&self) -> Option<&str> {
        match self {
            CallTarget::Resolved(name) => Some(name),
            CallTarget::Unresolved { .. } => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, CallTarget::Resolved(_))
    }

    /// The string written to the `calls` array for this target.
    pub fn label(&self) -> &str {
        match self {
            CallTarget::Resolved(name) => name,
            CallTarget::Unresolved { name, .. } => name,
        }
    }
}

/// Per-function record of a Repository Map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "FunctionDocument", into = "FunctionDocument")]
pub struct FunctionRecord {
    pub file: String,
    pub line_start: u32,
    pub line_end: u32,
    pub calls: BTreeSet<CallTarget>,
    pub complexity: u32,
    pub side_effects: BTreeSet<String>,
}

impl FunctionRecord {
    /// Qualified names of every resolved outgoing call.
    pub fn resolved_calls(&self) -> impl Iterator<Item = &str> + '_ {
        self.calls.iter().filter_map(CallTarget::resolved)
    }

    pub fn unresolved_calls(&self) -> impl Iterator<Item = &CallTarget> + '_ {
        self.calls.iter().filter(|c| !c.is_resolved())
    }
}

/// Wire shape of a function record.
///
/// Resolved targets are qualified names and always contain `:`; unresolved
/// targets are callee expressions and never do. Candidate lists of ambiguous
/// unresolved calls travel in the optional `ambiguous` object.
#[derive(Serialize, Deserialize)]
struct FunctionDocument {
    file: String,
    line_start: u32,
    line_end: u32,
    calls: Vec<String>,
    complexity: u32,
    side_effects: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    ambiguous: BTreeMap<String, Vec<String>>,
}

impl From<FunctionRecord> for FunctionDocument {
    fn from(record: FunctionRecord) -> Self {
        let mut ambiguous = BTreeMap::new();
        let calls = record
            .calls
            .into_iter()
            .map(|target| match target {
                CallTarget::Resolved(name) => name,
                CallTarget::Unresolved { name, candidates } => {
                    if !candidates.is_empty() {
                        ambiguous.insert(name.clone(), candidates);
                    }
                    name
                }
            })
            .collect();
        FunctionDocument {
            file: record.file,
            line_start: record.line_start,
            line_end: record.line_end,
            calls,
            complexity: record.complexity,
            side_effects: record.side_effects.into_iter().collect(),
            ambiguous,
        }
    }
}

impl From<FunctionDocument> for FunctionRecord {
    fn from(doc: FunctionDocument) -> Self {
        let calls = doc
            .calls
            .into_iter()
            .map(|label| {
                if label.contains(':') {
                    CallTarget::Resolved(label)
                } else {
                    CallTarget::Unresolved {
                        candidates: doc.ambiguous.get(&label).cloned().unwrap_or_default(),
                        name: label,
                    }
                }
            })
            .collect();
        FunctionRecord {
            file: doc.file,
            line_start: doc.line_start,
            line_end: doc.line_end,
            calls,
            complexity: doc.complexity.max(1),
            side_effects: doc.side_effects.into_iter().collect(),
        }
    }
}

/// Immutable snapshot graph of functions, call edges and per-function metrics.
///
/// `callers` is the exact inverse of the resolved `calls` edges restricted to
/// known names. It is derived once at construction and never stored on disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "MapDocument", into = "MapDocument")]
pub struct RepositoryMap {
    language: String,
    functions: BTreeMap<QualifiedName, FunctionRecord>,
    callers: BTreeMap<QualifiedName, BTreeSet<QualifiedName>>,
}

#[derive(Serialize, Deserialize)]
struct MapDocument {
    language: String,
    functions: BTreeMap<QualifiedName, FunctionRecord>,
}

impl From<MapDocument> for RepositoryMap {
    fn from(doc: MapDocument) -> Self {
        RepositoryMap::new(doc.language, doc.functions)
    }
}

impl From<RepositoryMap> for MapDocument {
    fn from(map: RepositoryMap) -> Self {
        MapDocument {
            language: map.language,
            functions: map.functions,
        }
    }
}

fn invert_calls(
    functions: &BTreeMap<QualifiedName, FunctionRecord>,
) -> BTreeMap<QualifiedName, BTreeSet<QualifiedName>> {
    let mut callers: BTreeMap<QualifiedName, BTreeSet<QualifiedName>> = BTreeMap::new();
    for (caller, record) in functions {
        for target in record.resolved_calls() {
            if functions.contains_key(target) {
                callers
                    .entry(target.to_string())
                    .or_default()
                    .insert(caller.clone());
            }
        }
    }
    callers
}

impl RepositoryMap {
    pub fn new(
        language: impl Into<String>,
        functions: BTreeMap<QualifiedName, FunctionRecord>,
    ) -> Self {
        let callers = invert_calls(&functions);
        Self {
            language: language.into(),
            functions,
            callers,
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn functions(&self) -> &BTreeMap<QualifiedName, FunctionRecord> {
        &self.functions
    }

    pub fn get(&self, qualified_name: &str) -> Option<&FunctionRecord> {
        self.functions.get(qualified_name)
    }

    pub fn contains(&self, qualified_name: &str) -> bool {
        self.functions.contains_key(qualified_name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Resolved callees of `qualified_name` that are known to this map.
    pub fn callees<'a>(&'a self, qualified_name: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.functions
            .get(qualified_name)
            .into_iter()
            .flat_map(FunctionRecord::resolved_calls)
            .filter(move |target| self.functions.contains_key(*target))
    }

    /// Known functions with a resolved call to `qualified_name`.
    pub fn callers<'a>(&'a self, qualified_name: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.callers
            .get(qualified_name)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// The full derived caller relation.
    pub fn caller_relation(&self) -> &BTreeMap<QualifiedName, BTreeSet<QualifiedName>> {
        &self.callers
    }

    /// Neighbours in the call graph treated as undirected.
    pub fn neighbors<'a>(&'a self, qualified_name: &str) -> BTreeSet<&'a str> {
        self.callees(qualified_name)
            .chain(self.callers(qualified_name))
            .collect()
    }

    /// Most called targets by inbound call count, resolved or not.
    ///
    /// Ties are broken by name so the report is stable across scans.
    pub fn hotspots(&self, limit: usize) -> Vec<(String, usize)> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for record in self.functions.values() {
            for target in &record.calls {
                *counts.entry(target.label()).or_default() += 1;
            }
        }
        let mut ranked: Vec<(String, usize)> = counts
            .into_iter()
            .map(|(name, count)| (name.to_string(), count))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);
        ranked
    }

    pub fn to_json(&self) -> UnderstandResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> UnderstandResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// ---------------------------------------------------------------------------
// Lens
// ---------------------------------------------------------------------------

/// Ranking metadata of one function inside a Lens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LensMember {
    pub hop: u32,
    pub runtime_hit: bool,
    pub call_count: u64,
    /// `None` encodes "no path to any exception site" (serialized as `null`).
    pub error_proximity: Option<u32>,
    /// Resolved calls restricted to other lens members.
    #[serde(default)]
    pub calls: BTreeSet<QualifiedName>,
    /// Resolved calls leaving the lens.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub boundary_calls: BTreeSet<QualifiedName>,
}

impl LensMember {
    pub fn at_hop(hop: u32) -> Self {
        Self {
            hop,
            runtime_hit: false,
            call_count: 0,
            error_proximity: None,
            calls: BTreeSet::new(),
            boundary_calls: BTreeSet::new(),
        }
    }
}

/// Bounded, seed-centred subgraph view over a Repository Map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "LensDocument", into = "LensDocument")]
pub struct Lens {
    pub seeds: BTreeSet<QualifiedName>,
    pub hops: u32,
    pub members: BTreeMap<QualifiedName, LensMember>,
}

#[derive(Serialize, Deserialize)]
struct LensHeader {
    seeds: Vec<QualifiedName>,
    hops: u32,
}

#[derive(Serialize, Deserialize)]
struct LensDocument {
    lens: LensHeader,
    functions: BTreeMap<QualifiedName, LensMember>,
}

impl From<LensDocument> for Lens {
    fn from(doc: LensDocument) -> Self {
        Lens {
            seeds: doc.lens.seeds.into_iter().collect(),
            hops: doc.lens.hops,
            members: doc.functions,
        }
    }
}

impl From<Lens> for LensDocument {
    fn from(lens: Lens) -> Self {
        LensDocument {
            lens: LensHeader {
                seeds: lens.seeds.into_iter().collect(),
                hops: lens.hops,
            },
            functions: lens.members,
        }
    }
}

impl Lens {
    pub fn member(&self, qualified_name: &str) -> Option<&LensMember> {
        self.members.get(qualified_name)
    }

    pub fn contains(&self, qualified_name: &str) -> bool {
        self.members.contains_key(qualified_name)
    }

    pub fn is_seed(&self, qualified_name: &str) -> bool {
        self.seeds.contains(qualified_name)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn to_json(&self) -> UnderstandResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> UnderstandResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// ---------------------------------------------------------------------------
// Trace
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Call,
    Return,
    Exception,
}

/// One observed call-boundary event. Ordering is given by `seq`, not time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub seq: u64,
    pub qualified_name: QualifiedName,
    pub kind: EventKind,
    pub depth: u32,
}

/// Ordered record of one instrumented execution.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub events: Vec<TraceEvent>,
    #[serde(default)]
    pub truncated: bool,
}

impl Trace {
    /// Number of `call` events per function.
    pub fn call_counts(&self) -> BTreeMap<&str, u64> {
        let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
        for event in &self.events {
            if event.kind == EventKind::Call {
                *counts.entry(event.qualified_name.as_str()).or_default() += 1;
            }
        }
        counts
    }

    /// Functions at which an exception originated.
    pub fn exception_sites(&self) -> BTreeSet<&str> {
        self.events
            .iter()
            .filter(|e| e.kind == EventKind::Exception)
            .map(|e| e.qualified_name.as_str())
            .collect()
    }

    /// Join several runs into one trace, re-sequencing events in run order.
    pub fn concat<'a>(traces: impl IntoIterator<Item = &'a Trace>) -> Trace {
        let mut joined = Trace::default();
        for trace in traces {
            joined.truncated |= trace.truncated;
            for event in &trace.events {
                joined.events.push(TraceEvent {
                    seq: joined.events.len() as u64,
                    ..event.clone()
                });
            }
        }
        joined
    }

    pub fn to_json(&self) -> UnderstandResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> UnderstandResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// ---------------------------------------------------------------------------
// Tour
// ---------------------------------------------------------------------------

/// Dominant reason a function appears in a tour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StopReason {
    Seed,
    Caller,
    RuntimeHit,
    ErrorProximity(u32),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Seed => f.write_str("seed"),
            StopReason::Caller => f.write_str("caller"),
            StopReason::RuntimeHit => f.write_str("runtime_hit"),
            StopReason::ErrorProximity(n) => write!(f, "error_proximity({n})"),
        }
    }
}

impl FromStr for StopReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "seed" => Ok(StopReason::Seed),
            "caller" => Ok(StopReason::Caller),
            "runtime_hit" => Ok(StopReason::RuntimeHit),
            other => other
                .strip_prefix("error_proximity(")
                .and_then(|rest| rest.strip_suffix(')'))
                .and_then(|n| n.parse().ok())
                .map(StopReason::ErrorProximity)
                .ok_or_else(|| format!("unknown stop reason: {other}")),
        }
    }
}

impl Serialize for StopReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StopReason {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TourStop {
    pub qualified_name: QualifiedName,
    pub rank: u32,
    pub reason: StopReason,
}

/// Ordered, finite walkthrough derived from one ranked Lens.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tour {
    pub stops: Vec<TourStop>,
}

impl Tour {
    pub fn iter(&self) -> std::slice::Iter<'_, TourStop> {
        self.stops.iter()
    }

    pub fn len(&self) -> usize {
        self.stops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }

    /// First `limit` distinct module paths in tour order ("start here").
    pub fn start_modules(&self, limit: usize) -> Vec<&str> {
        let mut modules: Vec<&str> = Vec::new();
        for stop in &self.stops {
            let (module, _) = split_qualified_name(&stop.qualified_name);
            if !modules.contains(&module) {
                modules.push(module);
                if modules.len() == limit {
                    break;
                }
            }
        }
        modules
    }

    pub fn to_json(&self) -> UnderstandResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl<'a> IntoIterator for &'a Tour {
    type Item = &'a TourStop;
    type IntoIter = std::slice::Iter<'a, TourStop>;

    fn into_iter(self) -> Self::IntoIter {
        self.stops.iter()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
