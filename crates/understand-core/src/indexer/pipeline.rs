//! Scan pipeline orchestration with Rayon-based parallelism.
//!
//! Files are extracted in parallel, resolved in parallel against a global
//! symbol index, then merged into a [`RepositoryMap`] in sorted file order so
//! the result does not depend on scheduling.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::UnderstandResult;
use crate::indexer::cache::ScanContext;
use crate::indexer::callgraph::{resolve_unit, FileUnit, SymbolIndex};
use crate::indexer::filesystem::{compute_content_hash, iter_repo_files, module_path, SourceFile};
use crate::indexer::functions::{extract_facts, FileFacts};
use crate::indexer::parser::parse_source;
use crate::indexer::side_effects::{RuleClassifier, SideEffectClassifier};
use crate::models::{qualify, FunctionRecord, RepositoryMap, LANGUAGE_PYTHON};
use crate::query::guards::{clamp_workers, DEFAULT_SCAN_WORKERS};

// ---------------------------------------------------------------------------
// Options and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub workers: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            workers: DEFAULT_SCAN_WORKERS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseStage {
    Read,
    Decode,
    Syntax,
}

/// Recovered condition reported alongside the Map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanWarning {
    ParseError {
        file: String,
        stage: ParseStage,
        line: Option<u32>,
        message: String,
    },
    NameCollision {
        qualified_name: String,
        /// `file:line` of the definition that was kept.
        kept: String,
        dropped: String,
    },
}

#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub map: RepositoryMap,
    pub warnings: Vec<ScanWarning>,
    pub files_seen: usize,
    pub files_parsed: usize,
    pub cache_hits: usize,
    pub elapsed_ms: u64,
}

impl ScanOutcome {
    pub fn parse_errors(&self) -> impl Iterator<Item = &ScanWarning> + '_ {
        self.warnings
            .iter()
            .filter(|w| matches!(w, ScanWarning::ParseError { .. }))
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

struct Extracted {
    facts: Arc<FileFacts>,
    cached: bool,
}

struct Failure {
    stage: ParseStage,
    line: Option<u32>,
    message: String,
}

fn extract_file_worker(file: &SourceFile, context: &ScanContext) -> Result<Extracted, Failure> {
    let bytes = std::fs::read(&file.path).map_err(|e| Failure {
        stage: ParseStage::Read,
        line: None,
        message: e.to_string(),
    })?;
    let content_hash = compute_content_hash(&bytes);
    if let Some(facts) = context.lookup(&file.relative, &content_hash) {
        debug!(file = %file.relative, "scan cache hit");
        return Ok(Extracted {
            facts,
            cached: true,
        });
    }

    let source = String::from_utf8(bytes).map_err(|e| Failure {
        stage: ParseStage::Decode,
        line: None,
        message: e.to_string(),
    })?;
    let unit = parse_source(source, file.language).map_err(|e| Failure {
        stage: ParseStage::Syntax,
        line: e.line,
        message: e.message,
    })?;
    let facts = Arc::new(extract_facts(&unit, &file.relative));
    debug!(
        file = %file.relative,
        functions = facts.functions.len(),
        imports = facts.imports.len(),
        "extracted file"
    );
    context.insert(&file.relative, &content_hash, Arc::clone(&facts));
    Ok(Extracted {
        facts,
        cached: false,
    })
}

/// Run `job` over `items` on a dedicated pool, falling back to sequential
/// execution when the pool cannot be built. Output order matches input.
fn run_parallel<T, R, F>(items: &[T], workers: usize, job: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    if items.is_empty() {
        return Vec::new();
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(clamp_workers(workers))
        .build();
    match pool {
        Ok(pool) => pool.install(|| items.par_iter().map(&job).collect()),
        Err(err) => {
            debug!(error = %err, "thread pool unavailable, scanning sequentially");
            items.iter().map(&job).collect()
        }
    }
}

// ---------------------------------------------------------------------------
// Scan
// ---------------------------------------------------------------------------

/// Scan `root` into a Repository Map with the built-in side-effect rules.
pub fn scan(
    root: &Path,
    options: &ScanOptions,
    context: &ScanContext,
) -> UnderstandResult<ScanOutcome> {
    scan_with(root, options, context, &RuleClassifier::builtin())
}

/// Scan `root` with a caller-supplied side-effect classifier.
///
/// A file that cannot be read, decoded or parsed is excluded and reported as
/// [`ScanWarning::ParseError`]; the scan itself only fails on invalid
/// include/exclude patterns.
pub fn scan_with(
    root: &Path,
    options: &ScanOptions,
    context: &ScanContext,
    classifier: &dyn SideEffectClassifier,
) -> UnderstandResult<ScanOutcome> {
    let started = Instant::now();
    let files = iter_repo_files(root, &options.include, &options.exclude)?;
    let results = run_parallel(&files, options.workers, |file| {
        extract_file_worker(file, context)
    });

    let mut warnings = Vec::new();
    let mut units = Vec::new();
    let mut cache_hits = 0;
    for (file, result) in files.iter().zip(results) {
        match result {
            Ok(extracted) => {
                cache_hits += usize::from(extracted.cached);
                units.push(FileUnit {
                    relative: file.relative.clone(),
                    module: module_path(&file.relative).to_string(),
                    facts: extracted.facts,
                });
            }
            Err(failure) => {
                warn!(
                    file = %file.relative,
                    stage = ?failure.stage,
                    line = ?failure.line,
                    message = %failure.message,
                    "skipping file that failed to parse"
                );
                warnings.push(ScanWarning::ParseError {
                    file: file.relative.clone(),
                    stage: failure.stage,
                    line: failure.line,
                    message: failure.message,
                });
            }
        }
    }

    let index = SymbolIndex::build(&units);
    let resolved = run_parallel(&units, options.workers, |unit| resolve_unit(unit, &index));

    // Units are in sorted path order and functions in line order, so the
    // first definition seen is the lowest (file, line_start).
    let mut functions: BTreeMap<String, FunctionRecord> = BTreeMap::new();
    for (unit, calls) in units.iter().zip(resolved) {
        for (function, calls) in unit.facts.functions.iter().zip(calls) {
            let qualified_name = qualify(&unit.module, &function.scope);
            if let Some(existing) = functions.get(&qualified_name) {
                let kept = format!("{}:{}", existing.file, existing.line_start);
                let dropped = format!("{}:{}", unit.relative, function.line_start);
                warn!(%qualified_name, %kept, %dropped, "duplicate qualified name");
                warnings.push(ScanWarning::NameCollision {
                    qualified_name,
                    kept,
                    dropped,
                });
                continue;
            }
            let side_effects = classifier.classify(function, &unit.facts);
            functions.insert(
                qualified_name,
                FunctionRecord {
                    file: unit.relative.clone(),
                    line_start: function.line_start,
                    line_end: function.line_end,
                    calls,
                    complexity: function.complexity.max(1),
                    side_effects,
                },
            );
        }
    }

    let map = RepositoryMap::new(LANGUAGE_PYTHON, functions);
    let outcome = ScanOutcome {
        files_seen: files.len(),
        files_parsed: units.len(),
        cache_hits,
        elapsed_ms: started.elapsed().as_millis() as u64,
        warnings,
        map,
    };
    info!(
        files_seen = outcome.files_seen,
        files_parsed = outcome.files_parsed,
        functions = outcome.map.len(),
        warnings = outcome.warnings.len(),
        cache_hits = outcome.cache_hits,
        elapsed_ms = outcome.elapsed_ms,
        "scan complete"
    );
    Ok(outcome)
}
