//! Call graph construction from per-file facts and a global symbol index.
//!
//! Resolution is cascading and best-effort: self/cls method > lexical scope
//! in the same file > import-bound names > same package > star imports >
//! class-qualified calls. Anything left over becomes
//! [`CallTarget::Unresolved`] carrying every known function sharing the
//! callee's simple name, so ambiguity survives into the Map.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::indexer::functions::{CallSite, ExtractedFunction, FileFacts, STAR_ALIAS};
use crate::models::{qualify, simple_name, split_qualified_name, CallTarget, QualifiedName};
use crate::query::guards::MAX_UNRESOLVED_CANDIDATES;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Extraction result for one file, as consumed by resolution.
#[derive(Debug, Clone)]
pub struct FileUnit {
    pub relative: String,
    /// Module path: the relative path without its extension.
    pub module: String,
    pub facts: Arc<FileFacts>,
}

#[derive(Debug, Default)]
struct ModuleSymbols {
    functions: HashSet<String>,
    classes: HashSet<String>,
}

/// Global lookup tables over every successfully parsed file.
#[derive(Debug, Default)]
pub struct SymbolIndex {
    modules: HashMap<String, ModuleSymbols>,
    /// Import path suffix -> module paths ending with it (`__init__` folded).
    suffixes: HashMap<String, Vec<String>>,
    /// Simple name -> sorted qualified names.
    by_simple: HashMap<String, Vec<QualifiedName>>,
}

fn module_dir(module: &str) -> &str {
    module.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

impl SymbolIndex {
    pub fn build(units: &[FileUnit]) -> Self {
        let mut index = SymbolIndex::default();
        for unit in units {
            let symbols = index.modules.entry(unit.module.clone()).or_default();
            for function in &unit.facts.functions {
                symbols.functions.insert(function.scope.clone());
            }
            symbols.classes.extend(unit.facts.classes.iter().cloned());

            let package = unit.module.strip_suffix("/__init__").unwrap_or(&unit.module);
            let segments: Vec<&str> = package.split('/').collect();
            for start in 0..segments.len() {
                index
                    .suffixes
                    .entry(segments[start..].join("/"))
                    .or_default()
                    .push(unit.module.clone());
            }
        }

        for (module, symbols) in &index.modules {
            for scope in &symbols.functions {
                let qualified = qualify(module, scope);
                index
                    .by_simple
                    .entry(simple_name(&qualified).to_string())
                    .or_default()
                    .push(qualified);
            }
        }
        for names in index.by_simple.values_mut() {
            names.sort();
            names.dedup();
        }
        for modules in index.suffixes.values_mut() {
            modules.sort();
            modules.dedup();
        }
        index
    }

    fn has_function(&self, module: &str, scope: &str) -> bool {
        self.modules
            .get(module)
            .is_some_and(|m| m.functions.contains(scope))
    }

    fn has_class(&self, module: &str, scope: &str) -> bool {
        self.modules
            .get(module)
            .is_some_and(|m| m.classes.contains(scope))
    }

    /// Modules an import path can refer to. A module whose full path equals
    /// the import path shadows suffix matches.
    fn find_modules(&self, import_path: &str) -> Vec<&str> {
        let Some(modules) = self.suffixes.get(import_path) else {
            return Vec::new();
        };
        let exact: Vec<&str> = modules
            .iter()
            .map(String::as_str)
            .filter(|m| m.strip_suffix("/__init__").unwrap_or(m) == import_path)
            .collect();
        if exact.is_empty() {
            modules.iter().map(String::as_str).collect()
        } else {
            exact
        }
    }

    /// Function `scope` (or the constructor of class `scope`) in `module`.
    fn callable_in(&self, module: &str, scope: &str) -> Option<QualifiedName> {
        if self.has_function(module, scope) {
            return Some(qualify(module, scope));
        }
        let init = format!("{scope}.__init__");
        if self.has_class(module, scope) && self.has_function(module, &init) {
            return Some(qualify(module, &init));
        }
        None
    }

    fn lookup(&self, import_path: &str, scope: &str) -> Vec<QualifiedName> {
        self.find_modules(import_path)
            .into_iter()
            .filter_map(|module| self.callable_in(module, scope))
            .collect()
    }

    pub fn candidates(&self, simple_name: &str) -> &[QualifiedName] {
        self.by_simple
            .get(simple_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

enum Lookup {
    Found(QualifiedName),
    Ambiguous(Vec<QualifiedName>),
    Missing,
}

impl Lookup {
    fn from_matches(mut matches: Vec<QualifiedName>) -> Self {
        matches.sort();
        matches.dedup();
        match matches.len() {
            0 => Lookup::Missing,
            1 => Lookup::Found(matches.remove(0)),
            _ => Lookup::Ambiguous(matches),
        }
    }
}

struct Resolver<'a> {
    index: &'a SymbolIndex,
    unit: &'a FileUnit,
}

impl<'a> Resolver<'a> {
    fn resolve(&self, function: &ExtractedFunction, site: &CallSite) -> Lookup {
        let module = self.unit.module.as_str();
        let facts = &self.unit.facts;

        // 1. self.method() / cls.method() inside a class body.
        if let (Some(class_scope), Some(receiver)) =
            (&function.class_scope, site.receiver.as_deref())
        {
            if receiver == "self" || receiver == "cls" {
                let method = format!("{class_scope}.{}", site.name);
                if let Some(found) = self.index.callable_in(module, &method) {
                    return Lookup::Found(found);
                }
            }
        }

        if site.receiver.is_none() {
            // 2. lexical scope chain within the same file.
            let mut scope = function.scope.as_str();
            loop {
                let nested = format!("{scope}.{}", site.name);
                if let Some(found) = self.index.callable_in(module, &nested) {
                    return Lookup::Found(found);
                }
                match scope.rsplit_once('.') {
                    Some((parent, _)) => scope = parent,
                    None => break,
                }
            }
            if let Some(found) = self.index.callable_in(module, &site.name) {
                return Lookup::Found(found);
            }
        }

        // 3. names bound by imports.
        match self.resolve_import(site, facts) {
            Lookup::Missing => {}
            other => return other,
        }

        if site.receiver.is_none() {
            // 4. same package directory.
            let dir = module_dir(module);
            let siblings: Vec<QualifiedName> = self
                .index
                .candidates(&site.name)
                .iter()
                .filter(|qn| {
                    let (other, scope) = split_qualified_name(qn);
                    other != module && scope == site.name && module_dir(other) == dir
                })
                .cloned()
                .collect();
            if siblings.len() == 1 {
                return Lookup::from_matches(siblings);
            }

            // 5. star imports.
            let starred: Vec<QualifiedName> = facts
                .imports
                .iter()
                .filter(|b| b.alias == STAR_ALIAS)
                .flat_map(|b| self.index.lookup(&b.module, &site.name))
                .collect();
            if let Lookup::Found(found) = Lookup::from_matches(starred) {
                return Lookup::Found(found);
            }
        }

        // 6. Class.method() on a class defined in this file.
        if let Some(receiver) = site.receiver.as_deref().filter(|r| !r.is_empty()) {
            if self.index.has_class(module, receiver) {
                let method = format!("{receiver}.{}", site.name);
                if let Some(found) = self.index.callable_in(module, &method) {
                    return Lookup::Found(found);
                }
            }
        }

        Lookup::Missing
    }

    fn resolve_import(&self, site: &CallSite, facts: &FileFacts) -> Lookup {
        let Some(head) = site.receiver_root().or(if site.receiver.is_none() {
            Some(site.name.as_str())
        } else {
            None
        }) else {
            return Lookup::Missing;
        };
        let Some(binding) = facts.binding(head).filter(|b| b.alias != STAR_ALIAS) else {
            return Lookup::Missing;
        };

        let mut matches = Vec::new();
        match site.receiver.as_deref() {
            None => {
                // from m import f; f()
                if let Some(symbol) = &binding.symbol {
                    matches.extend(self.index.lookup(&binding.module, symbol));
                }
            }
            Some(receiver) => {
                let rest: Vec<&str> = receiver.split('.').skip(1).collect();
                let mut base = binding.module.clone();
                let mut path: Vec<&str> = Vec::new();
                if let Some(symbol) = &binding.symbol {
                    path.push(symbol);
                }
                path.extend(rest);

                // Receiver chain read as submodules: m.sub.f()
                let mut as_module = base.clone();
                for segment in &path {
                    as_module.push('/');
                    as_module.push_str(segment);
                }
                matches.extend(self.index.lookup(&as_module, &site.name));

                // Or the last segment is a class: m.Klass.f()
                if matches.is_empty() {
                    if let Some((class_name, modules)) = path.split_last() {
                        for segment in modules {
                            base.push('/');
                            base.push_str(segment);
                        }
                        matches.extend(
                            self.index
                                .lookup(&base, &format!("{class_name}.{}", site.name)),
                        );
                    }
                }
            }
        }
        Lookup::from_matches(matches)
    }
}

/// Resolve every call of every function in `unit`.
///
/// Returns one call-target set per function, in extraction order.
pub fn resolve_unit(unit: &FileUnit, index: &SymbolIndex) -> Vec<BTreeSet<CallTarget>> {
    let resolver = Resolver { index, unit };
    unit.facts
        .functions
        .iter()
        .map(|function| {
            let mut resolved: BTreeSet<CallTarget> = BTreeSet::new();
            let mut unresolved: BTreeMap<String, BTreeSet<QualifiedName>> = BTreeMap::new();
            for site in &function.calls {
                match resolver.resolve(function, site) {
                    Lookup::Found(name) => {
                        resolved.insert(CallTarget::Resolved(name));
                    }
                    Lookup::Ambiguous(candidates) => {
                        unresolved
                            .entry(site.callee_text())
                            .or_default()
                            .extend(candidates);
                    }
                    Lookup::Missing => {
                        unresolved
                            .entry(site.callee_text())
                            .or_default()
                            .extend(index.candidates(&site.name).iter().cloned());
                    }
                }
            }
            resolved.extend(unresolved.into_iter().map(|(name, candidates)| {
                CallTarget::Unresolved {
                    name,
                    candidates: candidates
                        .into_iter()
                        .take(MAX_UNRESOLVED_CANDIDATES)
                        .collect(),
                }
            }));
            resolved
        })
        .collect()
}
