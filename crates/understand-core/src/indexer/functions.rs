//! Function, call-site and import extraction from Python syntax trees.
//!
//! Extraction is purely per-file: nothing here looks at other files, so the
//! resulting [`FileFacts`] can be memoized by content hash and computed in
//! parallel.

use serde::{Deserialize, Serialize};
use tree_sitter::Node;

use crate::indexer::parser::ParsedUnit;

// ---------------------------------------------------------------------------
// Extracted types
// ---------------------------------------------------------------------------

/// One call expression inside a function body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    /// Dotted receiver text for `a.b.name(...)`; empty when the receiver is
    /// not a plain name chain (`f().name(...)`); `None` for bare calls.
    pub receiver: Option<String>,
    pub name: String,
}

impl CallSite {
    /// Callee text as written, used for unresolved call labels.
    pub fn callee_text(&self) -> String {
        match self.receiver.as_deref() {
            Some(receiver) if !receiver.is_empty() => format!("{receiver}.{}", self.name),
            _ => self.name.clone(),
        }
    }

    pub fn receiver_root(&self) -> Option<&str> {
        self.receiver
            .as_deref()
            .filter(|r| !r.is_empty())
            .and_then(|r| r.split('.').next())
    }
}

/// A function or method definition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedFunction {
    /// Dotted scope inside the module (`Class.method`, `outer.inner`).
    pub scope: String,
    /// Dotted scope of the class this function is a method of.
    pub class_scope: Option<String>,
    pub line_start: u32,
    pub line_end: u32,
    pub complexity: u32,
    pub calls: Vec<CallSite>,
    /// Body contains a `global` or `nonlocal` statement.
    pub declares_global: bool,
}

/// A name bound by an import statement.
///
/// `module` is a posix module path (`pkg/service`) with relative imports
/// already anchored at the importing file's package. Star imports use the
/// alias `*`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportBinding {
    pub alias: String,
    pub module: String,
    pub symbol: Option<String>,
}

pub const STAR_ALIAS: &str = "*";

/// Everything the scanner needs from one file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFacts {
    pub functions: Vec<ExtractedFunction>,
    /// Dotted scopes of every class defined in the file.
    pub classes: Vec<String>,
    pub imports: Vec<ImportBinding>,
}

impl FileFacts {
    pub fn binding(&self, alias: &str) -> Option<&ImportBinding> {
        self.imports.iter().find(|b| b.alias == alias)
    }
}

/// Node kinds that add one independent path through a function.
const DECISION_KINDS: &[&str] = &[
    "if_statement",
    "elif_clause",
    "for_statement",
    "while_statement",
    "except_clause",
    "boolean_operator",
    "conditional_expression",
    "for_in_clause",
    "if_clause",
    "case_clause",
];

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

struct Extractor<'a> {
    source: &'a [u8],
    package_dir: String,
    facts: FileFacts,
}

/// Extract functions, classes and imports from a parsed file.
///
/// `relative` is the posix path of the file relative to the scan root; it
/// anchors relative imports.
pub fn extract_facts(unit: &ParsedUnit, relative: &str) -> FileFacts {
    let package_dir = relative
        .rsplit_once('/')
        .map(|(dir, _)| dir.to_string())
        .unwrap_or_default();
    let mut extractor = Extractor {
        source: unit.source.as_bytes(),
        package_dir,
        facts: FileFacts::default(),
    };
    extractor.visit(unit.tree.root_node(), &[], None, None);
    extractor.facts
}

impl<'a> Extractor<'a> {
    fn text(&self, node: Node<'_>) -> String {
        node.utf8_text(self.source).unwrap_or_default().to_string()
    }

    fn visit_children(
        &mut self,
        node: Node<'_>,
        scope: &[String],
        class_scope: Option<&str>,
        current: Option<usize>,
    ) {
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        for child in children {
            self.visit(child, scope, class_scope, current);
        }
    }

    fn visit(
        &mut self,
        node: Node<'_>,
        scope: &[String],
        class_scope: Option<&str>,
        current: Option<usize>,
    ) {
        match node.kind() {
            "function_definition" => {
                let Some(name) = node.child_by_field_name("name").map(|n| self.text(n)) else {
                    return;
                };
                let mut path = scope.to_vec();
                path.push(name);
                let index = self.facts.functions.len();
                self.facts.functions.push(ExtractedFunction {
                    scope: path.join("."),
                    class_scope: class_scope.map(str::to_string),
                    line_start: node.start_position().row as u32 + 1,
                    line_end: node.end_position().row as u32 + 1,
                    complexity: 1,
                    calls: Vec::new(),
                    declares_global: false,
                });
                // Defaults run in the enclosing scope, the body in the new one.
                if let Some(params) = node.child_by_field_name("parameters") {
                    self.visit(params, scope, class_scope, current);
                }
                if let Some(body) = node.child_by_field_name("body") {
                    self.visit(body, &path, None, Some(index));
                }
            }
            "class_definition" => {
                let Some(name) = node.child_by_field_name("name").map(|n| self.text(n)) else {
                    return;
                };
                let mut path = scope.to_vec();
                path.push(name);
                let dotted = path.join(".");
                self.facts.classes.push(dotted.clone());
                if let Some(bases) = node.child_by_field_name("superclasses") {
                    self.visit(bases, scope, class_scope, current);
                }
                if let Some(body) = node.child_by_field_name("body") {
                    self.visit(body, &path, Some(&dotted), current);
                }
            }
            "call" => {
                if let Some(index) = current {
                    if let Some(site) = node
                        .child_by_field_name("function")
                        .and_then(|f| self.call_site(f))
                    {
                        self.facts.functions[index].calls.push(site);
                    }
                }
                self.visit_children(node, scope, class_scope, current);
            }
            "global_statement" | "nonlocal_statement" => {
                if let Some(index) = current {
                    self.facts.functions[index].declares_global = true;
                }
            }
            "import_statement" | "import_from_statement" => self.collect_imports(node),
            kind => {
                if let Some(index) = current {
                    if DECISION_KINDS.contains(&kind) {
                        self.facts.functions[index].complexity += 1;
                    }
                }
                self.visit_children(node, scope, class_scope, current);
            }
        }
    }

    fn call_site(&self, function: Node<'_>) -> Option<CallSite> {
        match function.kind() {
            "identifier" => Some(CallSite {
                receiver: None,
                name: self.text(function),
            }),
            "attribute" => {
                let name = self.text(function.child_by_field_name("attribute")?);
                let receiver = function
                    .child_by_field_name("object")
                    .and_then(|object| self.dotted_text(object))
                    .unwrap_or_default();
                Some(CallSite {
                    receiver: Some(receiver),
                    name,
                })
            }
            _ => None,
        }
    }

    fn dotted_text(&self, node: Node<'_>) -> Option<String> {
        match node.kind() {
            "identifier" => Some(self.text(node)),
            "attribute" => {
                let object = self.dotted_text(node.child_by_field_name("object")?)?;
                let attr = self.text(node.child_by_field_name("attribute")?);
                Some(format!("{object}.{attr}"))
            }
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // Imports
    // -----------------------------------------------------------------------

    fn collect_imports(&mut self, node: Node<'_>) {
        let mut cursor = node.walk();
        let names: Vec<Node<'_>> = node.children_by_field_name("name", &mut cursor).collect();

        if node.kind() == "import_statement" {
            for name in names {
                match name.kind() {
                    "aliased_import" => {
                        let (Some(module), Some(alias)) = (
                            name.child_by_field_name("name"),
                            name.child_by_field_name("alias"),
                        ) else {
                            continue;
                        };
                        self.facts.imports.push(ImportBinding {
                            alias: self.text(alias),
                            module: self.text(module).replace('.', "/"),
                            symbol: None,
                        });
                    }
                    _ => {
                        // `import a.b` binds `a`; `a.b.f()` walks down from it.
                        let dotted = self.text(name);
                        let root = dotted.split('.').next().unwrap_or_default().to_string();
                        self.facts.imports.push(ImportBinding {
                            alias: root.clone(),
                            module: root,
                            symbol: None,
                        });
                    }
                }
            }
            return;
        }

        let Some(module) = node
            .child_by_field_name("module_name")
            .map(|m| self.from_module(m))
        else {
            return;
        };

        let mut cursor = node.walk();
        let is_star = node
            .children(&mut cursor)
            .any(|child| child.kind() == "wildcard_import");
        if is_star {
            self.facts.imports.push(ImportBinding {
                alias: STAR_ALIAS.to_string(),
                module: module.clone(),
                symbol: None,
            });
        }

        for name in names {
            let (symbol, alias) = match name.kind() {
                "aliased_import" => {
                    let (Some(symbol), Some(alias)) = (
                        name.child_by_field_name("name"),
                        name.child_by_field_name("alias"),
                    ) else {
                        continue;
                    };
                    (self.text(symbol), self.text(alias))
                }
                _ => {
                    let symbol = self.text(name);
                    (symbol.clone(), symbol)
                }
            };
            self.facts.imports.push(ImportBinding {
                alias,
                module: module.clone(),
                symbol: Some(symbol),
            });
        }
    }

    /// Posix module path of a `from X import` source, anchoring relative imports.
    fn from_module(&self, module: Node<'_>) -> String {
        if module.kind() != "relative_import" {
            return self.text(module).replace('.', "/");
        }
        let mut levels = 0;
        let mut tail = None;
        let mut cursor = module.walk();
        for child in module.children(&mut cursor) {
            match child.kind() {
                "import_prefix" => levels = self.text(child).matches('.').count(),
                "dotted_name" => tail = Some(self.text(child)),
                _ => {}
            }
        }
        let mut parts: Vec<&str> = self
            .package_dir
            .split('/')
            .filter(|p| !p.is_empty())
            .collect();
        for _ in 1..levels {
            parts.pop();
        }
        let mut path = parts.join("/");
        if let Some(tail) = tail {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(&tail.replace('.', "/"));
        }
        path
    }
}
