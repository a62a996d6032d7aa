//! Language parsing wrapper used by extraction passes.
//!
//! A tree containing any ERROR or MISSING node is treated as a failed parse:
//! partial trees produce plausible but wrong function boundaries.

use tree_sitter::{Node, Parser, Tree};

const SUPPORTED_LANGUAGES: &[&str] = &["python"];

/// Parsed source unit holding the source text and its syntax tree.
pub struct ParsedUnit {
    pub source: String,
    pub tree: Tree,
}

/// Why a source text could not be turned into a clean syntax tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    /// 1-based line of the first syntax error, when one could be located.
    pub line: Option<u32>,
    pub message: String,
}

fn new_parser(language: &str) -> Result<Parser, ParseFailure> {
    if !SUPPORTED_LANGUAGES.contains(&language) {
        return Err(ParseFailure {
            line: None,
            message: format!("Unsupported language: {language}"),
        });
    }
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| ParseFailure {
            line: None,
            message: format!("Failed to set language: {e}"),
        })?;
    Ok(parser)
}

pub fn parse_source(source: String, language: &str) -> Result<ParsedUnit, ParseFailure> {
    let mut parser = new_parser(language)?;
    let tree = parser
        .parse(source.as_bytes(), None)
        .ok_or_else(|| ParseFailure {
            line: None,
            message: "parser returned no tree".to_string(),
        })?;

    let root = tree.root_node();
    if root.has_error() {
        let (line, message) = match first_error(root) {
            Some(node) if node.is_missing() => (
                Some(node.start_position().row as u32 + 1),
                format!("missing `{}`", node.kind()),
            ),
            Some(node) => (
                Some(node.start_position().row as u32 + 1),
                "invalid syntax".to_string(),
            ),
            None => (None, "invalid syntax".to_string()),
        };
        return Err(ParseFailure { line, message });
    }

    Ok(ParsedUnit { source, tree })
}

/// First ERROR or MISSING node in document order.
fn first_error(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    if !node.has_error() {
        return None;
    }
    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
    children.into_iter().find_map(first_error)
}
