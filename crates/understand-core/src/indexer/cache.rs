//! Explicit scan context: parsed-file memo plus an optional SQLite store.
//!
//! Entries are keyed by relative path and validated by SHA-256 content hash,
//! so a stale entry is never served. The context is passed into every scan;
//! nothing is cached in process-wide state. Store failures are logged and
//! treated as misses.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::errors::UnderstandResult;
use crate::indexer::functions::FileFacts;

/// Bumped whenever the shape of [`FileFacts`] changes.
pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS file_facts (
        path TEXT PRIMARY KEY,
        content_hash TEXT NOT NULL,
        facts TEXT NOT NULL,
        updated_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
];

struct MemoEntry {
    content_hash: String,
    facts: Arc<FileFacts>,
}

/// Shareable handle threaded through scans. Cheap to create; safe to use
/// from several concurrent scans.
#[derive(Default)]
pub struct ScanContext {
    memo: Mutex<HashMap<String, MemoEntry>>,
    store: Option<Mutex<Connection>>,
}

impl ScanContext {
    /// Context with an in-memory memo only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context backed by a SQLite file, created if missing.
    pub fn with_store(db_path: &Path) -> UnderstandResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        migrate(&conn)?;
        Ok(Self {
            memo: Mutex::new(HashMap::new()),
            store: Some(Mutex::new(conn)),
        })
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Cached facts for `path` when its content hash still matches.
    pub fn lookup(&self, path: &str, content_hash: &str) -> Option<Arc<FileFacts>> {
        if let Some(entry) = self.memo.lock().get(path) {
            if entry.content_hash == content_hash {
                return Some(Arc::clone(&entry.facts));
            }
        }

        let store = self.store.as_ref()?;
        let loaded = match load_row(&store.lock(), path, content_hash) {
            Ok(row) => row?,
            Err(err) => {
                warn!(path, error = %err, "scan cache read failed");
                return None;
            }
        };
        let facts = Arc::new(loaded);
        self.memo.lock().insert(
            path.to_string(),
            MemoEntry {
                content_hash: content_hash.to_string(),
                facts: Arc::clone(&facts),
            },
        );
        Some(facts)
    }

    pub fn insert(&self, path: &str, content_hash: &str, facts: Arc<FileFacts>) {
        if let Some(store) = &self.store {
            if let Err(err) = save_row(&store.lock(), path, content_hash, &facts) {
                warn!(path, error = %err, "scan cache write failed");
            }
        }
        self.memo.lock().insert(
            path.to_string(),
            MemoEntry {
                content_hash: content_hash.to_string(),
                facts,
            },
        );
    }

    /// Number of memoized files.
    pub fn len(&self) -> usize {
        self.memo.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.memo.lock().is_empty()
    }

    pub fn clear(&self) {
        self.memo.lock().clear();
    }
}

fn migrate(conn: &Connection) -> UnderstandResult<()> {
    let version: i32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if version != SCHEMA_VERSION {
        // Older rows may not deserialize into the current facts shape.
        conn.execute_batch("DROP TABLE IF EXISTS file_facts;")?;
    }
    for statement in SCHEMA_STATEMENTS {
        conn.execute_batch(statement)?;
    }
    conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
    Ok(())
}

fn load_row(
    conn: &Connection,
    path: &str,
    content_hash: &str,
) -> UnderstandResult<Option<FileFacts>> {
    let row: Option<String> = conn
        .query_row(
            "SELECT facts FROM file_facts WHERE path = ?1 AND content_hash = ?2;",
            params![path, content_hash],
            |row| row.get(0),
        )
        .optional()?;
    match row {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

fn save_row(
    conn: &Connection,
    path: &str,
    content_hash: &str,
    facts: &FileFacts,
) -> UnderstandResult<()> {
    let text = serde_json::to_string(facts)?;
    conn.execute(
        "INSERT INTO file_facts(path, content_hash, facts) VALUES(?1, ?2, ?3) \
         ON CONFLICT(path) DO UPDATE SET content_hash = excluded.content_hash, \
         facts = excluded.facts, updated_at = CURRENT_TIMESTAMP;",
        params![path, content_hash, text],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::functions::ExtractedFunction;

    fn sample_facts() -> Arc<FileFacts> {
        Arc::new(FileFacts {
            functions: vec![ExtractedFunction {
                scope: "f".to_string(),
                class_scope: None,
                line_start: 1,
                line_end: 2,
                complexity: 1,
                calls: vec![],
                declares_global: false,
            }],
            classes: vec![],
            imports: vec![],
        })
    }

    #[test]
    fn test_memo_hit_requires_matching_hash() {
        let ctx = ScanContext::new();
        ctx.insert("a.py", "h1", sample_facts());
        assert!(ctx.lookup("a.py", "h1").is_some());
        assert!(ctx.lookup("a.py", "h2").is_none());
        assert!(ctx.lookup("b.py", "h1").is_none());
        assert_eq!(ctx.len(), 1);
        ctx.clear();
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_store_survives_new_context() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("cache").join("scan.sqlite");
        {
            let ctx = ScanContext::with_store(&db).unwrap();
            ctx.insert("a.py", "h1", sample_facts());
        }
        let ctx = ScanContext::with_store(&db).unwrap();
        assert!(ctx.has_store());
        let facts = ctx.lookup("a.py", "h1").unwrap();
        assert_eq!(facts.functions[0].scope, "f");
        assert!(ctx.lookup("a.py", "other").is_none());
    }

    #[test]
    fn test_store_drops_rows_from_other_schema_versions() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("scan.sqlite");
        {
            let ctx = ScanContext::with_store(&db).unwrap();
            ctx.insert("a.py", "h1", sample_facts());
        }
        {
            let conn = Connection::open(&db).unwrap();
            conn.execute_batch("PRAGMA user_version = 0;").unwrap();
        }
        let ctx = ScanContext::with_store(&db).unwrap();
        assert!(ctx.lookup("a.py", "h1").is_none());
    }
}
