//! Global symbol index with copy-on-write snapshots
//!
//! Readers resolve names against an immutable snapshot; writers rebuild and
//! publish a new snapshot at the tail of a successful commit. Lookups never
//! block ingestion.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::entity::SymbolKind;
use crate::types::EntityId;

/// One indexed symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolRecord {
    pub entity_id: EntityId,
    pub name: String,
    pub kind: SymbolKind,
    pub file_path: String,
    pub is_exported: bool,
    pub signature: String,
}

impl SymbolRecord {
    /// Qualified key: `path#name`.
    pub fn qualified(&self) -> String {
        format!("{}#{}", self.file_path, self.name)
    }
}

/// Immutable index state shared with readers.
#[derive(Debug, Default)]
pub struct SymbolSnapshot {
    by_qualified: HashMap<String, SymbolRecord>,
    by_name: HashMap<String, Vec<SymbolRecord>>,
    by_file: HashMap<String, Vec<String>>,
    files: HashSet<String>,
}

impl SymbolSnapshot {
    /// Exact lookup of a file-scoped symbol.
    pub fn lookup(&self, file_path: &str, name: &str) -> Option<&SymbolRecord> {
        self.by_qualified.get(&format!("{file_path}#{name}"))
    }

    /// All symbols sharing an exported name, across files.
    pub fn lookup_by_name(&self, name: &str) -> &[SymbolRecord] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Resolve a name only when exactly one exported symbol carries it.
    pub fn resolve_unique_export(&self, name: &str) -> Option<&SymbolRecord> {
        let candidates = self.lookup_by_name(name);
        let mut exported = candidates.iter().filter(|r| r.is_exported);
        let first = exported.next()?;
        if exported.next().is_some() {
            None
        } else {
            Some(first)
        }
    }

    pub fn symbols_in_file(&self, file_path: &str) -> Vec<&SymbolRecord> {
        self.by_file
            .get(file_path)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| self.by_qualified.get(k))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_file(&self, file_path: &str) -> bool {
        self.files.contains(file_path)
    }

    pub fn symbol_count(&self) -> usize {
        self.by_qualified.len()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

/// Concurrent index: read-mostly, publish-on-commit.
pub struct SymbolIndex {
    snapshot: RwLock<Arc<SymbolSnapshot>>,
}

impl SymbolIndex {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(SymbolSnapshot::default())),
        }
    }

    /// Current snapshot; cheap to clone, safe to hold across awaits.
    pub fn snapshot(&self) -> Arc<SymbolSnapshot> {
        self.snapshot.read().clone()
    }

    /// Replace the records of one file and publish a new snapshot.
    pub fn publish_file(&self, file_path: &str, records: Vec<SymbolRecord>) {
        let mut guard = self.snapshot.write();
        let mut next = clone_snapshot(&guard);
        remove_file_from(&mut next, file_path);
        let mut keys = Vec::with_capacity(records.len());
        for record in records {
            let key = record.qualified();
            next.by_name
                .entry(record.name.clone())
                .or_default()
                .push(record.clone());
            next.by_qualified.insert(key.clone(), record);
            keys.push(key);
        }
        next.by_file.insert(file_path.to_string(), keys);
        next.files.insert(file_path.to_string());
        *guard = Arc::new(next);
    }

    /// Drop a file and publish a new snapshot.
    pub fn remove_file(&self, file_path: &str) {
        let mut guard = self.snapshot.write();
        let mut next = clone_snapshot(&guard);
        remove_file_from(&mut next, file_path);
        next.files.remove(file_path);
        next.by_file.remove(file_path);
        *guard = Arc::new(next);
    }
}

impl Default for SymbolIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn clone_snapshot(snapshot: &Arc<SymbolSnapshot>) -> SymbolSnapshot {
    SymbolSnapshot {
        by_qualified: snapshot.by_qualified.clone(),
        by_name: snapshot.by_name.clone(),
        by_file: snapshot.by_file.clone(),
        files: snapshot.files.clone(),
    }
}

fn remove_file_from(snapshot: &mut SymbolSnapshot, file_path: &str) {
    if let Some(keys) = snapshot.by_file.get(file_path) {
        for key in keys.clone() {
            if let Some(record) = snapshot.by_qualified.remove(&key) {
                if let Some(named) = snapshot.by_name.get_mut(&record.name) {
                    named.retain(|r| r.file_path != file_path);
                    if named.is_empty() {
                        snapshot.by_name.remove(&record.name);
                    }
                }
            }
        }
    }
}

/// Resolve a module specifier against the set of indexed files.
///
/// Relative specifiers resolve to repository paths (adding common source
/// extensions and index files); bare specifiers are external packages.
pub fn resolve_module(from_file: &str, specifier: &str, snapshot: &SymbolSnapshot) -> ModuleTarget {
    if !specifier.starts_with('.') {
        return ModuleTarget::External(specifier.to_string());
    }
    let base_dir = match from_file.rsplit_once('/') {
        Some((dir, _)) => dir,
        None => "",
    };
    let joined = join_relative(base_dir, specifier);
    const EXTENSIONS: &[&str] = &["", ".ts", ".tsx", ".js", ".jsx", ".py", ".rs"];
    for ext in EXTENSIONS {
        let candidate = format!("{joined}{ext}");
        if snapshot.has_file(&candidate) {
            return ModuleTarget::File(candidate);
        }
    }
    for index in ["/index.ts", "/index.js", "/__init__.py", "/mod.rs"] {
        let candidate = format!("{joined}{index}");
        if snapshot.has_file(&candidate) {
            return ModuleTarget::File(candidate);
        }
    }
    ModuleTarget::Unresolved(joined)
}

/// Outcome of module resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleTarget {
    /// Resolved to an indexed repository file.
    File(String),
    /// Bare specifier: an external package.
    External(String),
    /// Relative path with no indexed file behind it.
    Unresolved(String),
}

fn join_relative(base_dir: &str, specifier: &str) -> String {
    let mut segments: Vec<&str> = if base_dir.is_empty() {
        Vec::new()
    } else {
        base_dir.split('/').collect()
    };
    for part in specifier.split('/') {
        match part {
            "." | "" => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, file: &str, exported: bool) -> SymbolRecord {
        SymbolRecord {
            entity_id: EntityId::new(format!("sym:{file}#{name}")).unwrap(),
            name: name.to_string(),
            kind: SymbolKind::Function,
            file_path: file.to_string(),
            is_exported: exported,
            signature: format!("function {name}()"),
        }
    }

    #[test]
    fn publish_and_lookup() {
        let index = SymbolIndex::new();
        index.publish_file("src/a.ts", vec![record("foo", "src/a.ts", true)]);
        let snapshot = index.snapshot();
        assert!(snapshot.lookup("src/a.ts", "foo").is_some());
        assert_eq!(snapshot.lookup_by_name("foo").len(), 1);
        assert_eq!(snapshot.symbol_count(), 1);
    }

    #[test]
    fn republishing_a_file_replaces_its_records() {
        let index = SymbolIndex::new();
        index.publish_file("src/a.ts", vec![record("foo", "src/a.ts", true)]);
        index.publish_file("src/a.ts", vec![record("renamed", "src/a.ts", true)]);
        let snapshot = index.snapshot();
        assert!(snapshot.lookup("src/a.ts", "foo").is_none());
        assert!(snapshot.lookup("src/a.ts", "renamed").is_some());
    }

    #[test]
    fn old_snapshots_survive_publishes() {
        let index = SymbolIndex::new();
        index.publish_file("src/a.ts", vec![record("foo", "src/a.ts", true)]);
        let old = index.snapshot();
        index.remove_file("src/a.ts");
        // The retained snapshot still sees the old state
        assert!(old.lookup("src/a.ts", "foo").is_some());
        assert!(index.snapshot().lookup("src/a.ts", "foo").is_none());
    }

    #[test]
    fn unique_export_resolution_refuses_ambiguity() {
        let index = SymbolIndex::new();
        index.publish_file("src/a.ts", vec![record("shared", "src/a.ts", true)]);
        index.publish_file("src/b.ts", vec![record("shared", "src/b.ts", true)]);
        index.publish_file("src/c.ts", vec![record("unique", "src/c.ts", true)]);
        let snapshot = index.snapshot();
        assert!(snapshot.resolve_unique_export("shared").is_none());
        assert!(snapshot.resolve_unique_export("unique").is_some());
    }

    #[test]
    fn module_resolution_handles_relative_paths() {
        let index = SymbolIndex::new();
        index.publish_file("src/auth.ts", vec![record("login", "src/auth.ts", true)]);
        let snapshot = index.snapshot();
        assert_eq!(
            resolve_module("src/app.ts", "./auth", &snapshot),
            ModuleTarget::File("src/auth.ts".to_string())
        );
        assert_eq!(
            resolve_module("src/app.ts", "lodash", &snapshot),
            ModuleTarget::External("lodash".to_string())
        );
        assert_eq!(
            resolve_module("src/nested/deep.ts", "../auth", &snapshot),
            ModuleTarget::File("src/auth.ts".to_string())
        );
    }
}
