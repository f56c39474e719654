//! Typed entity model for the code knowledge graph
//!
//! Entities are a tagged union over everything the graph indexes: files,
//! directories, modules, symbols, tests, specs, documentation, and the
//! session/versioning records the temporal layer relies on. Cross-cutting
//! attributes live on the envelope; variant payloads carry only what the
//! variant needs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::types::{EntityId, RepoPath};

/// Maximum characters of content folded into an embedding digest.
pub const CONTENT_DIGEST_CAP: usize = 5000;

/// Source location in line/column form (1-based lines, 0-based columns,
/// matching tree-sitter points).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SourceLocation {
    pub start_line: usize,
    pub start_column: usize,
    pub end_line: usize,
    pub end_column: usize,
}

/// Symbol classification shared by the parser and the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SymbolKind {
    Function,
    Class,
    Interface,
    TypeAlias,
    Variable,
    Property,
    Method,
    Unknown,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Interface => "interface",
            Self::TypeAlias => "typeAlias",
            Self::Variable => "variable",
            Self::Property => "property",
            Self::Method => "method",
            Self::Unknown => "unknown",
        }
    }

    /// Variant label used in the persisted node layout.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Function | Self::Method => "FunctionSymbol",
            Self::Class => "ClassSymbol",
            Self::Interface => "InterfaceSymbol",
            Self::TypeAlias => "TypeAliasSymbol",
            _ => "Symbol",
        }
    }
}

/// Kind-specific payload attached to symbols.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum SymbolDetail {
    #[serde(rename_all = "camelCase")]
    Function {
        parameters: Vec<String>,
        return_type: String,
        is_async: bool,
        is_generator: bool,
        complexity: u32,
        calls: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Class {
        extends: Vec<String>,
        implements: Vec<String>,
        methods: Vec<String>,
        properties: Vec<String>,
        is_abstract: bool,
    },
    Interface {
        extends: Vec<String>,
        methods: Vec<String>,
        properties: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    TypeAlias {
        aliased_type: String,
        is_union: bool,
        is_intersection: bool,
    },
    #[default]
    Plain,
}

/// Symbol entity payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolData {
    pub name: String,
    pub kind: SymbolKind,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docstring: Option<String>,
    pub visibility: String,
    pub is_exported: bool,
    pub is_deprecated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
    #[serde(default)]
    pub detail: SymbolDetail,
}

/// File entity payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub extension: String,
    pub size: u64,
    pub lines: usize,
    pub is_test: bool,
    pub is_config: bool,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryData {
    #[serde(default)]
    pub children: Vec<String>,
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleData {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_manifest: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestData {
    pub test_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_symbol: Option<String>,
    pub framework: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,
    pub status: String,
    #[serde(default)]
    pub flaky_score: f64,
    #[serde(default)]
    pub execution_history: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance_metrics: Option<Value>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecData {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub status: String,
    pub priority: String,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentationData {
    pub title: String,
    pub content: String,
    pub doc_type: String,
    #[serde(default)]
    pub business_domains: Vec<String>,
    #[serde(default)]
    pub stakeholders: Vec<String>,
    #[serde(default)]
    pub technologies: Vec<String>,
    pub status: String,
}

/// Variant payloads, discriminated by the persisted `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EntityData {
    File(FileData),
    Directory(DirectoryData),
    Module(ModuleData),
    Symbol(SymbolData),
    Test(TestData),
    Spec(SpecData),
    Documentation(DocumentationData),
    Change {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Session {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
    },
    BusinessDomain {
        name: String,
    },
    SemanticCluster {
        name: String,
        #[serde(default)]
        members: Vec<String>,
    },
    SecurityIssue {
        severity: String,
        description: String,
    },
    Vulnerability {
        cve: String,
        severity: String,
    },
}

impl EntityData {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::File(_) => "file",
            Self::Directory(_) => "directory",
            Self::Module(_) => "module",
            Self::Symbol(_) => "symbol",
            Self::Test(_) => "test",
            Self::Spec(_) => "spec",
            Self::Documentation(_) => "documentation",
            Self::Change { .. } => "change",
            Self::Session { .. } => "session",
            Self::BusinessDomain { .. } => "businessDomain",
            Self::SemanticCluster { .. } => "semanticCluster",
            Self::SecurityIssue { .. } => "securityIssue",
            Self::Vulnerability { .. } => "vulnerability",
        }
    }
}

/// A fully-attributed graph entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<RepoPath>,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub data: EntityData,
}

impl Entity {
    pub fn new(id: EntityId, data: EntityData) -> Self {
        let now = Utc::now();
        let mut entity = Self {
            id,
            path: None,
            hash: String::new(),
            language: None,
            created: now,
            last_modified: now,
            metadata: None,
            data,
        };
        entity.hash = entity.content_hash();
        entity
    }

    pub fn with_path(mut self, path: RepoPath) -> Self {
        self.path = Some(path);
        self.hash = self.content_hash();
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn type_name(&self) -> &'static str {
        self.data.type_name()
    }

    /// Display name, when the variant carries one.
    pub fn name(&self) -> Option<&str> {
        match &self.data {
            EntityData::Symbol(s) => Some(&s.name),
            EntityData::Module(m) => Some(&m.name),
            EntityData::Spec(s) => Some(&s.title),
            EntityData::Documentation(d) => Some(&d.title),
            EntityData::BusinessDomain { name } | EntityData::SemanticCluster { name, .. } => {
                Some(name)
            }
            EntityData::File(_) => self.path.as_ref().map(|p| {
                p.as_str().rsplit('/').next().unwrap_or(p.as_str())
            }),
            _ => None,
        }
    }

    /// Node labels for the persisted layout: the `Entity` superlabel plus
    /// the variant label (and a symbol-kind label where applicable).
    pub fn labels(&self) -> Vec<&'static str> {
        let mut labels = vec!["Entity"];
        labels.push(match &self.data {
            EntityData::File(_) => "File",
            EntityData::Directory(_) => "Directory",
            EntityData::Module(_) => "Module",
            EntityData::Symbol(_) => "Symbol",
            EntityData::Test(_) => "Test",
            EntityData::Spec(_) => "Spec",
            EntityData::Documentation(_) => "Documentation",
            EntityData::Change { .. } => "Change",
            EntityData::Session { .. } => "Session",
            EntityData::BusinessDomain { .. } => "BusinessDomain",
            EntityData::SemanticCluster { .. } => "SemanticCluster",
            EntityData::SecurityIssue { .. } => "SecurityIssue",
            EntityData::Vulnerability { .. } => "Vulnerability",
        });
        if let EntityData::Symbol(s) = &self.data {
            let kind_label = s.kind.label();
            if kind_label != "Symbol" {
                labels.push(kind_label);
            }
        }
        labels
    }

    /// Content-and-position hash used for change detection and for
    /// disambiguating `(path, kind, name)` collisions.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.type_name().as_bytes());
        if let Some(path) = &self.path {
            hasher.update(path.as_str().as_bytes());
        }
        if let Some(name) = self.name() {
            hasher.update(name.as_bytes());
        }
        match &self.data {
            EntityData::Symbol(s) => {
                hasher.update(s.signature.as_bytes());
                if let Some(loc) = &s.location {
                    hasher.update(loc.start_line.to_le_bytes());
                    hasher.update(loc.start_column.to_le_bytes());
                }
            }
            EntityData::File(f) => {
                hasher.update(f.size.to_le_bytes());
                hasher.update(f.lines.to_le_bytes());
            }
            EntityData::Documentation(d) => hasher.update(d.content.as_bytes()),
            EntityData::Spec(s) => hasher.update(s.description.as_bytes()),
            _ => {}
        }
        hex::encode(hasher.finalize())
    }

    /// Structural signature: the part of an entity whose change triggers a
    /// version bump and a `PREVIOUS_VERSION` edge.
    pub fn structural_signature(&self) -> String {
        match &self.data {
            EntityData::Symbol(s) => format!("{}:{}:{}", s.kind.as_str(), s.name, s.signature),
            _ => self.hash.clone(),
        }
    }

    /// Text digest fed to the embedding provider. Capped at
    /// [`CONTENT_DIGEST_CAP`] characters.
    pub fn content_digest(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(name) = self.name() {
            parts.push(format!("Name: {name}"));
        }
        parts.push(format!("Type: {}", self.type_name()));
        let content = match &self.data {
            EntityData::Symbol(s) => {
                let mut c = s.signature.clone();
                if let Some(doc) = &s.docstring {
                    parts.push(format!("Description: {doc}"));
                }
                if let SymbolDetail::Function { return_type, .. } = &s.detail {
                    c.push_str(&format!(" -> {return_type}"));
                }
                Some(c)
            }
            EntityData::Documentation(d) => Some(d.content.clone()),
            EntityData::Spec(s) => {
                parts.push(format!("Description: {}", s.description));
                Some(s.acceptance_criteria.join("\n"))
            }
            _ => None,
        };
        if let Some(mut content) = content {
            if content.len() > CONTENT_DIGEST_CAP {
                // Truncate on a char boundary
                let mut cut = CONTENT_DIGEST_CAP;
                while !content.is_char_boundary(cut) {
                    cut -= 1;
                }
                content.truncate(cut);
            }
            parts.push(format!("Content: {content}"));
        }
        if let Some(path) = &self.path {
            parts.push(format!("Path: {path}"));
        }
        if let Some(meta) = &self.metadata {
            if !meta.is_empty() {
                parts.push(format!(
                    "Metadata: {}",
                    serde_json::Value::Object(meta.clone())
                ));
            }
        }
        let mut digest = parts.join("\n");
        if digest.len() > CONTENT_DIGEST_CAP {
            let mut cut = CONTENT_DIGEST_CAP;
            while !digest.is_char_boundary(cut) {
                cut -= 1;
            }
            digest.truncate(cut);
        }
        digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbol_entity(name: &str, signature: &str) -> Entity {
        Entity::new(
            EntityId::new(format!("sym:src/auth.ts#{name}")).unwrap(),
            EntityData::Symbol(SymbolData {
                name: name.to_string(),
                kind: SymbolKind::Function,
                signature: signature.to_string(),
                docstring: None,
                visibility: "public".to_string(),
                is_exported: true,
                is_deprecated: false,
                location: None,
                detail: SymbolDetail::Function {
                    parameters: vec![],
                    return_type: "void".to_string(),
                    is_async: false,
                    is_generator: false,
                    complexity: 1,
                    calls: vec![],
                },
            }),
        )
        .with_path(RepoPath::new("src/auth.ts").unwrap())
    }

    #[test]
    fn symbol_labels_include_kind_variant() {
        let e = symbol_entity("login", "function login(): void");
        assert_eq!(e.labels(), vec!["Entity", "Symbol", "FunctionSymbol"]);
    }

    #[test]
    fn hash_changes_when_signature_changes() {
        let a = symbol_entity("login", "function login(): void");
        let b = symbol_entity("login", "function login(user: User): void");
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn hash_is_stable_for_identical_entities() {
        let a = symbol_entity("login", "function login(): void");
        let b = symbol_entity("login", "function login(): void");
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn content_digest_is_capped() {
        let mut e = symbol_entity("big", "x");
        if let EntityData::Symbol(s) = &mut e.data {
            s.signature = "x".repeat(20_000);
        }
        assert!(e.content_digest().len() <= CONTENT_DIGEST_CAP);
    }

    #[test]
    fn serde_round_trip_preserves_tag() {
        let e = symbol_entity("login", "function login(): void");
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "symbol");
        let back: Entity = serde_json::from_value(json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn file_entity_name_is_basename() {
        let e = Entity::new(
            EntityId::new("file:src/auth.ts").unwrap(),
            EntityData::File(FileData {
                extension: "ts".into(),
                size: 120,
                lines: 12,
                is_test: false,
                is_config: false,
                dependencies: vec![],
            }),
        )
        .with_path(RepoPath::new("src/auth.ts").unwrap());
        assert_eq!(e.name(), Some("auth.ts"));
    }
}
