//! Relationship model: typed edges with canonical identity
//!
//! Every edge the extractor emits is normalized here before it touches the
//! store. Canonical identity is a pure function of `(from, type, target
//! key)`, which makes re-ingestion deterministic: two observations of the
//! same edge merge instead of duplicating.

use anyhow::{ensure, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::types::{ChangeSetId, EntityId};

/// Evidence and location lists are bounded; older entries are evicted on
/// merge, most recent first.
pub const MAX_EVIDENCE: usize = 20;

/// Relationship types understood by the graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationType {
    // Structural
    Contains,
    Defines,
    Exports,
    Imports,
    // Code
    Calls,
    References,
    Implements,
    Extends,
    DependsOn,
    // Type usage
    TypeUses,
    ReturnsType,
    ParamType,
    // Test
    Tests,
    Validates,
    // Spec
    Requires,
    Impacts,
    ImplementsSpec,
    // Documentation
    DocumentedBy,
    DocumentsSection,
    // Temporal
    PreviousVersion,
    ModifiedBy,
    // Checkpoint membership
    Includes,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contains => "CONTAINS",
            Self::Defines => "DEFINES",
            Self::Exports => "EXPORTS",
            Self::Imports => "IMPORTS",
            Self::Calls => "CALLS",
            Self::References => "REFERENCES",
            Self::Implements => "IMPLEMENTS",
            Self::Extends => "EXTENDS",
            Self::DependsOn => "DEPENDS_ON",
            Self::TypeUses => "TYPE_USES",
            Self::ReturnsType => "RETURNS_TYPE",
            Self::ParamType => "PARAM_TYPE",
            Self::Tests => "TESTS",
            Self::Validates => "VALIDATES",
            Self::Requires => "REQUIRES",
            Self::Impacts => "IMPACTS",
            Self::ImplementsSpec => "IMPLEMENTS_SPEC",
            Self::DocumentedBy => "DOCUMENTED_BY",
            Self::DocumentsSection => "DOCUMENTS_SECTION",
            Self::PreviousVersion => "PREVIOUS_VERSION",
            Self::ModifiedBy => "MODIFIED_BY",
            Self::Includes => "INCLUDES",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "CONTAINS" => Self::Contains,
            "DEFINES" => Self::Defines,
            "EXPORTS" => Self::Exports,
            "IMPORTS" => Self::Imports,
            "CALLS" => Self::Calls,
            "REFERENCES" => Self::References,
            "IMPLEMENTS" => Self::Implements,
            "EXTENDS" => Self::Extends,
            "DEPENDS_ON" => Self::DependsOn,
            "TYPE_USES" => Self::TypeUses,
            "RETURNS_TYPE" => Self::ReturnsType,
            "PARAM_TYPE" => Self::ParamType,
            "TESTS" => Self::Tests,
            "VALIDATES" => Self::Validates,
            "REQUIRES" => Self::Requires,
            "IMPACTS" => Self::Impacts,
            "IMPLEMENTS_SPEC" => Self::ImplementsSpec,
            "DOCUMENTED_BY" => Self::DocumentedBy,
            "DOCUMENTS_SECTION" => Self::DocumentsSection,
            "PREVIOUS_VERSION" => Self::PreviousVersion,
            "MODIFIED_BY" => Self::ModifiedBy,
            "INCLUDES" => Self::Includes,
            other => {
                return Err(crate::errors::KgError::validation(
                    "relationship.type",
                    format!("unknown relationship type: {other}"),
                )
                .into())
            }
        })
    }

    /// Code edges carry resolution provenance and evidence.
    pub fn is_code_edge(&self) -> bool {
        matches!(
            self,
            Self::Calls
                | Self::References
                | Self::Implements
                | Self::Extends
                | Self::DependsOn
                | Self::TypeUses
                | Self::ReturnsType
                | Self::ParamType
        )
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who resolved a code edge. Type-checker resolutions must not be
/// downgraded by later AST-only observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionSource {
    Heuristic,
    Ast,
    TypeChecker,
}

impl ResolutionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Heuristic => "heuristic",
            Self::Ast => "ast",
            Self::TypeChecker => "type-checker",
        }
    }
}

/// One observation site supporting a relationship's existence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    pub kind: String,
    pub file_path: String,
    pub line: usize,
    pub column: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

impl Evidence {
    pub fn site(file_path: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            kind: "site".to_string(),
            file_path: file_path.into(),
            line,
            column,
            snippet: None,
        }
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = Some(snippet.into());
        self
    }

    /// Location mirror of this evidence entry, without the snippet.
    pub fn location(&self) -> EdgeLocation {
        EdgeLocation {
            file_path: self.file_path.clone(),
            line: self.line,
            column: self.column,
        }
    }
}

/// Site of a relationship occurrence (evidence without the snippet).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeLocation {
    pub file_path: String,
    pub line: usize,
    pub column: usize,
}

/// Structured target descriptor for an edge whose concrete endpoint is not
/// yet known. Reconciled to an entity id by the coordinator's background
/// pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ToRef {
    /// Resolved to a concrete entity.
    Entity { id: EntityId },
    /// Resolved to a file-scoped symbol.
    #[serde(rename_all = "camelCase")]
    FileSymbol { file_path: String, name: String },
    /// Resolved to a package or ambient symbol.
    External { name: String },
    /// Deferred: best-effort symbolic target.
    #[serde(rename_all = "camelCase")]
    Sym {
        file_path: String,
        name: String,
        disambiguator: String,
    },
}

impl ToRef {
    /// Stable target key folded into the canonical relationship id.
    pub fn target_key(&self) -> String {
        match self {
            Self::Entity { id } => id.as_str().to_string(),
            Self::FileSymbol { file_path, name } => format!("file:{file_path}:{name}"),
            Self::External { name } => format!("external:{name}"),
            Self::Sym {
                file_path,
                name,
                disambiguator,
            } => format!("sym:{file_path}#{name}@{disambiguator}"),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Entity { .. })
    }
}

/// A richly-attributed edge between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub id: String,
    pub from_entity_id: EntityId,
    pub to_entity_id: EntityId,
    #[serde(rename = "type")]
    pub rel_type: RelationType,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub version: u32,
    pub active: bool,
    pub valid_from: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_set_id: Option<ChangeSetId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub source: ResolutionSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    #[serde(default)]
    pub locations: Vec<EdgeLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurrences_total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_ref: Option<ToRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl Relationship {
    /// Build an edge with normalization defaults applied.
    pub fn new(
        from: EntityId,
        to: EntityId,
        rel_type: RelationType,
    ) -> Self {
        let now = Utc::now();
        let mut rel = Self {
            id: String::new(),
            from_entity_id: from,
            to_entity_id: to,
            rel_type,
            created: now,
            last_modified: now,
            version: 1,
            active: true,
            valid_from: now,
            valid_to: None,
            change_set_id: None,
            confidence: None,
            source: ResolutionSource::Ast,
            kind: None,
            evidence: Vec::new(),
            locations: Vec::new(),
            occurrences_total: Some(1),
            last_seen_at: Some(now),
            to_ref: None,
            metadata: None,
        };
        rel.id = rel.canonical_id();
        rel
    }

    pub fn with_to_ref(mut self, to_ref: ToRef) -> Self {
        self.to_ref = Some(to_ref);
        self.id = self.canonical_id();
        self
    }

    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.locations.push(evidence.location());
        self.evidence.push(evidence);
        self
    }

    pub fn with_source(mut self, source: ResolutionSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    /// Target key for canonical identity: the resolved target if present,
    /// otherwise the structured `to_ref` key.
    pub fn target_key(&self) -> String {
        match &self.to_ref {
            Some(to_ref) if !to_ref.is_resolved() => to_ref.target_key(),
            _ => self.to_entity_id.as_str().to_string(),
        }
    }

    /// Canonical id: pure function of `(from, type, target key)`.
    pub fn canonical_id(&self) -> String {
        canonical_relationship_id(&self.from_entity_id, &self.rel_type, &self.target_key())
    }

    /// Normalize an edge before it is written.
    ///
    /// - evidence/locations trimmed to the bound, most recent first
    /// - `id` recomputed from canonical identity
    /// - type-specific coercions applied
    pub fn normalize(&mut self) -> Result<()> {
        trim_most_recent_first(&mut self.evidence);
        let mut locs = std::mem::take(&mut self.locations);
        if locs.is_empty() {
            locs = self.evidence.iter().map(Evidence::location).collect();
        }
        trim_most_recent_first(&mut locs);
        self.locations = locs;

        if let Some(c) = self.confidence {
            ensure!(
                (0.0..=1.0).contains(&c),
                "confidence must be within [0, 1], got {c}"
            );
        }

        match self.rel_type {
            RelationType::Calls => {
                ensure!(
                    self.to_ref.is_some() || !self.to_entity_id.as_str().is_empty(),
                    "CALLS edge requires a callee key"
                );
            }
            RelationType::ParamType => {
                let has_index = self
                    .metadata
                    .as_ref()
                    .map(|m| m.contains_key("paramIndex"))
                    .unwrap_or(false);
                ensure!(has_index, "PARAM_TYPE edge requires a paramIndex");
            }
            _ => {}
        }

        if self.occurrences_total.is_none() {
            self.occurrences_total = Some(1);
        }
        self.active = self.valid_to.is_none();
        self.id = self.canonical_id();
        Ok(())
    }

    /// Merge another observation of the same canonical edge into this one.
    ///
    /// Evidence and locations become set unions (bounded), occurrence counts
    /// sum, confidence takes the max, and a type-checker resolution is never
    /// downgraded.
    pub fn merge_observation(&mut self, other: &Relationship) {
        debug_assert_eq!(self.canonical_id(), other.canonical_id());

        for ev in &other.evidence {
            if !self.evidence.contains(ev) {
                self.evidence.push(ev.clone());
            }
        }
        trim_most_recent_first(&mut self.evidence);

        for loc in &other.locations {
            if !self.locations.contains(loc) {
                self.locations.push(loc.clone());
            }
        }
        trim_most_recent_first(&mut self.locations);

        let self_occ = self.occurrences_total.unwrap_or(1);
        let other_occ = other.occurrences_total.unwrap_or(1);
        self.occurrences_total = Some(self_occ + other_occ);

        self.confidence = match (self.confidence, other.confidence) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        // I5: type-checker provenance is sticky
        if other.source > self.source {
            self.source = other.source;
        }

        if let Some(other_meta) = &other.metadata {
            let meta = self.metadata.get_or_insert_with(Map::new);
            for (k, v) in other_meta {
                meta.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }

        // An incoming resolved target upgrades a symbolic one
        if let (Some(theirs), Some(ours)) = (&other.to_ref, &self.to_ref) {
            if theirs.is_resolved() && !ours.is_resolved() {
                self.to_entity_id = other.to_entity_id.clone();
            }
        }

        let now = Utc::now();
        self.last_seen_at = Some(now);
        self.last_modified = now;
        self.version += 1;
    }
}

/// Canonical relationship identity:
/// `H(fromEntityId || type || targetKey)`, hex-encoded with a `rel_` prefix.
pub fn canonical_relationship_id(
    from: &EntityId,
    rel_type: &RelationType,
    target_key: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(from.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(rel_type.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(target_key.as_bytes());
    let digest = hasher.finalize();
    format!("rel_{}", hex::encode(&digest[..20]))
}

/// Keep the most recent `MAX_EVIDENCE` items. Entries arrive oldest-first,
/// so eviction drops from the front.
fn trim_most_recent_first<T>(items: &mut Vec<T>) {
    if items.len() > MAX_EVIDENCE {
        let excess = items.len() - MAX_EVIDENCE;
        items.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eid(s: &str) -> EntityId {
        EntityId::new(s).unwrap()
    }

    fn call_edge() -> Relationship {
        Relationship::new(eid("sym:a.ts#foo"), eid("sym:b.ts#bar"), RelationType::Calls)
            .with_evidence(Evidence::site("a.ts", 3, 4).with_snippet("bar();"))
    }

    #[test]
    fn canonical_id_is_pure_and_stable() {
        let a = call_edge();
        let b = call_edge();
        assert_eq!(a.canonical_id(), b.canonical_id());
        assert_eq!(a.id, a.canonical_id());
    }

    #[test]
    fn canonical_id_uses_symbolic_target_key_when_unresolved() {
        let resolved = call_edge();
        let deferred = Relationship::new(
            eid("sym:a.ts#foo"),
            eid("sym:a.ts#foo"), // placeholder endpoint
            RelationType::Calls,
        )
        .with_to_ref(ToRef::External {
            name: "lodash".to_string(),
        });
        assert_ne!(resolved.canonical_id(), deferred.canonical_id());
        assert!(deferred.target_key().starts_with("external:"));
    }

    #[test]
    fn merge_unions_evidence_and_sums_occurrences() {
        let mut a = call_edge();
        let b = call_edge().with_evidence(Evidence::site("a.ts", 9, 2));
        a.merge_observation(&b);
        assert_eq!(a.evidence.len(), 2);
        assert_eq!(a.occurrences_total, Some(2));
    }

    #[test]
    fn merge_never_downgrades_type_checker_source() {
        let mut a = call_edge().with_source(ResolutionSource::TypeChecker);
        let b = call_edge().with_source(ResolutionSource::Ast);
        a.merge_observation(&b);
        assert_eq!(a.source, ResolutionSource::TypeChecker);

        let mut c = call_edge().with_source(ResolutionSource::Ast);
        let d = call_edge().with_source(ResolutionSource::TypeChecker);
        c.merge_observation(&d);
        assert_eq!(c.source, ResolutionSource::TypeChecker);
    }

    #[test]
    fn evidence_is_bounded_after_any_merge() {
        let mut a = call_edge();
        for i in 0..50 {
            let b = call_edge().with_evidence(Evidence::site("a.ts", i, 0));
            a.merge_observation(&b);
        }
        assert!(a.evidence.len() <= MAX_EVIDENCE);
        assert!(a.locations.len() <= MAX_EVIDENCE);
        // Most recent sites survive
        assert!(a.evidence.iter().any(|e| e.line == 49));
    }

    #[test]
    fn normalize_requires_param_index_for_param_type() {
        let mut rel = Relationship::new(
            eid("sym:a.ts#foo"),
            eid("sym:a.ts#User"),
            RelationType::ParamType,
        );
        assert!(rel.normalize().is_err());

        let mut meta = Map::new();
        meta.insert("paramIndex".to_string(), Value::from(0));
        rel.metadata = Some(meta);
        assert!(rel.normalize().is_ok());
    }

    #[test]
    fn normalize_backfills_locations_from_evidence() {
        let mut rel = call_edge();
        rel.locations.clear();
        rel.normalize().unwrap();
        assert_eq!(rel.locations.len(), 1);
        assert_eq!(rel.locations[0].line, 3);
        assert!(rel.locations[0].file_path == "a.ts");
    }

    #[test]
    fn relation_type_round_trips_through_strings() {
        for t in [
            RelationType::Contains,
            RelationType::Calls,
            RelationType::ParamType,
            RelationType::PreviousVersion,
            RelationType::Includes,
        ] {
            assert_eq!(RelationType::parse(t.as_str()).unwrap(), t);
        }
        assert!(RelationType::parse("NOT_A_TYPE").is_err());
    }
}
