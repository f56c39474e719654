//! Relationship extraction: from parsed references to normalized edges
//!
//! Takes one file's parse output and produces the entities and code edges
//! the commit phase writes. Each reference runs a resolution chain: local
//! file scope, then the import map, then a budgeted type oracle, then the
//! global name index; common ambient identifiers are suppressed outright.
//! Unresolvable targets leave as structured `ToRef`s for the reconciler.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use crate::entity::{Entity, EntityData, FileData, SymbolData, SymbolDetail, SymbolKind};
use crate::parsing::{ParsedCode, ParsedReference, ParsedSymbol, ReferenceKind};
use crate::relationship::{
    Evidence, RelationType, Relationship, ResolutionSource, ToRef,
};
use crate::symbol_index::{resolve_module, ModuleTarget, SymbolRecord, SymbolSnapshot};
use crate::types::{EntityId, RepoPath};

/// Ambient identifiers that never become edges.
static STOP_LIST: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "console", "Math", "Promise", "JSON", "Object", "Array", "String", "Number",
        "Boolean", "Date", "Error", "Map", "Set", "Symbol", "RegExp", "window",
        "document", "process", "require", "setTimeout", "setInterval", "fetch",
        "print", "len", "range", "super", "self", "this", "isinstance", "dict",
        "list", "tuple", "str", "int", "float", "bool", "Ok", "Err", "Some", "None",
        "println", "vec", "format", "panic", "assert", "assert_eq", "Box", "Vec",
        "Option", "Result", "Arc", "Rc",
    ]
    .into_iter()
    .collect()
});

static RETURN_TYPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\)\s*:\s*([A-Za-z_][A-Za-z0-9_]*)").expect("static regex"));
static TEST_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\.test\.|\.spec\.|_test\.|(^|/)test_|(^|/)tests?/)").expect("static regex")
});
static CONFIG_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(package\.json|tsconfig|\.config\.|Cargo\.toml|pyproject\.toml|\.ya?ml$)")
        .expect("static regex")
});

/// Resolves a name to a canonical symbol using type information.
///
/// The tree-sitter stack has no type checker; the default oracle answers
/// from unique exported names in the global index. Deployments with a real
/// checker plug their own implementation in.
pub trait TypeOracle: Send + Sync {
    fn resolve(&self, name: &str, from_file: &str, snapshot: &SymbolSnapshot)
        -> Option<SymbolRecord>;
}

/// Default oracle: unique exported name wins.
pub struct IndexBackedOracle;

impl TypeOracle for IndexBackedOracle {
    fn resolve(
        &self,
        name: &str,
        _from_file: &str,
        snapshot: &SymbolSnapshot,
    ) -> Option<SymbolRecord> {
        snapshot.resolve_unique_export(name).cloned()
    }
}

/// Global consultation budget shared by one sync operation.
pub struct OracleBudget {
    remaining: AtomicUsize,
}

impl OracleBudget {
    pub fn new(budget: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(budget),
        }
    }

    /// Take one consultation slot if any remain.
    pub fn try_consume(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_sub(1)
            })
            .is_ok()
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }
}

impl Default for OracleBudget {
    fn default() -> Self {
        Self::new(200)
    }
}

/// Everything the commit phase needs for one file.
#[derive(Debug, Default)]
pub struct BuildOutput {
    pub file_entity: Option<Entity>,
    pub symbol_entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
    pub symbol_records: Vec<SymbolRecord>,
}

/// Builds entities and relationships from parse output.
pub struct RelationshipBuilder<'a> {
    oracle: &'a dyn TypeOracle,
    budget: &'a OracleBudget,
}

impl<'a> RelationshipBuilder<'a> {
    pub fn new(oracle: &'a dyn TypeOracle, budget: &'a OracleBudget) -> Self {
        Self { oracle, budget }
    }

    /// Build the full output for one parsed file.
    pub fn build(
        &self,
        path: &RepoPath,
        content: &str,
        parsed: &ParsedCode,
        snapshot: &SymbolSnapshot,
    ) -> Result<BuildOutput> {
        let mut output = BuildOutput::default();
        let file_id = EntityId::new(format!("file:{path}"))?;
        let is_test = TEST_PATH_RE.is_match(path.as_str());

        let file_entity = build_file_entity(&file_id, path, content, parsed, is_test)?;
        output.file_entity = Some(file_entity);

        // Symbol ids: path#name, disambiguated on in-file collisions
        let mut name_counts: HashMap<&str, usize> = HashMap::new();
        for symbol in &parsed.symbols {
            *name_counts.entry(symbol.name.as_str()).or_default() += 1;
        }
        let mut symbol_ids: HashMap<String, EntityId> = HashMap::new();
        for symbol in &parsed.symbols {
            let id = symbol_entity_id(path, symbol, name_counts[symbol.name.as_str()] > 1)?;
            symbol_ids.insert(symbol.name.clone(), id.clone());
            let entity = build_symbol_entity(&id, path, parsed, symbol)?;
            output.symbol_records.push(SymbolRecord {
                entity_id: id.clone(),
                name: symbol.name.clone(),
                kind: symbol.kind,
                file_path: path.as_str().to_string(),
                is_exported: symbol.is_exported,
                signature: symbol.signature.clone(),
            });
            output.symbol_entities.push(entity);

            // Structural containment
            let mut contains =
                Relationship::new(file_id.clone(), id.clone(), RelationType::Contains);
            contains.confidence = Some(1.0);
            output.relationships.push(contains);
            if symbol.is_exported {
                let mut exports =
                    Relationship::new(file_id.clone(), id.clone(), RelationType::Exports);
                exports.confidence = Some(1.0);
                output.relationships.push(exports);
            }
        }

        // Import edges
        for import in &parsed.imports {
            let evidence = Evidence::site(path.as_str(), import.line, 0);
            match resolve_module(path.as_str(), &import.module, snapshot) {
                ModuleTarget::File(target_path) => {
                    let target = EntityId::new(format!("file:{target_path}"))?;
                    let rel =
                        Relationship::new(file_id.clone(), target, RelationType::Imports)
                            .with_evidence(evidence);
                    output.relationships.push(rel);
                }
                ModuleTarget::External(package) | ModuleTarget::Unresolved(package) => {
                    let rel = Relationship::new(
                        file_id.clone(),
                        file_id.clone(),
                        RelationType::Imports,
                    )
                    .with_to_ref(ToRef::External {
                        name: package.clone(),
                    })
                    .with_evidence(evidence);
                    output.relationships.push(rel);
                }
            }
        }

        // Code edges from reference sites
        let local_names: HashSet<&str> =
            parsed.symbols.iter().map(|s| s.name.as_str()).collect();
        let import_map = build_import_map(parsed);
        for reference in &parsed.references {
            if STOP_LIST.contains(reference.name.as_str()) {
                continue;
            }
            // Member calls on ambient receivers (`console.log`) are noise
            if reference
                .receiver
                .as_deref()
                .map(|r| STOP_LIST.contains(r))
                .unwrap_or(false)
            {
                continue;
            }
            // A symbol is not an edge to itself
            if reference.enclosing_symbol.as_deref() == Some(reference.name.as_str()) {
                continue;
            }
            let from = reference
                .enclosing_symbol
                .as_ref()
                .and_then(|name| symbol_ids.get(name))
                .unwrap_or(&file_id)
                .clone();
            let rel = self.resolve_reference(
                path,
                &from,
                reference,
                &local_names,
                &symbol_ids,
                &import_map,
                snapshot,
            )?;
            output.relationships.push(rel);

            // Test files additionally assert coverage edges
            if is_test
                && reference.kind == ReferenceKind::Call
                && !local_names.contains(reference.name.as_str())
            {
                if let Some(target) = snapshot.resolve_unique_export(&reference.name) {
                    let mut tests = Relationship::new(
                        from.clone(),
                        target.entity_id.clone(),
                        RelationType::Tests,
                    )
                    .with_evidence(Evidence::site(
                        path.as_str(),
                        reference.line,
                        reference.column,
                    ));
                    tests.confidence = Some(0.7);
                    output.relationships.push(tests);
                }
            }
        }

        // Return-type edges from function signatures
        for symbol in &parsed.symbols {
            if !matches!(symbol.kind, SymbolKind::Function | SymbolKind::Method) {
                continue;
            }
            let Some(type_name) = RETURN_TYPE_RE
                .captures(&symbol.signature)
                .and_then(|captures| captures.get(1))
                .map(|m| m.as_str().to_string())
            else {
                continue;
            };
            if STOP_LIST.contains(type_name.as_str()) || type_name == "void" {
                continue;
            }
            let Some(from) = symbol_ids.get(&symbol.name) else {
                continue;
            };
            let reference = ParsedReference {
                name: type_name,
                kind: ReferenceKind::TypeUse,
                line: symbol.location.start_line,
                column: symbol.location.start_column,
                enclosing_symbol: Some(symbol.name.clone()),
                snippet: symbol.signature.clone(),
                receiver: None,
                param_index: None,
            };
            let mut rel = self.resolve_reference(
                path,
                from,
                &reference,
                &local_names,
                &symbol_ids,
                &import_map,
                snapshot,
            )?;
            rel.rel_type = RelationType::ReturnsType;
            rel.id = rel.canonical_id();
            output.relationships.push(rel);
        }

        merge_in_file_duplicates(&mut output.relationships);
        for rel in output.relationships.iter_mut() {
            rel.normalize()?;
        }
        debug!(
            path = %path,
            symbols = output.symbol_entities.len(),
            relationships = output.relationships.len(),
            "relationship extraction finished"
        );
        Ok(output)
    }

    /// Run the resolution chain for one reference site.
    #[allow(clippy::too_many_arguments)]
    fn resolve_reference(
        &self,
        path: &RepoPath,
        from: &EntityId,
        reference: &ParsedReference,
        local_names: &HashSet<&str>,
        symbol_ids: &HashMap<String, EntityId>,
        import_map: &HashMap<String, String>,
        snapshot: &SymbolSnapshot,
    ) -> Result<Relationship> {
        let rel_type = edge_type_for(reference);
        let evidence = Evidence::site(path.as_str(), reference.line, reference.column)
            .with_snippet(reference.snippet.clone());

        // 1. Local file scope
        if local_names.contains(reference.name.as_str()) {
            if let Some(target) = symbol_ids.get(&reference.name) {
                let mut rel = Relationship::new(from.clone(), target.clone(), rel_type)
                    .with_evidence(evidence)
                    .with_source(ResolutionSource::Ast)
                    .with_confidence(0.9);
                apply_param_index(&mut rel, reference);
                return Ok(rel);
            }
        }

        // 2. Import map
        if let Some(module) = import_map.get(&reference.name) {
            match resolve_module(path.as_str(), module, snapshot) {
                ModuleTarget::File(target_path) => {
                    let rel = match snapshot.lookup(&target_path, &reference.name) {
                        Some(record) => Relationship::new(
                            from.clone(),
                            record.entity_id.clone(),
                            rel_type,
                        ),
                        None => Relationship::new(from.clone(), from.clone(), rel_type)
                            .with_to_ref(ToRef::FileSymbol {
                                file_path: target_path,
                                name: reference.name.clone(),
                            }),
                    };
                    let mut rel = rel
                        .with_evidence(evidence)
                        .with_source(ResolutionSource::Ast)
                        .with_confidence(0.8);
                    apply_param_index(&mut rel, reference);
                    return Ok(rel);
                }
                ModuleTarget::External(package) | ModuleTarget::Unresolved(package) => {
                    let mut rel = Relationship::new(from.clone(), from.clone(), rel_type)
                        .with_to_ref(ToRef::External {
                            name: format!("{package}:{}", reference.name),
                        })
                        .with_evidence(evidence)
                        .with_source(ResolutionSource::Ast)
                        .with_confidence(0.6);
                    apply_param_index(&mut rel, reference);
                    return Ok(rel);
                }
            }
        }

        // 3. Budgeted type oracle
        if should_use_type_oracle(reference) && self.budget.try_consume() {
            if let Some(record) = self.oracle.resolve(&reference.name, path.as_str(), snapshot)
            {
                let mut rel =
                    Relationship::new(from.clone(), record.entity_id.clone(), rel_type)
                        .with_evidence(evidence)
                        .with_source(ResolutionSource::TypeChecker)
                        .with_confidence(0.95);
                apply_param_index(&mut rel, reference);
                return Ok(rel);
            }
        }

        // 4. Global name index, best effort
        let candidates = snapshot.lookup_by_name(&reference.name);
        let typed: Vec<&SymbolRecord> = candidates
            .iter()
            .filter(|r| {
                matches!(
                    r.kind,
                    SymbolKind::Class
                        | SymbolKind::Interface
                        | SymbolKind::Function
                        | SymbolKind::TypeAlias
                )
            })
            .collect();
        if typed.len() == 1 {
            let mut rel = Relationship::new(from.clone(), typed[0].entity_id.clone(), rel_type)
                .with_evidence(evidence)
                .with_source(ResolutionSource::Heuristic)
                .with_confidence(0.5);
            apply_param_index(&mut rel, reference);
            return Ok(rel);
        }

        // Deferred: leave a symbolic target for the reconciler
        let mut rel = Relationship::new(from.clone(), from.clone(), rel_type)
            .with_to_ref(ToRef::Sym {
                file_path: path.as_str().to_string(),
                name: reference.name.clone(),
                disambiguator: "deferred".to_string(),
            })
            .with_evidence(evidence)
            .with_source(ResolutionSource::Ast)
            .with_confidence(0.3);
        apply_param_index(&mut rel, reference);
        Ok(rel)
    }
}

/// Consult the oracle for call and type references only.
fn should_use_type_oracle(reference: &ParsedReference) -> bool {
    matches!(
        reference.kind,
        ReferenceKind::Call
            | ReferenceKind::TypeUse
            | ReferenceKind::Extends
            | ReferenceKind::Implements
    )
}

fn edge_type_for(reference: &ParsedReference) -> RelationType {
    match reference.kind {
        ReferenceKind::Call => RelationType::Calls,
        ReferenceKind::TypeUse => {
            if reference.param_index.is_some() {
                RelationType::ParamType
            } else {
                RelationType::TypeUses
            }
        }
        ReferenceKind::Extends => RelationType::Extends,
        ReferenceKind::Implements => RelationType::Implements,
        ReferenceKind::Decorator | ReferenceKind::Identifier => RelationType::References,
    }
}

fn apply_param_index(rel: &mut Relationship, reference: &ParsedReference) {
    if let Some(index) = reference.param_index {
        let meta = rel.metadata.get_or_insert_with(Map::new);
        meta.insert("paramIndex".to_string(), Value::from(index));
    }
    if reference.kind == ReferenceKind::Decorator {
        rel.kind = Some("decorator".to_string());
    }
    rel.id = rel.canonical_id();
}

fn build_import_map(parsed: &ParsedCode) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for import in &parsed.imports {
        for (name, alias) in &import.items {
            let bound = alias.clone().unwrap_or_else(|| name.clone());
            map.insert(bound, import.module.clone());
        }
    }
    map
}

fn symbol_entity_id(
    path: &RepoPath,
    symbol: &ParsedSymbol,
    ambiguous: bool,
) -> Result<EntityId> {
    if ambiguous {
        // Disambiguate by kind and position
        let tag = format!(
            "{:x}",
            symbol.location.start_line * 1000 + symbol.location.start_column
        );
        EntityId::new(format!(
            "sym:{path}#{}@{}{tag}",
            symbol.name,
            symbol.kind.as_str()
        ))
    } else {
        EntityId::new(format!("sym:{path}#{}", symbol.name))
    }
}

fn build_file_entity(
    file_id: &EntityId,
    path: &RepoPath,
    content: &str,
    parsed: &ParsedCode,
    is_test: bool,
) -> Result<Entity> {
    let dependencies: Vec<String> = parsed
        .imports
        .iter()
        .map(|i| i.module.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    let entity = Entity::new(
        file_id.clone(),
        EntityData::File(FileData {
            extension: path.extension().unwrap_or("").to_string(),
            size: content.len() as u64,
            lines: content.lines().count(),
            is_test,
            is_config: CONFIG_PATH_RE.is_match(path.as_str()),
            dependencies,
        }),
    )
    .with_path(path.clone())
    .with_language(parsed.language.name());
    Ok(entity)
}

fn build_symbol_entity(
    id: &EntityId,
    path: &RepoPath,
    parsed: &ParsedCode,
    symbol: &ParsedSymbol,
) -> Result<Entity> {
    let detail = match symbol.kind {
        SymbolKind::Function | SymbolKind::Method => SymbolDetail::Function {
            parameters: parameters_from_signature(&symbol.signature),
            return_type: RETURN_TYPE_RE
                .captures(&symbol.signature)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| "void".to_string()),
            is_async: symbol.is_async,
            is_generator: symbol.signature.contains("function*"),
            complexity: symbol.complexity,
            calls: parsed
                .references
                .iter()
                .filter(|r| {
                    r.kind == ReferenceKind::Call
                        && r.enclosing_symbol.as_deref() == Some(symbol.name.as_str())
                })
                .map(|r| r.name.clone())
                .collect(),
        },
        SymbolKind::Class => SymbolDetail::Class {
            extends: heritage_names(parsed, symbol, ReferenceKind::Extends),
            implements: heritage_names(parsed, symbol, ReferenceKind::Implements),
            methods: member_names(parsed, symbol, SymbolKind::Method),
            properties: member_names(parsed, symbol, SymbolKind::Property),
            is_abstract: symbol.signature.contains("abstract "),
        },
        SymbolKind::Interface => SymbolDetail::Interface {
            extends: heritage_names(parsed, symbol, ReferenceKind::Extends),
            methods: member_names(parsed, symbol, SymbolKind::Method),
            properties: member_names(parsed, symbol, SymbolKind::Property),
        },
        SymbolKind::TypeAlias => SymbolDetail::TypeAlias {
            aliased_type: symbol
                .signature
                .split_once('=')
                .map(|(_, rhs)| rhs.trim().trim_end_matches(';').to_string())
                .unwrap_or_default(),
            is_union: symbol.signature.contains('|'),
            is_intersection: symbol.signature.contains('&'),
        },
        _ => SymbolDetail::Plain,
    };
    let entity = Entity::new(
        id.clone(),
        EntityData::Symbol(SymbolData {
            name: symbol.name.clone(),
            kind: symbol.kind,
            signature: symbol.signature.clone(),
            docstring: symbol.docstring.clone(),
            visibility: symbol.visibility.clone(),
            is_exported: symbol.is_exported,
            is_deprecated: symbol
                .docstring
                .as_deref()
                .map(|d| d.contains("@deprecated"))
                .unwrap_or(false),
            location: Some(symbol.location),
            detail,
        }),
    )
    .with_path(path.clone())
    .with_language(parsed.language.name());
    Ok(entity)
}

fn parameters_from_signature(signature: &str) -> Vec<String> {
    let Some(open) = signature.find('(') else {
        return Vec::new();
    };
    let Some(close) = signature.rfind(')') else {
        return Vec::new();
    };
    if close <= open + 1 {
        return Vec::new();
    }
    signature[open + 1..close]
        .split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

fn heritage_names(
    parsed: &ParsedCode,
    symbol: &ParsedSymbol,
    kind: ReferenceKind,
) -> Vec<String> {
    parsed
        .references
        .iter()
        .filter(|r| {
            r.kind == kind && r.enclosing_symbol.as_deref() == Some(symbol.name.as_str())
        })
        .map(|r| r.name.clone())
        .collect()
}

fn member_names(parsed: &ParsedCode, class: &ParsedSymbol, kind: SymbolKind) -> Vec<String> {
    parsed
        .symbols
        .iter()
        .filter(|s| {
            s.kind == kind
                && s.location.start_line >= class.location.start_line
                && s.location.end_line <= class.location.end_line
        })
        .map(|s| s.name.clone())
        .collect()
}

/// Merge duplicate edges emitted within one file before they leave the
/// builder: evidence unions, occurrence counts accumulate.
fn merge_in_file_duplicates(relationships: &mut Vec<Relationship>) {
    let mut merged: Vec<Relationship> = Vec::with_capacity(relationships.len());
    let mut index_by_id: HashMap<String, usize> = HashMap::new();
    for rel in relationships.drain(..) {
        match index_by_id.get(&rel.id) {
            Some(&i) => merged[i].merge_observation(&rel),
            None => {
                index_by_id.insert(rel.id.clone(), merged.len());
                merged.push(rel);
            }
        }
    }
    *relationships = merged;
}
