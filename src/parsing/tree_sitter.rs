//! Tree-sitter implementation for multi-language code parsing

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tree_sitter::{Language, Node, Parser, Tree};

use crate::entity::{SourceLocation, SymbolKind};

// Node type constants for better maintainability and to avoid typos
const FUNCTION_NODES: &[&str] = &[
    // TypeScript / JavaScript
    "function_declaration",
    "generator_function_declaration",
    "arrow_function",
    // Python
    "function_definition",
    // Rust
    "function_item",
];
const METHOD_NODES: &[&str] = &["method_definition"];
const CLASS_NODES: &[&str] = &[
    // TypeScript / JavaScript
    "class_declaration",
    // Python
    "class_definition",
    // Rust structs map onto the class bucket
    "struct_item",
];
const INTERFACE_NODES: &[&str] = &["interface_declaration", "trait_item"];
const TYPE_ALIAS_NODES: &[&str] = &["type_alias_declaration", "type_item"];
const VARIABLE_NODES: &[&str] = &["variable_declarator", "let_declaration", "assignment"];
const PROPERTY_NODES: &[&str] = &["public_field_definition", "property_signature"];
const IMPORT_NODES: &[&str] = &[
    "import_statement",
    "import_from_statement",
    "use_declaration",
];
const CALL_NODES: &[&str] = &["call_expression", "call", "new_expression", "macro_invocation"];
const TYPE_REF_NODES: &[&str] = &["type_annotation", "type_arguments"];
const DECORATOR_NODE: &str = "decorator";
const DECORATED_DEFINITION: &str = "decorated_definition";
const EXPORT_STATEMENT: &str = "export_statement";
const EXTENDS_CLAUSE: &str = "class_heritage";
const EXTENDS_CLAUSE_TS: &str = "extends_clause";
const IMPLEMENTS_CLAUSE: &str = "implements_clause";
const IDENTIFIER_NODES: &[&str] = &[
    "identifier",
    "type_identifier",
    "property_identifier",
    "name",
];
// Branching nodes counted toward cyclomatic complexity
const BRANCH_NODES: &[&str] = &[
    "if_statement",
    "for_statement",
    "for_in_statement",
    "while_statement",
    "switch_case",
    "case_clause",
    "catch_clause",
    "conditional_expression",
    "match_arm",
    "elif_clause",
    "except_clause",
];
// Containers whose function children are methods
const METHOD_CONTAINER_NODES: &[&str] = &[
    "class_declaration",
    "class_body",
    "class_definition",
    "impl_item",
    "trait_item",
    "interface_declaration",
];

/// Supported programming languages for parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupportedLanguage {
    TypeScript,
    JavaScript,
    Python,
    Rust,
}

impl SupportedLanguage {
    /// Get tree-sitter language for this language
    pub fn tree_sitter_language(&self) -> Result<Language> {
        match self {
            SupportedLanguage::TypeScript => {
                Ok(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into())
            }
            SupportedLanguage::JavaScript => Ok(tree_sitter_javascript::LANGUAGE.into()),
            SupportedLanguage::Python => Ok(tree_sitter_python::LANGUAGE.into()),
            SupportedLanguage::Rust => Ok(tree_sitter_rust::LANGUAGE.into()),
        }
    }

    /// Detect language from file extension
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_lowercase().as_str() {
            "ts" | "tsx" | "mts" | "cts" => Some(SupportedLanguage::TypeScript),
            "js" | "jsx" | "mjs" | "cjs" => Some(SupportedLanguage::JavaScript),
            "py" => Some(SupportedLanguage::Python),
            "rs" => Some(SupportedLanguage::Rust),
            _ => None,
        }
    }

    /// Parse language from string name
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "typescript" | "ts" => Some(SupportedLanguage::TypeScript),
            "javascript" | "js" => Some(SupportedLanguage::JavaScript),
            "python" | "py" => Some(SupportedLanguage::Python),
            "rust" | "rs" => Some(SupportedLanguage::Rust),
            _ => None,
        }
    }

    /// Get human-readable name for this language
    pub fn name(&self) -> &'static str {
        match self {
            SupportedLanguage::TypeScript => "typescript",
            SupportedLanguage::JavaScript => "javascript",
            SupportedLanguage::Python => "python",
            SupportedLanguage::Rust => "rust",
        }
    }
}

/// Kind of reference site found in code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReferenceKind {
    Call,
    TypeUse,
    Extends,
    Implements,
    Decorator,
    Identifier,
}

/// Parsed symbol from source code
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedSymbol {
    /// Symbol name
    pub name: String,
    /// Classification aligned with the entity model
    pub kind: SymbolKind,
    /// Declaration signature (first line of the node text)
    pub signature: String,
    /// Visibility: `public`, `private`, `protected`, or `internal`
    pub visibility: String,
    /// Whether the symbol is exported from the module
    pub is_exported: bool,
    /// Whether the symbol is async (functions only)
    pub is_async: bool,
    /// Cyclomatic complexity estimate (functions only)
    pub complexity: u32,
    /// Source location
    pub location: SourceLocation,
    /// Preceding doc comment, when present
    pub docstring: Option<String>,
}

/// Import statement found in a file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedImport {
    /// Module specifier (e.g. `./auth`, `lodash`, `std::collections`)
    pub module: String,
    /// Imported names with optional aliases
    pub items: Vec<(String, Option<String>)>,
    /// Wildcard import (`import * as x`, `use foo::*`)
    pub is_wildcard: bool,
    pub line: usize,
}

/// Exported name found in a file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedExport {
    pub name: String,
    pub line: usize,
}

/// Raw reference site: a name used at a position, resolved later.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedReference {
    pub name: String,
    pub kind: ReferenceKind,
    pub line: usize,
    pub column: usize,
    /// Name of the enclosing symbol, when the site is inside one
    pub enclosing_symbol: Option<String>,
    /// Short source snippet around the site
    pub snippet: String,
    /// Receiver name for member calls (`obj.method()` keeps `obj`)
    pub receiver: Option<String>,
    /// Parameter index for parameter-type references
    pub param_index: Option<usize>,
}

/// Complete parsed representation of a source code file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedCode {
    pub language: SupportedLanguage,
    pub symbols: Vec<ParsedSymbol>,
    pub imports: Vec<ParsedImport>,
    pub exports: Vec<ParsedExport>,
    pub references: Vec<ParsedReference>,
    pub stats: ParseStats,
    pub errors: Vec<String>,
}

/// Statistics about the parsing process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParseStats {
    pub total_nodes: usize,
    pub named_nodes: usize,
    pub max_depth: usize,
    pub error_count: usize,
}

/// Configuration for code parsing
#[derive(Debug, Clone)]
pub struct ParsingConfig {
    /// Whether to extract documentation/comments
    pub extract_documentation: bool,
    /// Maximum file size to parse (in bytes)
    pub max_file_size: usize,
    /// Languages to parse (if None, parse all supported)
    pub languages: Option<Vec<SupportedLanguage>>,
}

impl Default for ParsingConfig {
    fn default() -> Self {
        Self {
            extract_documentation: true,
            max_file_size: 1024 * 1024, // 1MB
            languages: None,
        }
    }
}

/// Multi-language code parser using tree-sitter
pub struct CodeParser {
    parsers: HashMap<SupportedLanguage, Parser>,
    config: ParsingConfig,
}

impl CodeParser {
    /// Create a new code parser with default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(ParsingConfig::default())
    }

    /// Create a new code parser with custom configuration
    pub fn with_config(config: ParsingConfig) -> Result<Self> {
        let mut parsers = HashMap::new();
        let languages = config.languages.clone().unwrap_or_else(|| {
            vec![
                SupportedLanguage::TypeScript,
                SupportedLanguage::JavaScript,
                SupportedLanguage::Python,
                SupportedLanguage::Rust,
            ]
        });
        for language in languages {
            let mut parser = Parser::new();
            let tree_sitter_lang = language.tree_sitter_language().with_context(|| {
                format!("Failed to load tree-sitter language for {language:?}")
            })?;
            parser
                .set_language(&tree_sitter_lang)
                .with_context(|| format!("Failed to set parser language for {language:?}"))?;
            parsers.insert(language, parser);
        }
        Ok(Self { parsers, config })
    }

    /// Parse source content for a language
    pub fn parse_content(
        &mut self,
        content: &str,
        language: SupportedLanguage,
    ) -> Result<ParsedCode> {
        if content.len() > self.config.max_file_size {
            anyhow::bail!(
                "File size {} exceeds limit {}",
                content.len(),
                self.config.max_file_size
            );
        }
        let parser = self
            .parsers
            .get_mut(&language)
            .ok_or_else(|| anyhow::anyhow!("Parser not available for language: {language:?}"))?;
        let tree = parser
            .parse(content, None)
            .ok_or_else(|| anyhow::anyhow!("Failed to parse content"))?;

        let mut walk = Extraction {
            content,
            language,
            extract_documentation: self.config.extract_documentation,
            symbols: Vec::new(),
            imports: Vec::new(),
            exports: Vec::new(),
            references: Vec::new(),
            symbol_stack: Vec::new(),
        };
        walk.visit(tree.root_node());

        let stats = calculate_stats(&tree);
        let errors = collect_errors(&tree, content);
        Ok(ParsedCode {
            language,
            symbols: walk.symbols,
            imports: walk.imports,
            exports: walk.exports,
            references: walk.references,
            stats,
            errors,
        })
    }
}

struct Extraction<'a> {
    content: &'a str,
    language: SupportedLanguage,
    extract_documentation: bool,
    symbols: Vec<ParsedSymbol>,
    imports: Vec<ParsedImport>,
    exports: Vec<ParsedExport>,
    references: Vec<ParsedReference>,
    symbol_stack: Vec<String>,
}

impl<'a> Extraction<'a> {
    fn text(&self, node: Node) -> &'a str {
        node.utf8_text(self.content.as_bytes()).unwrap_or("")
    }

    fn visit(&mut self, node: Node) {
        let node_type = node.kind();
        let mut pushed = false;

        if let Some(kind) = self.classify_symbol(node) {
            if let Some(symbol) = self.extract_symbol(node, kind) {
                self.symbol_stack.push(symbol.name.clone());
                pushed = true;
                if symbol.is_exported {
                    self.exports.push(ParsedExport {
                        name: symbol.name.clone(),
                        line: symbol.location.start_line,
                    });
                }
                self.symbols.push(symbol);
            }
        } else if IMPORT_NODES.contains(&node_type) {
            if let Some(import) = self.extract_import(node) {
                self.imports.push(import);
            }
        } else if CALL_NODES.contains(&node_type) {
            self.extract_call(node);
        } else if node_type == DECORATOR_NODE {
            self.extract_decorator(node);
        } else if node_type == EXTENDS_CLAUSE
            || node_type == EXTENDS_CLAUSE_TS
            || (self.language == SupportedLanguage::Python && node_type == "argument_list"
                && node
                    .parent()
                    .map(|p| p.kind() == "class_definition")
                    .unwrap_or(false))
        {
            self.extract_heritage(node, ReferenceKind::Extends);
        } else if node_type == IMPLEMENTS_CLAUSE {
            self.extract_heritage(node, ReferenceKind::Implements);
        } else if TYPE_REF_NODES.contains(&node_type) {
            self.extract_type_use(node);
        }

        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            self.visit(child);
        }
        if pushed {
            self.symbol_stack.pop();
        }
    }

    fn classify_symbol(&self, node: Node) -> Option<SymbolKind> {
        let node_type = node.kind();
        if FUNCTION_NODES.contains(&node_type) {
            // Anonymous arrow functions are not standalone symbols
            if node_type == "arrow_function" {
                return None;
            }
            if self.is_inside_method_container(node) {
                return Some(SymbolKind::Method);
            }
            return Some(SymbolKind::Function);
        }
        if METHOD_NODES.contains(&node_type) {
            return Some(SymbolKind::Method);
        }
        if CLASS_NODES.contains(&node_type) {
            return Some(SymbolKind::Class);
        }
        if INTERFACE_NODES.contains(&node_type) {
            return Some(SymbolKind::Interface);
        }
        if TYPE_ALIAS_NODES.contains(&node_type) {
            return Some(SymbolKind::TypeAlias);
        }
        if PROPERTY_NODES.contains(&node_type) {
            return Some(SymbolKind::Property);
        }
        if VARIABLE_NODES.contains(&node_type) {
            // Module-level declarations only; locals create noise
            if self.symbol_stack.is_empty() {
                return Some(SymbolKind::Variable);
            }
        }
        None
    }

    fn extract_symbol(&self, node: Node, kind: SymbolKind) -> Option<ParsedSymbol> {
        let name = self.symbol_name(node)?;
        let start = node.start_position();
        let end = node.end_position();
        let text = self.text(node);
        let signature = text.lines().next().unwrap_or("").trim().to_string();
        let is_async = signature.contains("async ");
        let complexity = if matches!(kind, SymbolKind::Function | SymbolKind::Method) {
            1 + count_branches(node)
        } else {
            0
        };
        Some(ParsedSymbol {
            name,
            kind,
            signature,
            visibility: self.visibility(node),
            is_exported: self.is_exported(node),
            is_async,
            complexity,
            location: SourceLocation {
                start_line: start.row + 1,
                start_column: start.column,
                end_line: end.row + 1,
                end_column: end.column,
            },
            docstring: if self.extract_documentation {
                self.doc_comment(node)
            } else {
                None
            },
        })
    }

    fn symbol_name(&self, node: Node) -> Option<String> {
        if let Some(name_node) = node.child_by_field_name("name") {
            let name = self.text(name_node).trim();
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if IDENTIFIER_NODES.contains(&child.kind()) {
                let name = self.text(child).trim();
                if !name.is_empty() {
                    return Some(name.to_string());
                }
            }
        }
        None
    }

    fn is_inside_method_container(&self, node: Node) -> bool {
        let mut current = node.parent();
        while let Some(parent) = current {
            if METHOD_CONTAINER_NODES.contains(&parent.kind()) {
                return true;
            }
            current = parent.parent();
        }
        false
    }

    fn is_exported(&self, node: Node) -> bool {
        match self.language {
            SupportedLanguage::TypeScript | SupportedLanguage::JavaScript => {
                let mut current = node.parent();
                while let Some(parent) = current {
                    if parent.kind() == EXPORT_STATEMENT {
                        return true;
                    }
                    current = parent.parent();
                }
                false
            }
            SupportedLanguage::Rust => {
                let mut cursor = node.walk();
                for child in node.children(&mut cursor) {
                    if child.kind() == "visibility_modifier" {
                        return self.text(child).starts_with("pub");
                    }
                }
                false
            }
            SupportedLanguage::Python => self
                .symbol_name(node)
                .map(|n| !n.starts_with('_'))
                .unwrap_or(false),
        }
    }

    fn visibility(&self, node: Node) -> String {
        let text = self.text(node);
        let head = text.lines().next().unwrap_or("");
        if head.contains("private ") {
            "private".to_string()
        } else if head.contains("protected ") {
            "protected".to_string()
        } else if self.language == SupportedLanguage::Rust {
            if self.is_exported(node) {
                "public".to_string()
            } else {
                "internal".to_string()
            }
        } else if self.language == SupportedLanguage::Python {
            if self.symbol_name(node).map(|n| n.starts_with('_')).unwrap_or(false) {
                "private".to_string()
            } else {
                "public".to_string()
            }
        } else {
            "public".to_string()
        }
    }

    fn doc_comment(&self, node: Node) -> Option<String> {
        let prev = node.prev_sibling()?;
        let kind = prev.kind();
        if kind == "comment" || kind == "line_comment" || kind == "block_comment" {
            let text = self.text(prev).trim().to_string();
            if !text.is_empty() {
                return Some(text);
            }
        }
        None
    }

    fn extract_import(&self, node: Node) -> Option<ParsedImport> {
        let text = self.text(node);
        let line = node.start_position().row + 1;
        match self.language {
            SupportedLanguage::TypeScript | SupportedLanguage::JavaScript => {
                let module = node
                    .child_by_field_name("source")
                    .map(|s| self.text(s).trim_matches(['"', '\'', '`']).to_string())?;
                let mut items = Vec::new();
                let mut is_wildcard = false;
                collect_ts_import_names(node, self.content, &mut items, &mut is_wildcard);
                Some(ParsedImport {
                    module,
                    items,
                    is_wildcard,
                    line,
                })
            }
            SupportedLanguage::Python => {
                if node.kind() == "import_from_statement" {
                    let module = node
                        .child_by_field_name("module_name")
                        .map(|m| self.text(m).to_string())?;
                    let mut items = Vec::new();
                    let mut is_wildcard = text.contains('*');
                    let mut cursor = node.walk();
                    for child in node.children(&mut cursor) {
                        if child.kind() == "dotted_name" && self.text(child) != module {
                            items.push((self.text(child).to_string(), None));
                        } else if child.kind() == "aliased_import" {
                            let name = child
                                .child_by_field_name("name")
                                .map(|n| self.text(n).to_string())
                                .unwrap_or_default();
                            let alias = child
                                .child_by_field_name("alias")
                                .map(|a| self.text(a).to_string());
                            items.push((name, alias));
                        } else if child.kind() == "wildcard_import" {
                            is_wildcard = true;
                        }
                    }
                    Some(ParsedImport {
                        module,
                        items,
                        is_wildcard,
                        line,
                    })
                } else {
                    let module = node
                        .child_by_field_name("name")
                        .map(|m| self.text(m).to_string())
                        .or_else(|| {
                            let mut cursor = node.walk();
                            let found = node
                                .children(&mut cursor)
                                .find(|c| c.kind() == "dotted_name" || c.kind() == "aliased_import")
                                .map(|c| self.text(c).to_string());
                            found
                        })?;
                    Some(ParsedImport {
                        module: module.clone(),
                        items: vec![(module, None)],
                        is_wildcard: false,
                        line,
                    })
                }
            }
            SupportedLanguage::Rust => {
                let body = text
                    .trim_start_matches("pub ")
                    .trim_start_matches("use ")
                    .trim_end_matches(';')
                    .trim()
                    .to_string();
                let is_wildcard = body.ends_with("::*");
                let (module, item) = match body.rsplit_once("::") {
                    Some((module, item)) => (module.to_string(), item.to_string()),
                    None => (body.clone(), body.clone()),
                };
                let items = if is_wildcard || item.starts_with('{') {
                    Vec::new()
                } else {
                    vec![(item, None)]
                };
                Some(ParsedImport {
                    module,
                    items,
                    is_wildcard,
                    line,
                })
            }
        }
    }

    fn extract_call(&mut self, node: Node) {
        let callee = node
            .child_by_field_name("function")
            .or_else(|| node.child_by_field_name("constructor"))
            .or_else(|| node.named_child(0));
        let Some(callee) = callee else {
            return;
        };
        // `obj.method()` keeps only the trailing name; the resolver decides
        // whether the receiver is known
        let (name, receiver) = match callee.kind() {
            "member_expression" | "attribute" => {
                let name = callee
                    .child_by_field_name("property")
                    .or_else(|| callee.child_by_field_name("attribute"))
                    .map(|n| self.text(n).to_string());
                let receiver = callee
                    .child_by_field_name("object")
                    .map(|n| self.text(n).to_string());
                (name, receiver)
            }
            _ => (Some(self.text(callee).to_string()), None),
        };
        let Some(name) = name.filter(|n| !n.is_empty()) else {
            return;
        };
        let name = name.trim_end_matches('!').to_string();
        self.push_reference(node, name, ReferenceKind::Call, receiver, None);
    }

    fn extract_decorator(&mut self, node: Node) {
        let text = self.text(node);
        let name = text
            .trim_start_matches('@')
            .split(['(', '.'])
            .next()
            .unwrap_or("")
            .trim()
            .to_string();
        if !name.is_empty() {
            self.push_reference(node, name, ReferenceKind::Decorator, None, None);
        }
    }

    fn extract_heritage(&mut self, node: Node, kind: ReferenceKind) {
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if IDENTIFIER_NODES.contains(&child.kind()) {
                let name = self.text(child).to_string();
                if !name.is_empty() {
                    self.push_reference(child, name, kind, None, None);
                }
            }
        }
    }

    fn extract_type_use(&mut self, node: Node) {
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if child.kind() == "type_identifier" || child.kind() == "identifier" {
                let name = self.text(child).to_string();
                if !name.is_empty() {
                    let param_index = parameter_index(node);
                    self.push_reference(child, name, ReferenceKind::TypeUse, None, param_index);
                }
            }
        }
    }

    fn push_reference(
        &mut self,
        node: Node,
        name: String,
        kind: ReferenceKind,
        receiver: Option<String>,
        param_index: Option<usize>,
    ) {
        let pos = node.start_position();
        let snippet: String = self.text(node).chars().take(120).collect();
        self.references.push(ParsedReference {
            name,
            kind,
            line: pos.row + 1,
            column: pos.column,
            enclosing_symbol: self.symbol_stack.last().cloned(),
            snippet,
            receiver,
            param_index,
        });
    }
}

fn collect_ts_import_names(
    node: Node,
    content: &str,
    items: &mut Vec<(String, Option<String>)>,
    is_wildcard: &mut bool,
) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "import_specifier" => {
                let name = child
                    .child_by_field_name("name")
                    .and_then(|n| n.utf8_text(content.as_bytes()).ok())
                    .unwrap_or("")
                    .to_string();
                let alias = child
                    .child_by_field_name("alias")
                    .and_then(|n| n.utf8_text(content.as_bytes()).ok())
                    .map(str::to_string);
                if !name.is_empty() {
                    items.push((name, alias));
                }
            }
            "namespace_import" => {
                *is_wildcard = true;
            }
            "identifier" => {
                // Default import
                if let Ok(name) = child.utf8_text(content.as_bytes()) {
                    items.push((name.to_string(), None));
                }
            }
            _ => collect_ts_import_names(child, content, items, is_wildcard),
        }
    }
}

/// Index of the enclosing formal parameter, when the type annotation sits
/// inside a parameter list.
fn parameter_index(node: Node) -> Option<usize> {
    let mut current = node.parent();
    while let Some(parent) = current {
        let kind = parent.kind();
        if kind == "required_parameter" || kind == "optional_parameter" || kind == "parameter" {
            let list = parent.parent()?;
            let mut cursor = list.walk();
            let mut index = 0usize;
            for sibling in list.children(&mut cursor) {
                let sk = sibling.kind();
                if sk == "required_parameter" || sk == "optional_parameter" || sk == "parameter" {
                    if sibling.id() == parent.id() {
                        return Some(index);
                    }
                    index += 1;
                }
            }
            return None;
        }
        if FUNCTION_NODES.contains(&kind) || METHOD_NODES.contains(&kind) {
            return None;
        }
        current = parent.parent();
    }
    None
}

fn count_branches(node: Node) -> u32 {
    let mut count = 0;
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if BRANCH_NODES.contains(&child.kind()) {
            count += 1;
        }
        count += count_branches(child);
    }
    count
}

fn calculate_stats(tree: &Tree) -> ParseStats {
    fn walk(node: Node, depth: usize, stats: &mut ParseStats) {
        stats.total_nodes += 1;
        if node.is_named() {
            stats.named_nodes += 1;
        }
        if node.is_error() {
            stats.error_count += 1;
        }
        stats.max_depth = stats.max_depth.max(depth);
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            walk(child, depth + 1, stats);
        }
    }
    let mut stats = ParseStats::default();
    walk(tree.root_node(), 0, &mut stats);
    stats
}

fn collect_errors(tree: &Tree, content: &str) -> Vec<String> {
    fn walk(node: Node, content: &str, errors: &mut Vec<String>) {
        if node.is_error() || node.is_missing() {
            let pos = node.start_position();
            let snippet: String = node
                .utf8_text(content.as_bytes())
                .unwrap_or("")
                .chars()
                .take(60)
                .collect();
            errors.push(format!(
                "syntax error at {}:{}: {snippet}",
                pos.row + 1,
                pos.column
            ));
        }
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            walk(child, content, errors);
        }
    }
    let mut errors = Vec::new();
    walk(tree.root_node(), content, &mut errors);
    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str, language: SupportedLanguage) -> ParsedCode {
        let mut parser = CodeParser::new().unwrap();
        parser.parse_content(source, language).unwrap()
    }

    #[test]
    fn typescript_symbols_and_exports() {
        let parsed = parse(
            r#"
export function foo(): void {
    bar();
}

export class AuthService implements Service {
    login(user: User): boolean {
        return check(user);
    }
}

type Handler = (req: Request) => void;
"#,
            SupportedLanguage::TypeScript,
        );

        let foo = parsed.symbols.iter().find(|s| s.name == "foo").unwrap();
        assert_eq!(foo.kind, SymbolKind::Function);
        assert!(foo.is_exported);

        let auth = parsed
            .symbols
            .iter()
            .find(|s| s.name == "AuthService")
            .unwrap();
        assert_eq!(auth.kind, SymbolKind::Class);

        let login = parsed.symbols.iter().find(|s| s.name == "login").unwrap();
        assert_eq!(login.kind, SymbolKind::Method);

        assert!(parsed.symbols.iter().any(|s| s.kind == SymbolKind::TypeAlias));
        assert!(parsed.exports.iter().any(|e| e.name == "foo"));
    }

    #[test]
    fn typescript_call_references_carry_enclosing_symbol() {
        let parsed = parse(
            "export function foo(): void {\n    bar();\n}\n",
            SupportedLanguage::TypeScript,
        );
        let call = parsed
            .references
            .iter()
            .find(|r| r.kind == ReferenceKind::Call && r.name == "bar")
            .unwrap();
        assert_eq!(call.enclosing_symbol.as_deref(), Some("foo"));
        assert_eq!(call.line, 2);
    }

    #[test]
    fn typescript_imports_with_aliases() {
        let parsed = parse(
            "import { login as doLogin, logout } from './auth';\nimport * as lodash from 'lodash';\n",
            SupportedLanguage::TypeScript,
        );
        assert_eq!(parsed.imports.len(), 2);
        let auth = &parsed.imports[0];
        assert_eq!(auth.module, "./auth");
        assert!(auth
            .items
            .iter()
            .any(|(name, alias)| name == "login" && alias.as_deref() == Some("doLogin")));
        assert!(parsed.imports[1].is_wildcard);
    }

    #[test]
    fn python_symbols_and_inheritance() {
        let parsed = parse(
            r#"
from auth import login

class AdminUser(BaseUser):
    def promote(self):
        login(self)

def _private_helper():
    pass
"#,
            SupportedLanguage::Python,
        );
        let class = parsed
            .symbols
            .iter()
            .find(|s| s.name == "AdminUser")
            .unwrap();
        assert_eq!(class.kind, SymbolKind::Class);
        assert!(class.is_exported);

        let helper = parsed
            .symbols
            .iter()
            .find(|s| s.name == "_private_helper")
            .unwrap();
        assert!(!helper.is_exported);

        assert!(parsed
            .references
            .iter()
            .any(|r| r.kind == ReferenceKind::Extends && r.name == "BaseUser"));
        assert!(parsed.imports.iter().any(|i| i.module == "auth"));
    }

    #[test]
    fn rust_pub_functions_are_exported() {
        let parsed = parse(
            "pub fn alpha() { beta(); }\nfn beta() {}\n",
            SupportedLanguage::Rust,
        );
        let alpha = parsed.symbols.iter().find(|s| s.name == "alpha").unwrap();
        assert!(alpha.is_exported);
        let beta = parsed.symbols.iter().find(|s| s.name == "beta").unwrap();
        assert!(!beta.is_exported);
        assert!(parsed
            .references
            .iter()
            .any(|r| r.kind == ReferenceKind::Call && r.name == "beta"));
    }

    #[test]
    fn complexity_counts_branches() {
        let parsed = parse(
            r#"
function route(x: number): string {
    if (x > 0) {
        return "pos";
    }
    for (let i = 0; i < x; i++) {
        if (i % 2 === 0) {
            continue;
        }
    }
    return "neg";
}
"#,
            SupportedLanguage::TypeScript,
        );
        let route = parsed.symbols.iter().find(|s| s.name == "route").unwrap();
        assert!(route.complexity >= 4);
    }

    #[test]
    fn broken_source_collects_errors() {
        let parsed = parse("function broken( {", SupportedLanguage::TypeScript);
        assert!(parsed.stats.error_count > 0 || !parsed.errors.is_empty());
    }
}
