//! Multi-language source parsing built on tree-sitter
//!
//! Parsing turns a source file into symbols, import/export records, and
//! raw reference sites (calls, type uses, inheritance clauses). Reference
//! resolution lives in the relationship builder; this module never touches
//! the graph.

#[cfg(feature = "tree-sitter-parsing")]
mod tree_sitter;

#[cfg(feature = "tree-sitter-parsing")]
pub use tree_sitter::{
    CodeParser, ParseStats, ParsedCode, ParsedExport, ParsedImport, ParsedReference,
    ParsedSymbol, ParsingConfig, ReferenceKind, SupportedLanguage,
};

#[cfg(not(feature = "tree-sitter-parsing"))]
pub mod stub {
    //! Stub implementations when tree-sitter parsing is not enabled
    use anyhow::{anyhow, Result};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum SupportedLanguage {
        TypeScript,
        JavaScript,
        Python,
        Rust,
    }

    impl SupportedLanguage {
        pub fn from_extension(_extension: &str) -> Option<Self> {
            None
        }

        pub fn name(&self) -> &'static str {
            match self {
                Self::TypeScript => "typescript",
                Self::JavaScript => "javascript",
                Self::Python => "python",
                Self::Rust => "rust",
            }
        }
    }

    pub struct CodeParser;

    impl CodeParser {
        pub fn new() -> Result<Self> {
            Err(anyhow!(
                "Tree-sitter parsing not enabled. Enable the 'tree-sitter-parsing' feature."
            ))
        }
    }
}

#[cfg(not(feature = "tree-sitter-parsing"))]
pub use stub::*;
