//! Macro documents: typed model, YAML parser and lookup

pub mod library;
pub mod parse;
pub mod schema;

pub use library::{LibraryError, MacroLibrary, MacroSummary};
pub use parse::{parse_macro, SchemaError, SchemaIssue};
pub use schema::{
    ActionNode, Block, LogLevel, MacroDefinition, NodeKind, ParamSpec, ParamType, Pattern,
    RESERVED_NAMES,
};
