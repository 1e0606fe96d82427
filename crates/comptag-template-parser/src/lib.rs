//! # Component template tag parser & compiler
//!
//! Parses the body of a component template tag (the text between the outer
//! delimiters, e.g. the inside of `{% ... %}`) into a typed AST, and
//! compiles that AST into an evaluation plan which produces the positional
//! and keyword arguments for the tag handler.
//!
//! ```text
//! raw string -> parse_tag -> Tag AST -> compile_tag -> CompiledTag
//!     -> call(context, resolvers) -> (args, kwargs)
//! ```
//!
//! The core never evaluates variables, translations, template expressions or
//! filters itself; the compiled plan invokes the caller-supplied
//! [`Resolver`] for those. Parsing and compilation are pure; a
//! [`CompiledTag`] can be cached per tag and called many times.

use std::collections::HashSet;

pub mod ast;
pub mod error;
pub mod render;
pub mod tag_compiler;
pub mod tag_parser;
pub mod value;

// Re-export the types that users need
pub use ast::{SpreadKind, Tag, TagAttr, TagSyntax, TagToken, TagValue, TagValueFilter, ValueKind};
pub use error::{CompileError, EvalError, ParseError, SourcePos};
pub use tag_compiler::{compile_attrs, CompiledTag, Resolver};
pub use value::Value;

use tag_parser::TagParser;

/// Parse a template tag body into a [`Tag`] AST.
///
/// `flags` lists the bare identifiers that should be treated as boolean
/// flags instead of variable references.
pub fn parse_tag(input: &str, flags: Option<HashSet<String>>) -> Result<Tag, ParseError> {
    let flags = flags.unwrap_or_default();
    TagParser::parse_tag(input, &flags)
}

/// Compile a parsed [`Tag`] into an evaluation plan.
pub fn compile_tag(tag: &Tag) -> Result<CompiledTag, CompileError> {
    tag_compiler::compile_tag(tag)
}
