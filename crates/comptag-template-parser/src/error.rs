use std::fmt;

use thiserror::Error;

/// Position of an error within the tag source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePos {
    /// Byte offset into the input.
    pub offset: usize,
    /// 1-based line and column; columns count code points.
    pub line_col: (usize, usize),
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line_col.0, self.line_col.1)
    }
}

/// Error returned by [`crate::parse_tag`]. The parser does not recover; the
/// first error wins.
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    /// A lexical failure: an opening quote, backtick or `{#` that is never
    /// closed. Points at the opening delimiter.
    #[error("{message} at {pos}")]
    Lex {
        message: String,
        pos: SourcePos,
        snippet: Option<String>,
    },
    /// The input does not match the tag grammar.
    #[error("{message} at {pos}")]
    Grammar {
        message: String,
        pos: SourcePos,
        snippet: Option<String>,
    },
}

impl ParseError {
    pub fn pos(&self) -> SourcePos {
        match self {
            ParseError::Lex { pos, .. } | ParseError::Grammar { pos, .. } => *pos,
        }
    }
}

/// Structural AST violation found while lowering, before any evaluation.
#[derive(Debug, Error, PartialEq)]
pub enum CompileError {
    #[error("dict key at line/column {line_col:?} has no value")]
    DanglingDictKey { line_col: (usize, usize) },

    #[error("dict keys cannot be lists or dicts (at line/column {line_col:?})")]
    ContainerDictKey { line_col: (usize, usize) },

    #[error("spread `{marker}` is not allowed on {position} (at line/column {line_col:?})")]
    SpreadNotAllowed {
        marker: &'static str,
        position: &'static str,
        line_col: (usize, usize),
    },

    #[error("flag attribute must be a bare variable (at line/column {line_col:?})")]
    MalformedFlag { line_col: (usize, usize) },

    #[error("invalid numeric literal `{token}` (at line/column {line_col:?})")]
    InvalidNumber {
        token: String,
        line_col: (usize, usize),
    },
}

/// Runtime failure while a compiled tag is being invoked. Resolver errors
/// pass through unchanged in the `Resolver` variant.
#[derive(Debug, Error, PartialEq)]
pub enum EvalError<E> {
    #[error("{0}")]
    Resolver(E),

    #[error("value of `...{name}` is not iterable")]
    NotIterable { name: String },

    #[error("value of `**{name}` is not a mapping")]
    NotMapping { name: String },
}
