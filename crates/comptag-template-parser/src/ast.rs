//! # Abstract Syntax Tree (AST) for component template tags
//!
//! The AST is the output of [`crate::parse_tag`] and the input of
//! [`crate::compile_tag`]. It captures:
//!
//! - Tag names and attributes
//! - Values with their kinds (strings, numbers, variables, template strings, ...)
//! - Filter chains and filter arguments
//! - Spread markers (`...`, `*`, `**`)
//! - Position information (line/column, start/end byte indices)
//!
//! Every node carries `start_index`/`end_index` (half-open byte offsets into
//! the original input) and `line_col` (1-based line and column of
//! `start_index`, columns counted in code points). Nodes are created by the
//! parser and never mutated afterwards.

use serde::Serialize;

/// Top-level tag attribute, e.g. `key=my_var` or without key like `my_var|filter`
#[derive(Debug, PartialEq, Clone, Serialize)]
pub struct TagAttr {
    pub key: Option<TagToken>,
    pub value: TagValue,
    pub is_flag: bool,

    /// Start index (incl. filters and spread)
    pub start_index: usize,
    /// End index (incl. filters and spread)
    pub end_index: usize,
    /// Line and column (incl. filters and spread)
    pub line_col: (usize, usize),
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize)]
pub enum ValueKind {
    List,
    Dict,
    Int,
    Float,
    Variable,
    /// A backtick string with `${...}` interpolations, or a quoted string
    /// that contains host template markers like `{{ my_var }}`.
    TemplateString,
    Translation,
    String,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::List => "list",
            ValueKind::Dict => "dict",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Variable => "variable",
            ValueKind::TemplateString => "template_string",
            ValueKind::Translation => "translation",
            ValueKind::String => "string",
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Spread marker attached to a value.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize)]
pub enum SpreadKind {
    /// `...` - expands an iterable into the surrounding args or list.
    Dots,
    /// `*` - iterable expansion, top-level positional values only.
    Star,
    /// `**` - mapping expansion into kwargs or a dict.
    DoubleStar,
}

impl SpreadKind {
    pub fn as_marker(&self) -> &'static str {
        match self {
            SpreadKind::Dots => "...",
            SpreadKind::Star => "*",
            SpreadKind::DoubleStar => "**",
        }
    }
}

/// Metadata of the matched token
#[derive(Debug, PartialEq, Clone, Serialize)]
pub struct TagToken {
    /// String value of the token (excl. filters and spread).
    ///
    /// This equals the matched source text, except:
    /// - quoted strings hold the payload without the quotes (escape
    ///   sequences intact; the compiler decodes them),
    /// - translations hold the inner string payload of `_("...")`,
    /// - composites (list, dict, template string) hold the opening
    ///   delimiter (`[`, `{` or a backtick) and span only that delimiter.
    pub token: String,
    /// Start index (excl. filters and spread)
    pub start_index: usize,
    /// End index (excl. filters and spread)
    pub end_index: usize,
    /// Line and column (excl. filters and spread)
    pub line_col: (usize, usize),
}

#[derive(Debug, PartialEq, Clone, Serialize)]
pub struct TagValue {
    /// Position and string value of the value (excl. filters and spread)
    ///
    /// NOTE: If this TagValue has NO filters and NO spread, position and
    ///       index in `token` are the same as `start_index`, `end_index`
    ///       and `line_col` defined directly on `TagValue`.
    pub token: TagToken,
    /// Children of this TagValue:
    /// - list items like `[1, 2, 3]`,
    /// - dict entries like `{"key": "value"}`, alternating key, value, ...
    ///   where a `**` spread entry appears in place without a key partner,
    /// - template string fragments: literal segments as `String` values and
    ///   `${...}` interpolations as arbitrary values, in source order.
    pub children: Vec<TagValue>,

    pub kind: ValueKind,
    pub spread: Option<SpreadKind>,
    pub filters: Vec<TagValueFilter>,

    /// Start index (incl. filters and spread)
    pub start_index: usize,
    /// End index (incl. filters and spread)
    pub end_index: usize,
    /// Line and column (incl. filters and spread)
    pub line_col: (usize, usize),
}

#[derive(Debug, PartialEq, Clone, Serialize)]
pub struct TagValueFilter {
    /// Token of the filter, e.g. `filter`
    pub token: TagToken,
    /// Argument of the filter, e.g. `my_var` in `var|filter:my_var`.
    /// The argument's spans include the leading `:`.
    pub arg: Option<TagValue>,

    /// Start index (incl. `|`)
    pub start_index: usize,
    /// End index (incl. `|`)
    pub end_index: usize,
    /// Line and column (incl. `|`)
    pub line_col: (usize, usize),
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize)]
pub enum TagSyntax {
    /// For tags like `{% my_tag ... %}`
    Django,
    /// For tags like `<my_tag ... />`
    Html,
}

/// Represents a full template tag, including its name, attributes, and other
/// metadata. E.g. the body of `{% slot key=val key2=val2 %}`.
#[derive(Debug, PartialEq, Clone, Serialize)]
pub struct Tag {
    /// The name of the tag, e.g. 'slot' in `{% slot ... %}`.
    /// This is a `TagToken` to include positional data.
    pub name: TagToken,

    /// A list of attributes passed to the tag, in source order.
    pub attrs: Vec<TagAttr>,

    /// Whether the tag is self-closing, e.g. `{% my_tag / %}`.
    pub is_self_closing: bool,

    /// The syntax of the tag. The parser always produces `Django`; the
    /// variant is carried for hosts that embed the core under HTML-style
    /// delimiters.
    pub syntax: TagSyntax,

    /// Start index of the tag in the input string.
    pub start_index: usize,

    /// End index of the tag in the input string.
    pub end_index: usize,

    /// Line and column number of the start of the tag.
    pub line_col: (usize, usize),
}
