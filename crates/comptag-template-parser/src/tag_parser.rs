//! # Template tag parser
//!
//! Converts the body of a component template tag (the text between the outer
//! delimiters, e.g. the inside of `{% ... %}`) into an Abstract Syntax Tree,
//! using the [Pest](https://pest.rs/) parsing library.
//!
//! The grammar lives in `grammar.pest` and supports:
//!
//! - **Value types**: strings, numbers, variables, template strings,
//!   translations, lists, dicts
//! - **Filter chains**: `value|filter1|filter2:arg`
//! - **Spread operators**: `...value`, `*value`, `**value` on top-level
//!   values, `...` inside lists, `**` inside dicts
//! - **Template strings**: backtick literals with `${...}` interpolations,
//!   plus detection of host template markers inside quoted strings
//! - **Comments**: `{# comment #}` anywhere whitespace is allowed
//! - **Flags**: bare identifiers promoted via a caller-supplied flag set
//! - **Position tracking**: byte offsets and line/column on every node
//!
//! ## Error handling
//!
//! The parser stops at the first error. Grammar violations surface as
//! [`ParseError::Grammar`] with the position and expected-token message from
//! the grammar engine; a post-failure scan upgrades unterminated strings,
//! template strings and comments to [`ParseError::Lex`] pointing at the
//! opening delimiter.

use std::collections::HashSet;

use pest::error::{InputLocation, LineColLocation};
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;

use crate::ast::{SpreadKind, Tag, TagAttr, TagSyntax, TagToken, TagValue, TagValueFilter, ValueKind};
use crate::error::{ParseError, SourcePos};

#[derive(Parser)]
#[grammar = "grammar.pest"]
pub struct TagParser;

impl TagParser {
    pub fn parse_tag(input: &str, flags: &HashSet<String>) -> Result<Tag, ParseError> {
        let mut source_pairs = Self::parse(Rule::tag_source, input)
            .map_err(|err| refine_parse_error(err, input))?;

        let source_pair = source_pairs.next().ok_or_else(|| ParseError::Grammar {
            message: "empty tag".to_string(),
            pos: SourcePos {
                offset: 0,
                line_col: (1, 1),
            },
            snippet: snippet_at(input, 1),
        })?;

        let content_pair = source_pair
            .into_inner()
            .find(|pair| pair.as_rule() == Rule::tag_content)
            .ok_or_else(|| ParseError::Grammar {
                message: "empty tag".to_string(),
                pos: SourcePos {
                    offset: 0,
                    line_col: (1, 1),
                },
                snippet: snippet_at(input, 1),
            })?;

        let start_index = content_pair.as_span().start();
        let line_col = content_pair.line_col();
        let mut inner_pairs = content_pair.into_inner();

        // First item in a tag is always the tag name
        let name_pair = match inner_pairs.next() {
            Some(pair) if pair.as_rule() == Rule::tag_name => pair,
            _ => {
                return Err(ParseError::Grammar {
                    message: "tag name is missing".to_string(),
                    pos: SourcePos {
                        offset: start_index,
                        line_col,
                    },
                    snippet: snippet_at(input, line_col.0),
                })
            }
        };
        let name = token_from_pair(&name_pair);

        let mut attrs = Vec::new();
        let mut seen_flags: HashSet<String> = HashSet::new();
        let mut is_self_closing = false;

        for pair in inner_pairs {
            match pair.as_rule() {
                Rule::attribute => {
                    let mut attr = Self::process_attribute(pair)?;

                    // A bare variable matching a caller flag becomes a flag.
                    // Spreads, filters, keys and quoted strings never do.
                    if attr.key.is_none()
                        && attr.value.spread.is_none()
                        && attr.value.filters.is_empty()
                        && attr.value.kind == ValueKind::Variable
                        && flags.contains(&attr.value.token.token)
                    {
                        attr.is_flag = true;
                        if !seen_flags.insert(attr.value.token.token.clone()) {
                            return Err(ParseError::Grammar {
                                message: format!(
                                    "Flag '{}' may be specified only once.",
                                    attr.value.token.token
                                ),
                                pos: SourcePos {
                                    offset: attr.start_index,
                                    line_col: attr.line_col,
                                },
                                snippet: snippet_at(input, attr.line_col.0),
                            });
                        }
                    }

                    attrs.push(attr);
                }
                Rule::self_closing_slash => {
                    is_self_closing = true;
                }
                _ => { /* comments */ }
            }
        }

        Ok(Tag {
            name,
            attrs,
            is_self_closing,
            syntax: TagSyntax::Django,
            start_index,
            end_index: input.len(),
            line_col,
        })
    }

    fn process_attribute(attr_pair: Pair<Rule>) -> Result<TagAttr, ParseError> {
        let attr_start = attr_pair.as_span().start();
        let attr_line_col = attr_pair.line_col();

        let inner = attr_pair
            .into_inner()
            .find(|pair| pair.as_rule() != Rule::COMMENT)
            .expect("attribute always wraps one alternative");

        match inner.as_rule() {
            Rule::kv_pair => {
                let mut parts = inner.into_inner();
                let key_pair = parts.next().expect("kv_pair starts with attr_key");
                let value_pair = parts
                    .find(|pair| pair.as_rule() == Rule::filtered_value)
                    .expect("kv_pair ends with filtered_value");

                let value = Self::process_filtered_value(value_pair)?;
                let end_index = value.end_index;

                Ok(TagAttr {
                    key: Some(token_from_pair(&key_pair)),
                    value,
                    is_flag: false,
                    start_index: attr_start,
                    end_index,
                    line_col: attr_line_col,
                })
            }
            Rule::spread_attr => {
                let spread_start = inner.as_span().start();
                let spread_line_col = inner.line_col();
                let mut parts = inner.into_inner();

                let op_pair = parts.next().expect("spread_attr starts with spread_op");
                let kind = match op_pair.as_str() {
                    "..." => SpreadKind::Dots,
                    "*" => SpreadKind::Star,
                    "**" => SpreadKind::DoubleStar,
                    other => unreachable!("invalid spread marker {:?}", other),
                };

                let value_pair = parts
                    .find(|pair| pair.as_rule() == Rule::filtered_value)
                    .expect("spread_attr ends with filtered_value");
                let mut value = Self::process_filtered_value(value_pair)?;
                value.spread = Some(kind);
                value.start_index = spread_start;
                value.line_col = spread_line_col;
                let end_index = value.end_index;

                Ok(TagAttr {
                    key: None,
                    value,
                    is_flag: false,
                    start_index: spread_start,
                    end_index,
                    line_col: spread_line_col,
                })
            }
            Rule::filtered_value => {
                let value = Self::process_filtered_value(inner)?;
                let end_index = value.end_index;

                Ok(TagAttr {
                    key: None,
                    value,
                    is_flag: false,
                    start_index: attr_start,
                    end_index,
                    line_col: attr_line_col,
                })
            }
            other => unreachable!("invalid attribute structure {:?}", other),
        }
    }

    // A filtered value is any value with an optional filter chain after it,
    // e.g. `my_var`, `my_var|filter`, `[1, 2, 3]|filter1|filter2`.
    //
    // The returned spans cover the filters; the token keeps the value's own
    // position.
    fn process_filtered_value(pair: Pair<Rule>) -> Result<TagValue, ParseError> {
        let total_span = pair.as_span();
        let total_line_col = pair.line_col();
        let mut inner = pair.into_inner();

        let value_pair = inner
            .find(|pair| pair.as_rule() == Rule::value)
            .expect("filtered_value starts with value");
        let mut value = Self::process_value(value_pair)?;
        value.start_index = total_span.start();
        value.end_index = total_span.end();
        value.line_col = total_line_col;

        if let Some(chain) = inner.find(|pair| {
            matches!(
                pair.as_rule(),
                Rule::filter_chain | Rule::filter_chain_noarg
            )
        }) {
            value.filters = Self::process_filter_chain(chain)?;
        }

        Ok(value)
    }

    fn process_value(pair: Pair<Rule>) -> Result<TagValue, ParseError> {
        let inner = pair
            .into_inner()
            .next()
            .expect("value wraps one alternative");
        match inner.as_rule() {
            Rule::list => Self::process_list(inner),
            Rule::dict => Self::process_dict(inner),
            Rule::scalar => Self::process_scalar(inner),
            other => unreachable!("invalid value {:?}", other),
        }
    }

    fn process_scalar(pair: Pair<Rule>) -> Result<TagValue, ParseError> {
        let concrete = pair
            .into_inner()
            .next()
            .expect("scalar wraps one alternative");
        let span = concrete.as_span();
        let line_col = concrete.line_col();

        match concrete.as_rule() {
            Rule::translation => Self::process_translation(concrete),
            Rule::tstring => Self::process_template_string(concrete),
            Rule::string_literal => {
                let text = concrete.as_str();
                let payload = &text[1..text.len() - 1];
                let kind = if has_template_marker(payload) {
                    ValueKind::TemplateString
                } else {
                    ValueKind::String
                };
                Ok(leaf_value(
                    TagToken {
                        token: payload.to_string(),
                        start_index: span.start(),
                        end_index: span.end(),
                        line_col,
                    },
                    kind,
                ))
            }
            Rule::int => Ok(leaf_value(token_from_pair(&concrete), ValueKind::Int)),
            Rule::float => Ok(leaf_value(token_from_pair(&concrete), ValueKind::Float)),
            Rule::variable => Ok(leaf_value(token_from_pair(&concrete), ValueKind::Variable)),
            other => unreachable!("invalid scalar {:?}", other),
        }
    }

    fn process_translation(pair: Pair<Rule>) -> Result<TagValue, ParseError> {
        let span = pair.as_span();
        let line_col = pair.line_col();
        let string_pair = pair
            .into_inner()
            .find(|inner| inner.as_rule() == Rule::string_literal)
            .expect("translation wraps a string literal");
        let text = string_pair.as_str();

        // The token is the inner payload; spans cover the whole `_("...")`.
        Ok(leaf_value(
            TagToken {
                token: text[1..text.len() - 1].to_string(),
                start_index: span.start(),
                end_index: span.end(),
                line_col,
            },
            ValueKind::Translation,
        ))
    }

    fn process_template_string(pair: Pair<Rule>) -> Result<TagValue, ParseError> {
        let span = pair.as_span();
        let line_col = pair.line_col();

        let mut children = Vec::new();
        for part in pair.into_inner() {
            if part.as_rule() != Rule::tstring_part {
                continue;
            }
            let inner = part
                .into_inner()
                .next()
                .expect("tstring_part wraps one alternative");
            match inner.as_rule() {
                Rule::tstring_lit => {
                    children.push(leaf_value(token_from_pair(&inner), ValueKind::String));
                }
                Rule::tstring_interp => {
                    let value_pair = inner
                        .into_inner()
                        .find(|pair| pair.as_rule() == Rule::filtered_value)
                        .expect("interpolation wraps a filtered_value");
                    children.push(Self::process_filtered_value(value_pair)?);
                }
                other => unreachable!("invalid template string part {:?}", other),
            }
        }

        Ok(TagValue {
            token: TagToken {
                token: "`".to_string(),
                start_index: span.start(),
                end_index: span.start() + 1,
                line_col,
            },
            children,
            kind: ValueKind::TemplateString,
            spread: None,
            filters: vec![],
            start_index: span.start(),
            end_index: span.end(),
            line_col,
        })
    }

    fn process_list(pair: Pair<Rule>) -> Result<TagValue, ParseError> {
        let span = pair.as_span();
        let line_col = pair.line_col();

        let mut children = Vec::new();
        for item in pair.into_inner() {
            if item.as_rule() != Rule::list_item {
                continue;
            }
            let inner = item
                .into_inner()
                .find(|pair| pair.as_rule() != Rule::COMMENT)
                .expect("list_item wraps one alternative");
            match inner.as_rule() {
                Rule::filtered_value => children.push(Self::process_filtered_value(inner)?),
                Rule::list_item_spread => {
                    let spread_span = inner.as_span();
                    let spread_line_col = inner.line_col();
                    let value_pair = inner
                        .into_inner()
                        .find(|pair| pair.as_rule() == Rule::filtered_value)
                        .expect("list spread wraps a filtered_value");
                    let mut value = Self::process_filtered_value(value_pair)?;
                    value.spread = Some(SpreadKind::Dots);
                    value.start_index = spread_span.start();
                    value.line_col = spread_line_col;
                    children.push(value);
                }
                other => unreachable!("invalid list item {:?}", other),
            }
        }

        Ok(TagValue {
            token: TagToken {
                token: "[".to_string(),
                start_index: span.start(),
                end_index: span.start() + 1,
                line_col,
            },
            children,
            kind: ValueKind::List,
            spread: None,
            filters: vec![],
            start_index: span.start(),
            end_index: span.end(),
            line_col,
        })
    }

    fn process_dict(pair: Pair<Rule>) -> Result<TagValue, ParseError> {
        let span = pair.as_span();
        let line_col = pair.line_col();

        let mut children = Vec::new();
        for entry in pair.into_inner() {
            if entry.as_rule() != Rule::dict_entry {
                continue;
            }
            let inner = entry
                .into_inner()
                .find(|pair| pair.as_rule() != Rule::COMMENT)
                .expect("dict_entry wraps one alternative");
            match inner.as_rule() {
                Rule::dict_entry_pair => {
                    let mut parts = inner.into_inner();
                    let key_pair = parts
                        .find(|pair| pair.as_rule() == Rule::dict_key)
                        .expect("dict_entry_pair starts with dict_key");
                    let value_pair = parts
                        .find(|pair| pair.as_rule() == Rule::filtered_value)
                        .expect("dict_entry_pair ends with filtered_value");

                    children.push(Self::process_dict_key(key_pair)?);
                    children.push(Self::process_filtered_value(value_pair)?);
                }
                Rule::dict_entry_spread => {
                    let spread_span = inner.as_span();
                    let spread_line_col = inner.line_col();
                    let value_pair = inner
                        .into_inner()
                        .find(|pair| pair.as_rule() == Rule::filtered_value)
                        .expect("dict spread wraps a filtered_value");
                    let mut value = Self::process_filtered_value(value_pair)?;
                    value.spread = Some(SpreadKind::DoubleStar);
                    value.start_index = spread_span.start();
                    value.line_col = spread_line_col;
                    children.push(value);
                }
                other => unreachable!("invalid dict entry {:?}", other),
            }
        }

        Ok(TagValue {
            token: TagToken {
                token: "{".to_string(),
                start_index: span.start(),
                end_index: span.start() + 1,
                line_col,
            },
            children,
            kind: ValueKind::Dict,
            spread: None,
            filters: vec![],
            start_index: span.start(),
            end_index: span.end(),
            line_col,
        })
    }

    // Dict keys are scalars with an optional argument-less filter chain.
    fn process_dict_key(pair: Pair<Rule>) -> Result<TagValue, ParseError> {
        let total_span = pair.as_span();
        let total_line_col = pair.line_col();
        let mut inner = pair.into_inner();

        let scalar_pair = inner
            .find(|pair| pair.as_rule() == Rule::scalar)
            .expect("dict_key starts with a scalar");
        let mut key = Self::process_scalar(scalar_pair)?;
        key.start_index = total_span.start();
        key.end_index = total_span.end();
        key.line_col = total_line_col;

        if let Some(chain) = inner.find(|pair| pair.as_rule() == Rule::filter_chain_noarg) {
            key.filters = Self::process_filter_chain(chain)?;
        }

        Ok(key)
    }

    fn process_filter_chain(chain: Pair<Rule>) -> Result<Vec<TagValueFilter>, ParseError> {
        let mut filters = Vec::new();

        for filter_pair in chain.into_inner() {
            if !matches!(filter_pair.as_rule(), Rule::filter | Rule::filter_noarg) {
                continue;
            }

            let filter_span = filter_pair.as_span();
            let filter_line_col = filter_pair.line_col();

            let mut parts = filter_pair.into_inner();
            let name_pair = parts
                .find(|pair| pair.as_rule() == Rule::filter_name)
                .expect("filter has a name");

            let mut arg = None;
            if let Some(arg_part) = parts.find(|pair| pair.as_rule() == Rule::filter_arg_part) {
                // Spans include the `:`; the token keeps the argument's own
                // position.
                let part_span = arg_part.as_span();
                let part_line_col = arg_part.line_col();
                let arg_pair = arg_part
                    .into_inner()
                    .find(|pair| pair.as_rule() == Rule::filter_arg)
                    .expect("filter_arg_part wraps a filter_arg");
                let value_pair = arg_pair
                    .into_inner()
                    .next()
                    .expect("filter_arg wraps a value");
                let mut value = Self::process_value(value_pair)?;
                value.start_index = part_span.start();
                value.end_index = part_span.end();
                value.line_col = part_line_col;
                arg = Some(value);
            }

            filters.push(TagValueFilter {
                token: token_from_pair(&name_pair),
                arg,
                start_index: filter_span.start(),
                end_index: filter_span.end(),
                line_col: filter_line_col,
            });
        }

        Ok(filters)
    }
}

fn token_from_pair(pair: &Pair<Rule>) -> TagToken {
    let span = pair.as_span();
    TagToken {
        token: pair.as_str().to_string(),
        start_index: span.start(),
        end_index: span.end(),
        line_col: pair.line_col(),
    }
}

fn leaf_value(token: TagToken, kind: ValueKind) -> TagValue {
    let start_index = token.start_index;
    let end_index = token.end_index;
    let line_col = token.line_col;
    TagValue {
        token,
        children: vec![],
        kind,
        spread: None,
        filters: vec![],
        start_index,
        end_index,
        line_col,
    }
}

/// Whether a quoted string payload embeds host template markers and should
/// be evaluated through the `template_string` resolver.
fn has_template_marker(payload: &str) -> bool {
    lazy_static::lazy_static! {
        static ref VAR_TAG: regex::Regex = regex::Regex::new(r"\{\{.*?\}\}").unwrap();
        static ref BLOCK_TAG: regex::Regex = regex::Regex::new(r"\{%.*?%\}").unwrap();
        static ref COMMENT_TAG: regex::Regex = regex::Regex::new(r"\{#.*?#\}").unwrap();
    }

    VAR_TAG.is_match(payload) || BLOCK_TAG.is_match(payload) || COMMENT_TAG.is_match(payload)
}

fn refine_parse_error(err: pest::error::Error<Rule>, input: &str) -> ParseError {
    if let Some(lex) = scan_unterminated(input) {
        return lex;
    }

    let offset = match err.location {
        InputLocation::Pos(pos) => pos,
        InputLocation::Span((start, _)) => start,
    };
    let line_col = match err.line_col {
        LineColLocation::Pos(pos) => pos,
        LineColLocation::Span(start, _) => start,
    };

    ParseError::Grammar {
        message: err.variant.message().to_string(),
        pos: SourcePos { offset, line_col },
        snippet: snippet_at(input, line_col.0),
    }
}

// Scan for an opening quote, backtick or `{#` that never closes. Runs only
// after the grammar has already rejected the input, to turn the generic
// failure into a lexical error pointing at the opening delimiter.
fn scan_unterminated(input: &str) -> Option<ParseError> {
    let mut chars = input.char_indices();
    while let Some((offset, c)) = chars.next() {
        match c {
            '\'' | '"' => {
                if !skip_quoted(&mut chars, c) {
                    return Some(lex_error("unterminated string literal", offset, input));
                }
            }
            '`' => {
                if !skip_template(&mut chars) {
                    return Some(lex_error("unterminated template string", offset, input));
                }
            }
            '{' => {
                if let Some((_, '#')) = chars.clone().next() {
                    chars.next();
                    if !skip_comment(&mut chars) {
                        return Some(lex_error("unterminated comment", offset, input));
                    }
                }
            }
            _ => {}
        }
    }
    None
}

fn skip_quoted(chars: &mut std::str::CharIndices<'_>, quote: char) -> bool {
    while let Some((_, c)) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            c if c == quote => return true,
            _ => {}
        }
    }
    false
}

fn skip_comment(chars: &mut std::str::CharIndices<'_>) -> bool {
    let mut prev = '\0';
    for (_, c) in chars.by_ref() {
        if prev == '#' && c == '}' {
            return true;
        }
        prev = c;
    }
    false
}

fn skip_template(chars: &mut std::str::CharIndices<'_>) -> bool {
    while let Some((_, c)) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '`' => return true,
            '$' => {
                if let Some((_, '{')) = chars.clone().next() {
                    chars.next();
                    if !skip_interpolation(chars) {
                        return false;
                    }
                }
            }
            _ => {}
        }
    }
    false
}

fn skip_interpolation(chars: &mut std::str::CharIndices<'_>) -> bool {
    let mut depth = 1usize;
    while let Some((_, c)) = chars.next() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return true;
                }
            }
            '\'' | '"' => {
                if !skip_quoted(chars, c) {
                    return false;
                }
            }
            '`' => {
                if !skip_template(chars) {
                    return false;
                }
            }
            _ => {}
        }
    }
    false
}

fn lex_error(message: &str, offset: usize, input: &str) -> ParseError {
    let line_col = line_col_at(input, offset);
    ParseError::Lex {
        message: message.to_string(),
        pos: SourcePos { offset, line_col },
        snippet: snippet_at(input, line_col.0),
    }
}

fn line_col_at(input: &str, offset: usize) -> (usize, usize) {
    let prefix = &input[..offset];
    let line = prefix.matches('\n').count() + 1;
    let col = match prefix.rfind('\n') {
        Some(newline) => prefix[newline + 1..].chars().count() + 1,
        None => prefix.chars().count() + 1,
    };
    (line, col)
}

fn snippet_at(input: &str, line: usize) -> Option<String> {
    input.lines().nth(line.saturating_sub(1)).map(str::to_string)
}
