//! Canonical source rendering for AST nodes.
//!
//! Reconstructs tag source text from parsed nodes: single spaces between
//! attributes, double-quoted strings, normalized translations. The compiler
//! uses this to hand interpolated expressions to the `template_string`
//! resolver and to name values in spread diagnostics; tests use it for the
//! parse -> render -> parse fixpoint.

use crate::ast::{SpreadKind, Tag, TagAttr, TagValue, ValueKind};

pub fn render_tag(tag: &Tag) -> String {
    let mut out = tag.name.token.clone();
    let attrs = render_attrs(&tag.attrs);
    if !attrs.is_empty() {
        out.push(' ');
        out.push_str(&attrs);
    }
    if tag.is_self_closing {
        out.push_str(" /");
    }
    out
}

pub fn render_attrs(attrs: &[TagAttr]) -> String {
    attrs
        .iter()
        .map(render_attr)
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn render_attr(attr: &TagAttr) -> String {
    match &attr.key {
        Some(key) => format!("{}={}", key.token, render_value(&attr.value)),
        None => render_value(&attr.value),
    }
}

/// Render a value including its spread marker and filters.
pub fn render_value(value: &TagValue) -> String {
    match value.spread {
        Some(kind) => format!("{}{}", kind.as_marker(), render_value_bare(value)),
        None => render_value_bare(value),
    }
}

/// Render a value without its spread marker (filters included).
pub fn render_value_bare(value: &TagValue) -> String {
    let mut out = match value.kind {
        ValueKind::Int | ValueKind::Float | ValueKind::Variable => value.token.token.clone(),
        ValueKind::String => quote_string(&value.token.token),
        ValueKind::Translation => format!("_({})", quote_string(&value.token.token)),
        ValueKind::TemplateString => {
            if value.children.is_empty() && value.token.token != "`" {
                // Quoted string carrying host template markers.
                quote_string(&value.token.token)
            } else {
                render_template_string(value)
            }
        }
        ValueKind::List => {
            let items = value
                .children
                .iter()
                .map(render_value)
                .collect::<Vec<_>>()
                .join(", ");
            format!("[{}]", items)
        }
        ValueKind::Dict => render_dict(value),
    };

    for filter in &value.filters {
        out.push('|');
        out.push_str(&filter.token.token);
        if let Some(arg) = &filter.arg {
            out.push(':');
            out.push_str(&render_value_bare(arg));
        }
    }

    out
}

fn render_dict(value: &TagValue) -> String {
    let mut parts = Vec::new();
    let mut children = value.children.iter();
    while let Some(child) = children.next() {
        if child.spread == Some(SpreadKind::DoubleStar) {
            parts.push(format!("**{}", render_value_bare(child)));
        } else {
            match children.next() {
                Some(val) => parts.push(format!(
                    "{}: {}",
                    render_value_bare(child),
                    render_value_bare(val)
                )),
                // Dangling key; the compiler rejects this shape, render it
                // bare so diagnostics still have something to show.
                None => parts.push(render_value_bare(child)),
            }
        }
    }
    format!("{{{}}}", parts.join(", "))
}

fn render_template_string(value: &TagValue) -> String {
    let mut out = String::from("`");
    for child in &value.children {
        if child.kind == ValueKind::String && child.filters.is_empty() {
            out.push_str(&escape_tstring_segment(&decode_escapes(&child.token.token)));
        } else {
            out.push_str("${");
            out.push_str(&render_value_bare(child));
            out.push('}');
        }
    }
    out.push('`');
    out
}

fn quote_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('"');
    for c in decode_escapes(raw).chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

fn escape_tstring_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '`' => out.push_str("\\`"),
            '$' => out.push_str("\\$"),
            other => out.push(other),
        }
    }
    out
}

/// Decode the backslash escapes recognized in string literals and template
/// string segments. Unknown escapes pass through verbatim.
pub(crate) fn decode_escapes(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(c @ ('\\' | '\'' | '"' | '`' | '$')) => out.push(c),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
