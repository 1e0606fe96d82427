//! # Template tag compiler
//!
//! Lowers a parsed [`Tag`] (or a bare attribute list) into a [`CompiledTag`]:
//! an evaluation plan that, invoked with a context and a [`Resolver`],
//! produces the positional and keyword arguments for the tag handler.
//!
//! ## Behavior
//!
//! - **Argument ordering**: attributes are processed in source order;
//!   positional values append to `args`, keyword values and flags append to
//!   `kwargs` as `(name, value)` pairs. Duplicate keyword names are kept;
//!   deduplication is the host's concern.
//! - **Spread operators**: `...value` and `*value` expand an iterable into
//!   `args`; `**value` expands a mapping into `kwargs`; `...` inside lists
//!   and `**` inside dicts expand in place, `**` merges overwriting earlier
//!   keys in place.
//! - **Constant folding**: numbers and strings are decoded once at compile
//!   time; a call only runs resolver callbacks and container construction.
//! - **Filters**: chains apply left to right through the `filter` resolver.
//!
//! ## Error handling
//!
//! Structural AST violations (dangling dict keys, misplaced spreads,
//! malformed flags, unparseable numbers) are [`CompileError`]s raised while
//! lowering. Spreading a non-iterable or non-mapping at call time is an
//! [`EvalError`]; errors from resolver callbacks propagate unchanged.

use crate::ast::{SpreadKind, Tag, TagAttr, TagValue, ValueKind};
use crate::error::{CompileError, EvalError};
use crate::render;
use crate::value::Value;

/// The typed capability set handed to a compiled tag at call time. One
/// implementation per host; the compiled plan never evaluates variables,
/// translations, template expressions or filters itself.
pub trait Resolver {
    type Context;
    type Error: std::error::Error;

    /// Resolve a variable reference, given the source text of its dotted
    /// path (subscripts included), e.g. `user.profile["id"]`.
    fn variable(&self, ctx: &Self::Context, path: &str) -> Result<Value, Self::Error>;

    /// Evaluate a template-string interpolation, given the source text of
    /// the embedded expression.
    fn template_string(&self, ctx: &Self::Context, expr: &str) -> Result<Value, Self::Error>;

    /// Translate a literal string.
    fn translation(&self, ctx: &Self::Context, text: &str) -> Result<Value, Self::Error>;

    /// Apply a named filter. `arg` is `None` for `value|filter` without an
    /// argument.
    fn filter(
        &self,
        ctx: &Self::Context,
        name: &str,
        value: Value,
        arg: Option<Value>,
    ) -> Result<Value, Self::Error>;
}

/// Evaluation plan produced by [`compile_tag`] / [`compile_attrs`]. Holds
/// only immutable lowered data; a single plan may be called concurrently
/// from multiple threads.
#[derive(Debug, Clone)]
pub struct CompiledTag {
    steps: Vec<Step>,
}

#[derive(Debug, Clone)]
enum Step {
    Arg(Expr),
    ArgSpread { expr: Expr, source: String },
    Kwarg { name: String, expr: Expr },
    KwargSpread { expr: Expr, source: String },
    Flag(String),
}

#[derive(Debug, Clone)]
struct Expr {
    op: Op,
    filters: Vec<FilterCall>,
}

#[derive(Debug, Clone)]
enum Op {
    Const(Value),
    Variable(String),
    Translation(String),
    /// Quoted string carrying host template markers; the whole payload goes
    /// through the `template_string` resolver.
    TemplateLookup(String),
    /// Backtick template string: literal segments and interpolation sources
    /// concatenate into a string.
    TemplateConcat(Vec<Segment>),
    List(Vec<ListItem>),
    Dict(Vec<DictEntry>),
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Expr(String),
}

#[derive(Debug, Clone)]
enum ListItem {
    Plain(Expr),
    Spread { expr: Expr, source: String },
}

#[derive(Debug, Clone)]
enum DictEntry {
    Pair { key: Expr, value: Expr },
    Spread { expr: Expr, source: String },
}

#[derive(Debug, Clone)]
struct FilterCall {
    name: String,
    arg: Option<Expr>,
}

/// Compile a parsed tag into an evaluation plan.
pub fn compile_tag(tag: &Tag) -> Result<CompiledTag, CompileError> {
    compile_attrs(&tag.attrs)
}

/// Compile a bare attribute list into an evaluation plan.
pub fn compile_attrs(attrs: &[TagAttr]) -> Result<CompiledTag, CompileError> {
    let mut steps = Vec::with_capacity(attrs.len());

    for attr in attrs {
        if attr.is_flag {
            if attr.key.is_some()
                || attr.value.kind != ValueKind::Variable
                || attr.value.spread.is_some()
                || !attr.value.filters.is_empty()
            {
                return Err(CompileError::MalformedFlag {
                    line_col: attr.line_col,
                });
            }
            steps.push(Step::Flag(attr.value.token.token.clone()));
            continue;
        }

        if let Some(key) = &attr.key {
            if let Some(spread) = attr.value.spread {
                return Err(CompileError::SpreadNotAllowed {
                    marker: spread.as_marker(),
                    position: "a keyword value",
                    line_col: attr.value.line_col,
                });
            }
            steps.push(Step::Kwarg {
                name: key.token.clone(),
                expr: compile_value(&attr.value)?,
            });
            continue;
        }

        match attr.value.spread {
            Some(SpreadKind::DoubleStar) => steps.push(Step::KwargSpread {
                expr: compile_value(&attr.value)?,
                source: render::render_value_bare(&attr.value),
            }),
            Some(_) => steps.push(Step::ArgSpread {
                expr: compile_value(&attr.value)?,
                source: render::render_value_bare(&attr.value),
            }),
            None => steps.push(Step::Arg(compile_value(&attr.value)?)),
        }
    }

    Ok(CompiledTag { steps })
}

impl CompiledTag {
    /// Evaluate the plan against a context. Returns the positional arguments
    /// and the ordered keyword pairs.
    #[allow(clippy::type_complexity)]
    pub fn call<R: Resolver>(
        &self,
        ctx: &R::Context,
        resolvers: &R,
    ) -> Result<(Vec<Value>, Vec<(String, Value)>), EvalError<R::Error>> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();

        for step in &self.steps {
            match step {
                Step::Arg(expr) => args.push(eval_expr(expr, ctx, resolvers)?),
                Step::ArgSpread { expr, source } => {
                    let value = eval_expr(expr, ctx, resolvers)?;
                    let elements =
                        value
                            .into_spread_elements()
                            .ok_or_else(|| EvalError::NotIterable {
                                name: source.clone(),
                            })?;
                    args.extend(elements);
                }
                Step::Kwarg { name, expr } => {
                    kwargs.push((name.clone(), eval_expr(expr, ctx, resolvers)?));
                }
                Step::KwargSpread { expr, source } => {
                    let value = eval_expr(expr, ctx, resolvers)?;
                    let entries =
                        value
                            .into_mapping_entries()
                            .ok_or_else(|| EvalError::NotMapping {
                                name: source.clone(),
                            })?;
                    for (key, value) in entries {
                        kwargs.push((key.to_text(), value));
                    }
                }
                Step::Flag(name) => kwargs.push((name.clone(), Value::Bool(true))),
            }
        }

        Ok((args, kwargs))
    }
}

fn compile_value(value: &TagValue) -> Result<Expr, CompileError> {
    let op = match value.kind {
        ValueKind::Int => {
            let parsed = value.token.token.parse::<i64>().map_err(|_| {
                CompileError::InvalidNumber {
                    token: value.token.token.clone(),
                    line_col: value.token.line_col,
                }
            })?;
            Op::Const(Value::Int(parsed))
        }
        ValueKind::Float => {
            let parsed = value.token.token.parse::<f64>().map_err(|_| {
                CompileError::InvalidNumber {
                    token: value.token.token.clone(),
                    line_col: value.token.line_col,
                }
            })?;
            Op::Const(Value::Float(parsed))
        }
        ValueKind::String => Op::Const(Value::String(render::decode_escapes(&value.token.token))),
        ValueKind::Variable => Op::Variable(value.token.token.clone()),
        ValueKind::Translation => Op::Translation(render::decode_escapes(&value.token.token)),
        ValueKind::TemplateString => compile_template_string(value)?,
        ValueKind::List => {
            let mut items = Vec::with_capacity(value.children.len());
            for child in &value.children {
                match child.spread {
                    Some(SpreadKind::Dots) => items.push(ListItem::Spread {
                        expr: compile_value(child)?,
                        source: render::render_value_bare(child),
                    }),
                    Some(other) => {
                        return Err(CompileError::SpreadNotAllowed {
                            marker: other.as_marker(),
                            position: "a list element",
                            line_col: child.line_col,
                        })
                    }
                    None => items.push(ListItem::Plain(compile_value(child)?)),
                }
            }
            Op::List(items)
        }
        ValueKind::Dict => {
            let mut entries = Vec::new();
            let mut children = value.children.iter();
            while let Some(child) = children.next() {
                match child.spread {
                    Some(SpreadKind::DoubleStar) => entries.push(DictEntry::Spread {
                        expr: compile_value(child)?,
                        source: render::render_value_bare(child),
                    }),
                    Some(other) => {
                        return Err(CompileError::SpreadNotAllowed {
                            marker: other.as_marker(),
                            position: "a dict entry",
                            line_col: child.line_col,
                        })
                    }
                    None => {
                        if matches!(child.kind, ValueKind::List | ValueKind::Dict) {
                            return Err(CompileError::ContainerDictKey {
                                line_col: child.line_col,
                            });
                        }
                        let val = children.next().ok_or(CompileError::DanglingDictKey {
                            line_col: child.line_col,
                        })?;
                        if let Some(spread) = val.spread {
                            return Err(CompileError::SpreadNotAllowed {
                                marker: spread.as_marker(),
                                position: "a dict value",
                                line_col: val.line_col,
                            });
                        }
                        entries.push(DictEntry::Pair {
                            key: compile_value(child)?,
                            value: compile_value(val)?,
                        });
                    }
                }
            }
            Op::Dict(entries)
        }
    };

    let mut filters = Vec::with_capacity(value.filters.len());
    for filter in &value.filters {
        let arg = match &filter.arg {
            Some(arg) => {
                if let Some(spread) = arg.spread {
                    return Err(CompileError::SpreadNotAllowed {
                        marker: spread.as_marker(),
                        position: "a filter argument",
                        line_col: arg.line_col,
                    });
                }
                Some(compile_value(arg)?)
            }
            None => None,
        };
        filters.push(FilterCall {
            name: filter.token.token.clone(),
            arg,
        });
    }

    Ok(Expr { op, filters })
}

fn compile_template_string(value: &TagValue) -> Result<Op, CompileError> {
    if value.children.is_empty() {
        // A bare backtick pair is the empty string; a childless node with a
        // payload is a quoted string carrying host template markers.
        if value.token.token == "`" {
            return Ok(Op::Const(Value::String(String::new())));
        }
        return Ok(Op::TemplateLookup(render::decode_escapes(
            &value.token.token,
        )));
    }

    let mut segments = Vec::with_capacity(value.children.len());
    for child in &value.children {
        if let Some(spread) = child.spread {
            return Err(CompileError::SpreadNotAllowed {
                marker: spread.as_marker(),
                position: "a template string interpolation",
                line_col: child.line_col,
            });
        }
        if child.kind == ValueKind::String && child.filters.is_empty() {
            segments.push(Segment::Literal(render::decode_escapes(&child.token.token)));
        } else {
            segments.push(Segment::Expr(render::render_value_bare(child)));
        }
    }
    Ok(Op::TemplateConcat(segments))
}

fn eval_expr<R: Resolver>(
    expr: &Expr,
    ctx: &R::Context,
    resolvers: &R,
) -> Result<Value, EvalError<R::Error>> {
    let mut acc = eval_op(&expr.op, ctx, resolvers)?;
    for filter in &expr.filters {
        let arg = match &filter.arg {
            Some(arg) => Some(eval_expr(arg, ctx, resolvers)?),
            None => None,
        };
        acc = resolvers
            .filter(ctx, &filter.name, acc, arg)
            .map_err(EvalError::Resolver)?;
    }
    Ok(acc)
}

fn eval_op<R: Resolver>(
    op: &Op,
    ctx: &R::Context,
    resolvers: &R,
) -> Result<Value, EvalError<R::Error>> {
    match op {
        Op::Const(value) => Ok(value.clone()),
        Op::Variable(path) => resolvers.variable(ctx, path).map_err(EvalError::Resolver),
        Op::Translation(text) => resolvers.translation(ctx, text).map_err(EvalError::Resolver),
        Op::TemplateLookup(source) => resolvers
            .template_string(ctx, source)
            .map_err(EvalError::Resolver),
        Op::TemplateConcat(segments) => {
            let mut out = String::new();
            for segment in segments {
                match segment {
                    Segment::Literal(text) => out.push_str(text),
                    Segment::Expr(source) => {
                        let value = resolvers
                            .template_string(ctx, source)
                            .map_err(EvalError::Resolver)?;
                        out.push_str(&value.to_text());
                    }
                }
            }
            Ok(Value::String(out))
        }
        Op::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    ListItem::Plain(expr) => out.push(eval_expr(expr, ctx, resolvers)?),
                    ListItem::Spread { expr, source } => {
                        let value = eval_expr(expr, ctx, resolvers)?;
                        let elements =
                            value
                                .into_spread_elements()
                                .ok_or_else(|| EvalError::NotIterable {
                                    name: source.clone(),
                                })?;
                        out.extend(elements);
                    }
                }
            }
            Ok(Value::List(out))
        }
        Op::Dict(items) => {
            let mut entries: Vec<(Value, Value)> = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    DictEntry::Pair { key, value } => {
                        let key = eval_expr(key, ctx, resolvers)?;
                        let value = eval_expr(value, ctx, resolvers)?;
                        Value::dict_insert(&mut entries, key, value);
                    }
                    DictEntry::Spread { expr, source } => {
                        let value = eval_expr(expr, ctx, resolvers)?;
                        let merged =
                            value
                                .into_mapping_entries()
                                .ok_or_else(|| EvalError::NotMapping {
                                    name: source.clone(),
                                })?;
                        for (key, value) in merged {
                            Value::dict_insert(&mut entries, key, value);
                        }
                    }
                }
            }
            Ok(Value::Dict(entries))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{TagToken, TagValueFilter};
    use crate::tag_parser::TagParser;
    use std::collections::{HashMap, HashSet};
    use std::convert::Infallible;
    use std::fmt;

    type Context = HashMap<String, Value>;

    // Resolver that mirrors the host-side mocks used against this crate:
    // variables come from the context map, template strings and translations
    // are tagged, filters format themselves unless they have a concrete
    // meaning for the test.
    struct TestResolver;

    impl Resolver for TestResolver {
        type Context = Context;
        type Error = Infallible;

        fn variable(&self, ctx: &Context, path: &str) -> Result<Value, Infallible> {
            Ok(ctx.get(path).cloned().unwrap_or(Value::None))
        }

        fn template_string(&self, _ctx: &Context, expr: &str) -> Result<Value, Infallible> {
            Ok(Value::String(format!("TEMPLATE_RESOLVED:{}", expr)))
        }

        fn translation(&self, _ctx: &Context, text: &str) -> Result<Value, Infallible> {
            Ok(Value::String(format!("TRANSLATION_RESOLVED:{}", text)))
        }

        fn filter(
            &self,
            _ctx: &Context,
            name: &str,
            value: Value,
            arg: Option<Value>,
        ) -> Result<Value, Infallible> {
            if name == "add" {
                if let (Value::Int(a), Some(Value::Int(b))) = (&value, &arg) {
                    return Ok(Value::Int(a + b));
                }
            }
            if name == "dict_filter" {
                return Ok(Value::Dict(vec![
                    (Value::from("a"), Value::Int(1)),
                    (Value::from("b"), Value::Int(2)),
                ]));
            }
            let arg_text = arg
                .map(|a| a.to_text())
                .unwrap_or_else(|| "None".to_string());
            Ok(Value::String(format!(
                "{}({}, {})",
                name,
                value.to_text(),
                arg_text
            )))
        }
    }

    fn ctx(entries: &[(&str, Value)]) -> Context {
        entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    fn run(input: &str, context: Context) -> (Vec<Value>, Vec<(String, Value)>) {
        run_with_flags(input, &[], context)
    }

    fn run_with_flags(
        input: &str,
        flags: &[&str],
        context: Context,
    ) -> (Vec<Value>, Vec<(String, Value)>) {
        let flags: HashSet<String> = flags.iter().map(|f| f.to_string()).collect();
        let tag = TagParser::parse_tag(input, &flags).unwrap();
        let compiled = compile_tag(&tag).unwrap();
        compiled.call(&context, &TestResolver).unwrap()
    }

    fn kw(name: &str, value: Value) -> (String, Value) {
        (name.to_string(), value)
    }

    // Hand-built AST helpers for shapes the parser cannot produce.

    fn token(text: &str) -> TagToken {
        TagToken {
            token: text.to_string(),
            start_index: 0,
            end_index: text.len(),
            line_col: (1, 1),
        }
    }

    fn value_of(text: &str, kind: ValueKind) -> TagValue {
        TagValue {
            token: token(text),
            children: vec![],
            kind,
            spread: None,
            filters: vec![],
            start_index: 0,
            end_index: text.len(),
            line_col: (1, 1),
        }
    }

    fn arg_attr(value: TagValue) -> TagAttr {
        TagAttr {
            key: None,
            value,
            is_flag: false,
            start_index: 0,
            end_index: 0,
            line_col: (1, 1),
        }
    }

    fn kwarg_attr(key: &str, value: TagValue) -> TagAttr {
        TagAttr {
            key: Some(token(key)),
            value,
            is_flag: false,
            start_index: 0,
            end_index: 0,
            line_col: (1, 1),
        }
    }

    // ###########################################
    // BASIC OUTPUT SHAPE
    // ###########################################

    #[test]
    fn test_no_attributes() {
        let (args, kwargs) = run("my_tag", ctx(&[]));
        assert_eq!(args, vec![]);
        assert_eq!(kwargs, vec![]);
    }

    #[test]
    fn test_self_closing_has_no_effect_on_output() {
        let (args, kwargs) = run("my_tag /", ctx(&[]));
        assert_eq!(args, vec![]);
        assert_eq!(kwargs, vec![]);
    }

    #[test]
    fn test_constants_and_variables() {
        let (args, kwargs) = run(
            "t 'a string' var_one 42 001 -1.5 k=v",
            ctx(&[("var_one", Value::from("resolved")), ("v", Value::Int(7))]),
        );
        assert_eq!(
            args,
            vec![
                Value::from("a string"),
                Value::from("resolved"),
                Value::Int(42),
                Value::Int(1),
                Value::Float(-1.5),
            ]
        );
        assert_eq!(kwargs, vec![kw("k", Value::Int(7))]);
    }

    #[test]
    fn test_variable_path_passed_verbatim() {
        struct PathChecker;
        impl Resolver for PathChecker {
            type Context = ();
            type Error = Infallible;
            fn variable(&self, _: &(), path: &str) -> Result<Value, Infallible> {
                Ok(Value::String(format!("path:{}", path)))
            }
            fn template_string(&self, _: &(), _: &str) -> Result<Value, Infallible> {
                Ok(Value::None)
            }
            fn translation(&self, _: &(), _: &str) -> Result<Value, Infallible> {
                Ok(Value::None)
            }
            fn filter(
                &self,
                _: &(),
                _: &str,
                value: Value,
                _: Option<Value>,
            ) -> Result<Value, Infallible> {
                Ok(value)
            }
        }

        let tag = TagParser::parse_tag("t user.profile['id']", &HashSet::new()).unwrap();
        let (args, _) = compile_tag(&tag).unwrap().call(&(), &PathChecker).unwrap();
        assert_eq!(args, vec![Value::from("path:user.profile['id']")]);
    }

    #[test]
    fn test_string_escapes_decoded_at_compile_time() {
        let (args, _) = run(r#"t 'it\'s' "a\nb""#, ctx(&[]));
        assert_eq!(args, vec![Value::from("it's"), Value::from("a\nb")]);
    }

    #[test]
    fn test_positional_after_keyword_is_allowed() {
        let (args, kwargs) = run("t a=1 2", ctx(&[]));
        assert_eq!(args, vec![Value::Int(2)]);
        assert_eq!(kwargs, vec![kw("a", Value::Int(1))]);
    }

    #[test]
    fn test_duplicate_kwargs_are_kept() {
        let (_, kwargs) = run("t key=1 key=2", ctx(&[]));
        assert_eq!(kwargs, vec![kw("key", Value::Int(1)), kw("key", Value::Int(2))]);
    }

    // ###########################################
    // FLAGS
    // ###########################################

    #[test]
    fn test_flag_compiles_to_true_kwarg() {
        let (args, kwargs) = run_with_flags("my_tag key='value' my_flag", &["my_flag"], ctx(&[]));
        assert_eq!(args, vec![]);
        assert_eq!(
            kwargs,
            vec![kw("key", Value::from("value")), kw("my_flag", Value::Bool(true))]
        );
    }

    #[test]
    fn test_unflagged_identifier_stays_positional() {
        let (args, kwargs) = run(
            "my_tag my_flag",
            ctx(&[("my_flag", Value::from("x"))]),
        );
        assert_eq!(args, vec![Value::from("x")]);
        assert_eq!(kwargs, vec![]);
    }

    // ###########################################
    // FILTERS
    // ###########################################

    #[test]
    fn test_filter_with_arg() {
        let (_, kwargs) = run("t x=1|add:2", ctx(&[]));
        assert_eq!(kwargs, vec![kw("x", Value::Int(3))]);
    }

    #[test]
    fn test_filter_chain_applies_left_to_right() {
        let (args, _) = run(
            "t val|upper|default:\"x\"",
            ctx(&[("val", Value::from("HELLO"))]),
        );
        assert_eq!(args, vec![Value::from("default(upper(HELLO, None), x)")]);
    }

    #[test]
    fn test_filter_without_arg_gets_none() {
        let (args, _) = run("t val|lower", ctx(&[("val", Value::from("HI"))]));
        assert_eq!(args, vec![Value::from("lower(HI, None)")]);
    }

    #[test]
    fn test_filter_arg_container() {
        let (args, _) = run("t v|join:[1, 2]", ctx(&[("v", Value::from("x"))]));
        assert_eq!(args, vec![Value::from("join(x, [1, 2])")]);
    }

    // ###########################################
    // TRANSLATION AND TEMPLATE STRINGS
    // ###########################################

    #[test]
    fn test_translation_goes_through_resolver() {
        let (args, kwargs) = run("t _(\"hello\") name=\"world\"", ctx(&[]));
        assert_eq!(args, vec![Value::from("TRANSLATION_RESOLVED:hello")]);
        assert_eq!(kwargs, vec![kw("name", Value::from("world"))]);
    }

    #[test]
    fn test_marker_string_goes_through_template_resolver() {
        let (_, kwargs) = run("t key=\"{{ an_expression }}\"", ctx(&[]));
        assert_eq!(
            kwargs,
            vec![kw("key", Value::from("TEMPLATE_RESOLVED:{{ an_expression }}"))]
        );
    }

    #[test]
    fn test_template_concat() {
        let (args, _) = run("t `a${x}b`", ctx(&[]));
        assert_eq!(args, vec![Value::from("aTEMPLATE_RESOLVED:xb")]);
    }

    #[test]
    fn test_template_concat_passes_rendered_expression_source() {
        let (args, _) = run("t `v=${x.y|upper}`", ctx(&[]));
        assert_eq!(args, vec![Value::from("v=TEMPLATE_RESOLVED:x.y|upper")]);
    }

    #[test]
    fn test_template_concat_stringifies_resolved_values() {
        struct NumberResolver;
        impl Resolver for NumberResolver {
            type Context = ();
            type Error = Infallible;
            fn variable(&self, _: &(), _: &str) -> Result<Value, Infallible> {
                Ok(Value::None)
            }
            fn template_string(&self, _: &(), _: &str) -> Result<Value, Infallible> {
                Ok(Value::Int(5))
            }
            fn translation(&self, _: &(), _: &str) -> Result<Value, Infallible> {
                Ok(Value::None)
            }
            fn filter(
                &self,
                _: &(),
                _: &str,
                value: Value,
                _: Option<Value>,
            ) -> Result<Value, Infallible> {
                Ok(value)
            }
        }

        let tag = TagParser::parse_tag("t `n=${x}`", &HashSet::new()).unwrap();
        let (args, _) = compile_tag(&tag).unwrap().call(&(), &NumberResolver).unwrap();
        assert_eq!(args, vec![Value::from("n=5")]);
    }

    #[test]
    fn test_translation_inside_template_concat() {
        let (args, _) = run("t `x${_(\"hi\")}`", ctx(&[]));
        assert_eq!(args, vec![Value::from("xTEMPLATE_RESOLVED:_(\"hi\")")]);
    }

    #[test]
    fn test_empty_template_string_is_empty_constant() {
        let (args, _) = run("t ``", ctx(&[]));
        assert_eq!(args, vec![Value::from("")]);
    }

    // ###########################################
    // LISTS AND DICTS
    // ###########################################

    #[test]
    fn test_list_literal() {
        let (args, _) = run("t [1, x, 'y']", ctx(&[("x", Value::Int(2))]));
        assert_eq!(
            args,
            vec![Value::List(vec![
                Value::Int(1),
                Value::Int(2),
                Value::from("y"),
            ])]
        );
    }

    #[test]
    fn test_list_spread_inlines_elements() {
        let (args, _) = run(
            "t [1, ...rest, 4]",
            ctx(&[("rest", Value::List(vec![Value::Int(2), Value::Int(3)]))]),
        );
        assert_eq!(
            args,
            vec![Value::List(vec![
                Value::Int(1),
                Value::Int(2),
                Value::Int(3),
                Value::Int(4),
            ])]
        );
    }

    #[test]
    fn test_list_spread_of_non_iterable_errors() {
        let tag = TagParser::parse_tag("t [1, ...num]", &HashSet::new()).unwrap();
        let compiled = compile_tag(&tag).unwrap();
        let err = compiled
            .call(&ctx(&[("num", Value::Int(5))]), &TestResolver)
            .unwrap_err();
        assert_eq!(
            err,
            EvalError::NotIterable {
                name: "num".to_string()
            }
        );
    }

    #[test]
    fn test_dict_literal_and_merge() {
        let (_, kwargs) = run(
            "t d={'a': 1, **extra, 'z': 9}",
            ctx(&[(
                "extra",
                Value::Dict(vec![
                    (Value::from("a"), Value::Int(7)),
                    (Value::from("b"), Value::Int(2)),
                ]),
            )]),
        );
        assert_eq!(
            kwargs,
            vec![kw(
                "d",
                Value::Dict(vec![
                    (Value::from("a"), Value::Int(7)),
                    (Value::from("b"), Value::Int(2)),
                    (Value::from("z"), Value::Int(9)),
                ])
            )]
        );
    }

    #[test]
    fn test_dict_duplicate_literal_keys_overwrite_in_place() {
        let (_, kwargs) = run("t d={'a': 1, 'b': 2, 'a': 3}", ctx(&[]));
        assert_eq!(
            kwargs,
            vec![kw(
                "d",
                Value::Dict(vec![
                    (Value::from("a"), Value::Int(3)),
                    (Value::from("b"), Value::Int(2)),
                ])
            )]
        );
    }

    #[test]
    fn test_dict_typed_keys() {
        let (_, kwargs) = run("t d={1: 'one', 1.5: 'mid'}", ctx(&[]));
        assert_eq!(
            kwargs,
            vec![kw(
                "d",
                Value::Dict(vec![
                    (Value::Int(1), Value::from("one")),
                    (Value::Float(1.5), Value::from("mid")),
                ])
            )]
        );
    }

    #[test]
    fn test_dict_spread_of_non_mapping_errors() {
        let tag = TagParser::parse_tag("t d={'a': 1, **items}", &HashSet::new()).unwrap();
        let compiled = compile_tag(&tag).unwrap();
        let err = compiled
            .call(
                &ctx(&[("items", Value::List(vec![Value::Int(1)]))]),
                &TestResolver,
            )
            .unwrap_err();
        assert_eq!(
            err,
            EvalError::NotMapping {
                name: "items".to_string()
            }
        );
    }

    // ###########################################
    // TOP-LEVEL SPREADS
    // ###########################################

    #[test]
    fn test_spread_literal_list_then_positional() {
        let (args, kwargs) = run(
            "my_tag ...[1, 2, 3] positional_arg",
            ctx(&[("positional_arg", Value::Int(4))]),
        );
        assert_eq!(
            args,
            vec![Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4)]
        );
        assert_eq!(kwargs, vec![]);
    }

    #[test]
    fn test_star_spread_is_iterable_synonym() {
        let (args, _) = run(
            "t *items",
            ctx(&[("items", Value::List(vec![Value::Int(1), Value::Int(2)]))]),
        );
        assert_eq!(args, vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn test_spread_of_dict_yields_keys() {
        let (args, _) = run(
            "t ...d",
            ctx(&[(
                "d",
                Value::Dict(vec![
                    (Value::Int(6), Value::Int(7)),
                    (Value::Int(8), Value::Int(9)),
                ]),
            )]),
        );
        assert_eq!(args, vec![Value::Int(6), Value::Int(8)]);
    }

    #[test]
    fn test_spread_of_string_yields_chars() {
        let (args, _) = run("t ...s", ctx(&[("s", Value::from("ab"))]));
        assert_eq!(args, vec![Value::from("a"), Value::from("b")]);
    }

    #[test]
    fn test_spread_of_non_iterable_errors() {
        let tag = TagParser::parse_tag("t ...num", &HashSet::new()).unwrap();
        let compiled = compile_tag(&tag).unwrap();
        let err = compiled
            .call(&ctx(&[("num", Value::Int(5))]), &TestResolver)
            .unwrap_err();
        assert_eq!(
            err,
            EvalError::NotIterable {
                name: "num".to_string()
            }
        );
    }

    #[test]
    fn test_double_star_spread_into_kwargs() {
        let (args, kwargs) = run(
            "t **cfg x=1",
            ctx(&[(
                "cfg",
                Value::Dict(vec![
                    (Value::from("a"), Value::Int(1)),
                    (Value::from("b"), Value::Int(2)),
                ]),
            )]),
        );
        assert_eq!(args, vec![]);
        assert_eq!(
            kwargs,
            vec![
                kw("a", Value::Int(1)),
                kw("b", Value::Int(2)),
                kw("x", Value::Int(1)),
            ]
        );
    }

    #[test]
    fn test_double_star_converts_keys_to_text() {
        let (_, kwargs) = run(
            "t **cfg",
            ctx(&[(
                "cfg",
                Value::Dict(vec![(Value::Int(6), Value::Int(7))]),
            )]),
        );
        assert_eq!(kwargs, vec![kw("6", Value::Int(7))]);
    }

    #[test]
    fn test_double_star_of_non_mapping_errors() {
        let tag = TagParser::parse_tag("t **items", &HashSet::new()).unwrap();
        let compiled = compile_tag(&tag).unwrap();
        let err = compiled
            .call(
                &ctx(&[("items", Value::List(vec![Value::Int(1)]))]),
                &TestResolver,
            )
            .unwrap_err();
        assert_eq!(
            err,
            EvalError::NotMapping {
                name: "items".to_string()
            }
        );
    }

    #[test]
    fn test_spread_order_preserved_around_kwargs() {
        let (args, kwargs) = run(
            "t key1='value1' **options key2='value2'",
            ctx(&[(
                "options",
                Value::Dict(vec![(Value::from("mid"), Value::Int(0))]),
            )]),
        );
        assert_eq!(args, vec![]);
        assert_eq!(
            kwargs,
            vec![
                kw("key1", Value::from("value1")),
                kw("mid", Value::Int(0)),
                kw("key2", Value::from("value2")),
            ]
        );
    }

    #[test]
    fn test_spread_value_filters_apply_before_expansion() {
        let (_, kwargs) = run("t **spread_var|dict_filter", ctx(&[]));
        assert_eq!(kwargs, vec![kw("a", Value::Int(1)), kw("b", Value::Int(2))]);
    }

    // ###########################################
    // END-TO-END
    // ###########################################

    #[test]
    fn test_full_compilation_flow() {
        let input = "my_tag \"a string\" var_one 123 \
                     key_one=\"a value\" \
                     key_two=var_two \
                     key_three=_(\"a translation\") \
                     key_four=\"{{ an_expression }}\" \
                     **spread_var|dict_filter \
                     key_five=my_val|other_filter:\"my_arg\" \
                     key_five=123";
        let context = ctx(&[
            ("var_one", Value::from("resolved_var_one")),
            ("var_two", Value::from("resolved_var_two")),
            ("my_val", Value::from("original_value")),
        ]);

        let (args, kwargs) = run(input, context);

        assert_eq!(
            args,
            vec![
                Value::from("a string"),
                Value::from("resolved_var_one"),
                Value::Int(123),
            ]
        );
        assert_eq!(
            kwargs,
            vec![
                kw("key_one", Value::from("a value")),
                kw("key_two", Value::from("resolved_var_two")),
                kw("key_three", Value::from("TRANSLATION_RESOLVED:a translation")),
                kw(
                    "key_four",
                    Value::from("TEMPLATE_RESOLVED:{{ an_expression }}")
                ),
                kw("a", Value::Int(1)),
                kw("b", Value::Int(2)),
                kw("key_five", Value::from("other_filter(original_value, my_arg)")),
                kw("key_five", Value::Int(123)),
            ]
        );
    }

    #[test]
    fn test_mixed_spread_kwarg_positional_flow() {
        let (args, kwargs) = run(
            "my_tag ...val1 a=b [1, 2, 3] data={\"key\": \"value\"} /",
            ctx(&[
                ("val1", Value::List(vec![Value::from("x"), Value::from("y")])),
                ("b", Value::from("bar")),
            ]),
        );
        assert_eq!(
            args,
            vec![
                Value::from("x"),
                Value::from("y"),
                Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
            ]
        );
        assert_eq!(
            kwargs,
            vec![
                kw("a", Value::from("bar")),
                kw(
                    "data",
                    Value::Dict(vec![(Value::from("key"), Value::from("value"))])
                ),
            ]
        );
    }

    #[test]
    fn test_repeat_calls_give_equal_results() {
        let tag = TagParser::parse_tag("t [1, ...rest] k=_('x')", &HashSet::new()).unwrap();
        let compiled = compile_tag(&tag).unwrap();
        let context = ctx(&[("rest", Value::List(vec![Value::Int(2)]))]);
        let first = compiled.call(&context, &TestResolver).unwrap();
        let second = compiled.call(&context, &TestResolver).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_resolver_errors_propagate_unchanged() {
        #[derive(Debug, PartialEq)]
        struct BoomError(String);
        impl fmt::Display for BoomError {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "boom: {}", self.0)
            }
        }
        impl std::error::Error for BoomError {}

        struct FailingResolver;
        impl Resolver for FailingResolver {
            type Context = ();
            type Error = BoomError;
            fn variable(&self, _: &(), path: &str) -> Result<Value, BoomError> {
                Err(BoomError(path.to_string()))
            }
            fn template_string(&self, _: &(), _: &str) -> Result<Value, BoomError> {
                Ok(Value::None)
            }
            fn translation(&self, _: &(), _: &str) -> Result<Value, BoomError> {
                Ok(Value::None)
            }
            fn filter(
                &self,
                _: &(),
                _: &str,
                value: Value,
                _: Option<Value>,
            ) -> Result<Value, BoomError> {
                Ok(value)
            }
        }

        let tag = TagParser::parse_tag("t missing", &HashSet::new()).unwrap();
        let err = compile_tag(&tag)
            .unwrap()
            .call(&(), &FailingResolver)
            .unwrap_err();
        assert_eq!(err, EvalError::Resolver(BoomError("missing".to_string())));
    }

    // ###########################################
    // COMPILE ERRORS
    // ###########################################

    #[test]
    fn test_dangling_dict_key_errors() {
        let dict = TagValue {
            token: token("{"),
            children: vec![value_of("key", ValueKind::Variable)],
            kind: ValueKind::Dict,
            spread: None,
            filters: vec![],
            start_index: 0,
            end_index: 0,
            line_col: (1, 1),
        };
        let err = compile_attrs(&[arg_attr(dict)]).unwrap_err();
        assert_eq!(err, CompileError::DanglingDictKey { line_col: (1, 1) });
    }

    #[test]
    fn test_container_dict_key_errors() {
        let list_key = value_of("[", ValueKind::List);
        let dict = TagValue {
            token: token("{"),
            children: vec![list_key, value_of("1", ValueKind::Int)],
            kind: ValueKind::Dict,
            spread: None,
            filters: vec![],
            start_index: 0,
            end_index: 0,
            line_col: (1, 1),
        };
        let err = compile_attrs(&[arg_attr(dict)]).unwrap_err();
        assert_eq!(err, CompileError::ContainerDictKey { line_col: (1, 1) });
    }

    #[test]
    fn test_spread_on_keyword_value_errors() {
        let mut value = value_of("options", ValueKind::Variable);
        value.spread = Some(SpreadKind::Dots);
        let err = compile_attrs(&[kwarg_attr("key", value)]).unwrap_err();
        assert_eq!(
            err,
            CompileError::SpreadNotAllowed {
                marker: "...",
                position: "a keyword value",
                line_col: (1, 1),
            }
        );
    }

    #[test]
    fn test_star_spread_in_list_errors() {
        let mut item = value_of("x", ValueKind::Variable);
        item.spread = Some(SpreadKind::Star);
        let list = TagValue {
            token: token("["),
            children: vec![item],
            kind: ValueKind::List,
            spread: None,
            filters: vec![],
            start_index: 0,
            end_index: 0,
            line_col: (1, 1),
        };
        let err = compile_attrs(&[arg_attr(list)]).unwrap_err();
        assert_eq!(
            err,
            CompileError::SpreadNotAllowed {
                marker: "*",
                position: "a list element",
                line_col: (1, 1),
            }
        );
    }

    #[test]
    fn test_dots_spread_in_dict_errors() {
        let mut entry = value_of("x", ValueKind::Variable);
        entry.spread = Some(SpreadKind::Dots);
        let dict = TagValue {
            token: token("{"),
            children: vec![entry],
            kind: ValueKind::Dict,
            spread: None,
            filters: vec![],
            start_index: 0,
            end_index: 0,
            line_col: (1, 1),
        };
        let err = compile_attrs(&[arg_attr(dict)]).unwrap_err();
        assert_eq!(
            err,
            CompileError::SpreadNotAllowed {
                marker: "...",
                position: "a dict entry",
                line_col: (1, 1),
            }
        );
    }

    #[test]
    fn test_malformed_flag_errors() {
        let mut flagged_string = arg_attr(value_of("on", ValueKind::String));
        flagged_string.is_flag = true;
        let err = compile_attrs(&[flagged_string]).unwrap_err();
        assert_eq!(err, CompileError::MalformedFlag { line_col: (1, 1) });

        let mut flagged_kwarg = kwarg_attr("key", value_of("on", ValueKind::Variable));
        flagged_kwarg.is_flag = true;
        let err = compile_attrs(&[flagged_kwarg]).unwrap_err();
        assert_eq!(err, CompileError::MalformedFlag { line_col: (1, 1) });
    }

    #[test]
    fn test_filtered_flag_errors() {
        let mut value = value_of("my_flag", ValueKind::Variable);
        value.filters.push(TagValueFilter {
            token: token("upper"),
            arg: None,
            start_index: 0,
            end_index: 0,
            line_col: (1, 1),
        });
        let mut attr = arg_attr(value);
        attr.is_flag = true;
        let err = compile_attrs(&[attr]).unwrap_err();
        assert_eq!(err, CompileError::MalformedFlag { line_col: (1, 1) });
    }

    #[test]
    fn test_out_of_range_int_errors() {
        let err = compile_attrs(&[arg_attr(value_of(
            "99999999999999999999",
            ValueKind::Int,
        ))])
        .unwrap_err();
        assert_eq!(
            err,
            CompileError::InvalidNumber {
                token: "99999999999999999999".to_string(),
                line_col: (1, 1),
            }
        );
    }

    #[test]
    fn test_compile_from_hand_built_attrs() {
        let attrs = vec![
            arg_attr(value_of("42", ValueKind::Int)),
            kwarg_attr("key", value_of("my_var", ValueKind::Variable)),
        ];
        let compiled = compile_attrs(&attrs).unwrap();
        let (args, kwargs) = compiled
            .call(&ctx(&[("my_var", Value::from("v"))]), &TestResolver)
            .unwrap();
        assert_eq!(args, vec![Value::Int(42)]);
        assert_eq!(kwargs, vec![kw("key", Value::from("v"))]);
    }
}
