//! Graph query language (Section 6): a small Blaze/Buck-style expression
//! language for inspecting the target graph without running a build.
//!
//! Grammar (informal):
//!
//! ```text
//! expr      := let_expr | set_expr
//! let_expr  := "let" IDENT "=" set_expr "in" expr
//! set_expr  := term (("+" | "&" | "-") term)*
//! term      := call | "$" IDENT | "(" expr ")" | LITERAL
//! call      := IDENT "(" arg ("," arg)* ")"
//! arg       := expr | STRING
//! ```
//!
//! A bare `LITERAL` (e.g. `//pkg:lib`) resolves to the singleton set of the
//! target with that interned name; it is an error if no such target exists.

use std::collections::{BTreeMap, BTreeSet};

use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use regex::Regex;

use crate::graph::{Graph, Interner, TargetId, TargetKind};

/// An ordered, deduplicated set of targets; the result type of every query.
/// Iteration order is the tie-break rule from the dependency graph: target
/// name, lexicographically.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetSet(BTreeSet<TargetId>);

impl TargetSet {
    pub fn singleton(id: TargetId) -> Self {
        Self(BTreeSet::from([id]))
    }

    pub fn from_ids(ids: impl IntoIterator<Item = TargetId>) -> Self {
        Self(ids.into_iter().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, id: TargetId) -> bool {
        self.0.contains(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = TargetId> + '_ {
        self.0.iter().copied()
    }

    fn union(&self, other: &Self) -> Self {
        Self(self.0.union(&other.0).copied().collect())
    }

    fn intersect(&self, other: &Self) -> Self {
        Self(self.0.intersection(&other.0).copied().collect())
    }

    fn difference(&self, other: &Self) -> Self {
        Self(self.0.difference(&other.0).copied().collect())
    }

    /// Names sorted the same way as the underlying ids, resolved through
    /// `interner`. Unresolvable ids (shouldn't happen for a live graph) are
    /// rendered as their debug form.
    fn sorted_names(&self, interner: &Interner) -> Vec<String> {
        self.0
            .iter()
            .map(|id| interner.resolve(*id).unwrap_or_else(|| format!("{id:?}")))
            .collect()
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum OutputFormat {
    Pretty,
    List,
    Json,
    Dot,
}

impl std::str::FromStr for OutputFormat {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pretty" => Ok(Self::Pretty),
            "list" => Ok(Self::List),
            "json" => Ok(Self::Json),
            "dot" => Ok(Self::Dot),
            other => bail!("unknown query output format {other:?}"),
        }
    }
}

/// Render a query result in the requested format.
pub fn format_result(
    graph: &Graph,
    interner: &Interner,
    format: OutputFormat,
    result: &TargetSet,
) -> Result<String> {
    let names = result.sorted_names(interner);
    Ok(match format {
        OutputFormat::List => names.join("\n"),
        OutputFormat::Pretty => names
            .iter()
            .map(|n| format!("  {n}"))
            .collect::<Vec<_>>()
            .join("\n"),
        OutputFormat::Json => serde_json::to_string_pretty(&names)?,
        OutputFormat::Dot => {
            let mut out = String::from("digraph polybuild {\n");
            for id in result.iter() {
                let Some(node) = graph.node(id) else { continue };
                let name = interner.resolve(id).unwrap_or_default();
                for dep in &node.resolved_deps {
                    if result.contains(*dep) {
                        let dep_name = interner.resolve(*dep).unwrap_or_default();
                        out.push_str(&format!("  {name:?} -> {dep_name:?};\n"));
                    }
                }
            }
            out.push_str("}\n");
            out
        }
    })
}

/// Evaluate a query expression string against `graph`.
pub fn evaluate(graph: &Graph, interner: &Interner, expression: &str) -> Result<TargetSet> {
    let tokens = lex(expression)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        bindings: BTreeMap::new(),
    };
    let expr = parser.parse_expr()?;
    parser.expect_end()?;
    Evaluator { graph, interner }.eval(&expr, &parser.bindings)
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    LParen,
    RParen,
    Comma,
    Plus,
    Amp,
    Minus,
    Eq,
    Dollar,
}

fn lex(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '&' => {
                tokens.push(Token::Amp);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Eq);
                i += 1;
            }
            '$' => {
                tokens.push(Token::Dollar);
                i += 1;
            }
            '"' => {
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    bail!("unterminated string literal in query");
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            _ => {
                let start = i;
                while i < chars.len()
                    && !chars[i].is_whitespace()
                    && !matches!(chars[i], '(' | ')' | ',' | '"' | '$' | '=')
                {
                    i += 1;
                }
                if i == start {
                    bail!("unexpected character {c:?} in query");
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
        }
    }
    Ok(tokens)
}

/// The parsed query AST. `Literal` covers both bare target names and the
/// `+`/`&`/`-` operands, since any sub-expression can stand wherever a set
/// is expected.
#[derive(Clone, Debug)]
enum Expr {
    Literal(String),
    Var(String),
    Binary(Box<Expr>, SetOp, Box<Expr>),
    Call(String, Vec<Arg>),
    Let(String, Box<Expr>, Box<Expr>),
}

#[derive(Clone, Debug)]
enum Arg {
    Expr(Expr),
    Str(String),
}

#[derive(Copy, Clone, Debug)]
enum SetOp {
    Union,
    Intersect,
    Difference,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    bindings: BTreeMap<String, Expr>,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect_end(&self) -> Result<()> {
        if self.pos != self.tokens.len() {
            bail!("trailing tokens after query expression");
        }
        Ok(())
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        if let Some(Token::Ident(word)) = self.peek() {
            if word == "let" {
                return self.parse_let();
            }
        }
        self.parse_set_expr()
    }

    fn parse_let(&mut self) -> Result<Expr> {
        self.bump(); // "let"
        let name = match self.bump() {
            Some(Token::Ident(name)) => name,
            other => bail!("expected identifier after `let`, got {other:?}"),
        };
        match self.bump() {
            Some(Token::Eq) => {}
            other => bail!("expected `=` in `let` binding, got {other:?}"),
        }
        let bound = self.parse_set_expr()?;
        match self.bump() {
            Some(Token::Ident(word)) if word == "in" => {}
            other => bail!("expected `in` in `let` binding, got {other:?}"),
        }
        let body = self.parse_expr()?;
        Ok(Expr::Let(name, Box::new(bound), Box::new(body)))
    }

    fn parse_set_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => SetOp::Union,
                Some(Token::Amp) => SetOp::Intersect,
                Some(Token::Minus) => SetOp::Difference,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_term()?;
            lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<Expr> {
        match self.bump() {
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    other => bail!("expected `)`, got {other:?}"),
                }
            }
            Some(Token::Dollar) => match self.bump() {
                Some(Token::Ident(name)) => Ok(Expr::Var(name)),
                other => bail!("expected identifier after `$`, got {other:?}"),
            },
            Some(Token::Ident(word)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.bump();
                    let args = self.parse_args()?;
                    Ok(Expr::Call(word, args))
                } else {
                    Ok(Expr::Literal(word))
                }
            }
            other => bail!("expected a query term, got {other:?}"),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Arg>> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.bump();
            return Ok(args);
        }
        loop {
            let arg = if let Some(Token::Str(s)) = self.peek() {
                let s = s.clone();
                self.bump();
                Arg::Str(s)
            } else {
                Arg::Expr(self.parse_expr()?)
            };
            args.push(arg);
            match self.bump() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                other => bail!("expected `,` or `)` in argument list, got {other:?}"),
            }
        }
        Ok(args)
    }
}

struct Evaluator<'g> {
    graph: &'g Graph,
    interner: &'g Interner,
}

impl<'g> Evaluator<'g> {
    fn eval(&self, expr: &Expr, vars: &BTreeMap<String, Expr>) -> Result<TargetSet> {
        match expr {
            Expr::Literal(name) => {
                let id = self
                    .interner
                    .lookup(name)
                    .ok_or_else(|| eyre!("no such target: {name}"))?;
                Ok(TargetSet::singleton(id))
            }
            Expr::Var(name) => {
                let bound = vars
                    .get(name)
                    .ok_or_else(|| eyre!("undefined query variable ${name}"))?
                    .clone();
                self.eval(&bound, vars)
            }
            Expr::Binary(lhs, op, rhs) => {
                let l = self.eval(lhs, vars)?;
                let r = self.eval(rhs, vars)?;
                Ok(match op {
                    SetOp::Union => l.union(&r),
                    SetOp::Intersect => l.intersect(&r),
                    SetOp::Difference => l.difference(&r),
                })
            }
            Expr::Let(name, bound, body) => {
                let mut vars = vars.clone();
                vars.insert(name.clone(), (**bound).clone());
                self.eval(body, &vars)
            }
            Expr::Call(name, args) => self.eval_call(name, args, vars),
        }
    }

    fn eval_set_arg(&self, arg: &Arg, vars: &BTreeMap<String, Expr>) -> Result<TargetSet> {
        match arg {
            Arg::Expr(e) => self.eval(e, vars),
            Arg::Str(_) => bail!("expected a target expression, got a string literal"),
        }
    }

    fn eval_str_arg(&self, arg: &Arg) -> Result<String> {
        match arg {
            Arg::Str(s) => Ok(s.clone()),
            Arg::Expr(Expr::Literal(s)) => Ok(s.clone()),
            Arg::Expr(_) => bail!("expected a string literal argument"),
        }
    }

    fn eval_call(&self, name: &str, args: &[Arg], vars: &BTreeMap<String, Expr>) -> Result<TargetSet> {
        match name {
            "deps" => match args {
                [x] => Ok(self.transitive_deps(&self.eval_set_arg(x, vars)?, None)),
                [x, d] => {
                    let depth: u32 = self
                        .eval_str_arg(d)
                        .unwrap_or_default()
                        .parse()
                        .with_context(|| "deps(X, d): d must be an integer")?;
                    Ok(self.transitive_deps(&self.eval_set_arg(x, vars)?, Some(depth)))
                }
                _ => bail!("deps() takes 1 or 2 arguments"),
            },
            "rdeps" => match args {
                [x] => Ok(self.transitive_rdeps(&self.eval_set_arg(x, vars)?)),
                _ => bail!("rdeps() takes exactly 1 argument"),
            },
            "allpaths" => match args {
                [x, y] => self.allpaths(&self.eval_set_arg(x, vars)?, &self.eval_set_arg(y, vars)?),
                _ => bail!("allpaths() takes exactly 2 arguments"),
            },
            "somepath" => match args {
                [x, y] => self.somepath(&self.eval_set_arg(x, vars)?, &self.eval_set_arg(y, vars)?),
                _ => bail!("somepath() takes exactly 2 arguments"),
            },
            "shortest" => match args {
                [x, y] => self.somepath(&self.eval_set_arg(x, vars)?, &self.eval_set_arg(y, vars)?),
                _ => bail!("shortest() takes exactly 2 arguments"),
            },
            "kind" => match args {
                [pattern, x] => {
                    let pattern = self.eval_str_arg(pattern)?;
                    let set = self.eval_set_arg(x, vars)?;
                    self.filter_kind(&pattern, &set)
                }
                _ => bail!("kind() takes exactly 2 arguments"),
            },
            "attr" => match args {
                [attr, value, x] => {
                    let attr = self.eval_str_arg(attr)?;
                    let value = self.eval_str_arg(value)?;
                    let set = self.eval_set_arg(x, vars)?;
                    Ok(TargetSet::from_ids(
                        set.iter()
                            .filter(|id| self.attr_value(*id, &attr).as_deref() == Some(value.as_str())),
                    ))
                }
                _ => bail!("attr() takes exactly 3 arguments"),
            },
            "filter" => match args {
                [attr, regex, x] => {
                    let attr = self.eval_str_arg(attr)?;
                    let pattern = self.eval_str_arg(regex)?;
                    let re = Regex::new(&pattern).with_context(|| format!("invalid regex {pattern:?}"))?;
                    let set = self.eval_set_arg(x, vars)?;
                    Ok(TargetSet::from_ids(set.iter().filter(|id| {
                        self.attr_value(*id, &attr)
                            .map(|v| re.is_match(&v))
                            .unwrap_or(false)
                    })))
                }
                _ => bail!("filter() takes exactly 3 arguments"),
            },
            "siblings" => match args {
                [x] => Ok(self.siblings(&self.eval_set_arg(x, vars)?)),
                _ => bail!("siblings() takes exactly 1 argument"),
            },
            "buildfiles" => match args {
                // A declaration file's worth of provenance isn't tracked
                // per-target; approximate with package-level grouping, same
                // as `siblings`, but including the queried targets.
                [x] => {
                    let set = self.eval_set_arg(x, vars)?;
                    Ok(self.siblings(&set).union(&set))
                }
                _ => bail!("buildfiles() takes exactly 1 argument"),
            },
            other => bail!("unknown query function {other}()"),
        }
    }

    fn transitive_deps(&self, roots: &TargetSet, limit: Option<u32>) -> TargetSet {
        let mut seen: BTreeSet<TargetId> = roots.0.clone();
        let mut frontier: Vec<TargetId> = roots.iter().collect();
        let mut depth = 0;
        while !frontier.is_empty() {
            if let Some(limit) = limit {
                if depth >= limit {
                    break;
                }
            }
            let mut next = Vec::new();
            for id in frontier {
                let Some(node) = self.graph.node(id) else { continue };
                for dep in &node.resolved_deps {
                    if seen.insert(*dep) {
                        next.push(*dep);
                    }
                }
            }
            frontier = next;
            depth += 1;
        }
        TargetSet(seen)
    }

    fn transitive_rdeps(&self, roots: &TargetSet) -> TargetSet {
        let mut seen: BTreeSet<TargetId> = roots.0.clone();
        let mut frontier: Vec<TargetId> = roots.iter().collect();
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for id in frontier {
                for rdep in self.graph.rdeps(id) {
                    if seen.insert(rdep) {
                        next.push(rdep);
                    }
                }
            }
            frontier = next;
        }
        TargetSet(seen)
    }

    fn somepath(&self, from: &TargetSet, to: &TargetSet) -> Result<TargetSet> {
        let (Some(from), Some(to)) = (from.iter().next(), to.iter().next()) else {
            return Ok(TargetSet::default());
        };
        Ok(self
            .graph
            .shortest(from, to)
            .map(TargetSet::from_ids)
            .unwrap_or_default())
    }

    fn allpaths(&self, from: &TargetSet, to: &TargetSet) -> Result<TargetSet> {
        let mut out = BTreeSet::new();
        for from in from.iter() {
            for to in to.iter() {
                for path in self.graph.allpaths(from, to) {
                    out.extend(path);
                }
            }
        }
        Ok(TargetSet(out))
    }

    fn filter_kind(&self, pattern: &str, set: &TargetSet) -> Result<TargetSet> {
        let re = Regex::new(pattern).with_context(|| format!("invalid regex {pattern:?}"))?;
        Ok(TargetSet::from_ids(set.iter().filter(|id| {
            self.graph
                .node(*id)
                .map(|n| re.is_match(&kind_name(n.target.kind)))
                .unwrap_or(false)
        })))
    }

    fn attr_value(&self, id: TargetId, attr: &str) -> Option<String> {
        let node = self.graph.node(id)?;
        Some(match attr {
            "language" => node.target.language.to_string(),
            "kind" => kind_name(node.target.kind),
            "output_path" => node.target.output_path.clone().unwrap_or_default(),
            other => node.target.handler_config.get(other).cloned().unwrap_or_default(),
        })
    }

    /// Other targets sharing `X`'s package (the portion of its name before
    /// a `:` separator, or its full name if there is none).
    fn siblings(&self, set: &TargetSet) -> TargetSet {
        let packages: BTreeSet<String> = set
            .iter()
            .filter_map(|id| self.interner.resolve(id))
            .map(|name| package_of(&name).to_string())
            .collect();

        let mut out = BTreeSet::new();
        for node in self.graph.all_ids() {
            if let Some(name) = self.interner.resolve(node) {
                if packages.contains(package_of(&name)) {
                    out.insert(node);
                }
            }
        }
        TargetSet(out)
    }
}

fn package_of(name: &str) -> &str {
    name.split(':').next().unwrap_or(name)
}

fn kind_name(kind: TargetKind) -> String {
    kind.to_string().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Language, Target};

    fn build_graph() -> (Graph, Interner) {
        let interner = Interner::new();
        let mut graph = Graph::new();
        let a = interner.intern("//pkg:a");
        let b = interner.intern("//pkg:b");
        let c = interner.intern("//other:c");

        graph
            .add_target(
                Target::builder()
                    .id(a)
                    .kind(TargetKind::Library)
                    .language(Language::Rust)
                    .build(),
            )
            .unwrap();
        graph
            .add_target(
                Target::builder()
                    .id(b)
                    .kind(TargetKind::Executable)
                    .language(Language::Rust)
                    .build(),
            )
            .unwrap();
        graph
            .add_target(
                Target::builder()
                    .id(c)
                    .kind(TargetKind::Library)
                    .language(Language::Python)
                    .build(),
            )
            .unwrap();
        graph.add_edge(b, a).unwrap();
        graph.add_edge(a, c).unwrap();
        (graph, interner)
    }

    #[test]
    fn literal_resolves_a_single_target() {
        let (graph, interner) = build_graph();
        let result = evaluate(&graph, &interner, "//pkg:a").unwrap();
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn deps_is_transitive_by_default() {
        let (graph, interner) = build_graph();
        let result = evaluate(&graph, &interner, "deps(//pkg:b)").unwrap();
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn deps_respects_depth_limit() {
        let (graph, interner) = build_graph();
        let result = evaluate(&graph, &interner, "deps(//pkg:b, 1)").unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn rdeps_walks_reverse_edges() {
        let (graph, interner) = build_graph();
        let result = evaluate(&graph, &interner, "rdeps(//other:c)").unwrap();
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn set_operators_combine_results() {
        let (graph, interner) = build_graph();
        let result = evaluate(&graph, &interner, "kind(\"library\", deps(//pkg:b)) - //other:c").unwrap();
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn let_binding_is_reusable() {
        let (graph, interner) = build_graph();
        let result = evaluate(&graph, &interner, "let x = deps(//pkg:b) in $x & $x").unwrap();
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn siblings_share_a_package() {
        let (graph, interner) = build_graph();
        let result = evaluate(&graph, &interner, "siblings(//pkg:a)").unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn unknown_target_literal_errors() {
        let (graph, interner) = build_graph();
        assert!(evaluate(&graph, &interner, "//pkg:missing").is_err());
    }
}
