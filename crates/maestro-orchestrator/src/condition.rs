//! A small, closed predicate language for condition nodes.
//!
//! ```text
//! expr    := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | compare
//! compare := primary ( ("==" | "!=" | ">" | ">=" | "<" | "<=") primary )?
//! primary := literal | "(" expr ")" | ("exists" | "len") "(" path ")" | path
//! path    := ident ( "." (ident | integer) )*
//! ```
//!
//! Paths starting with `context` or `results` read from that scope; any
//! other path is resolved against the execution context. Missing values
//! evaluate to `null`.

use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    EqEq,
    NotEq,
    Gt,
    Ge,
    Lt,
    Le,
    Bang,
    AndAnd,
    OrOr,
    LParen,
    RParen,
    Dot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Context,
    Results,
}

#[derive(Debug, Clone, PartialEq)]
struct PathRef {
    scope: Scope,
    segments: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(PathRef),
    Exists(PathRef),
    Len(PathRef),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

/// A parsed condition, ready to be evaluated against any execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parse an expression. The error names the offending token or position.
    pub fn parse(source: &str) -> Result<Self, String> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err("empty condition".to_string());
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.expr()?;
        if let Some(token) = parser.peek() {
            return Err(format!("unexpected trailing token {token:?}"));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate to a boolean using JSON truthiness.
    pub fn evaluate(
        &self,
        context: &serde_json::Map<String, Value>,
        results: &serde_json::Map<String, Value>,
    ) -> bool {
        truthy(&eval(&self.expr, context, results))
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let two = chars.get(i + 1).copied();
        let (token, width) = match (c, two) {
            ('=', Some('=')) => (Token::EqEq, 2),
            ('!', Some('=')) => (Token::NotEq, 2),
            ('>', Some('=')) => (Token::Ge, 2),
            ('<', Some('=')) => (Token::Le, 2),
            ('&', Some('&')) => (Token::AndAnd, 2),
            ('|', Some('|')) => (Token::OrOr, 2),
            ('>', _) => (Token::Gt, 1),
            ('<', _) => (Token::Lt, 1),
            ('!', _) => (Token::Bang, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('.', _) => (Token::Dot, 1),
            ('"' | '\'', _) => {
                let (s, end) = lex_string(&chars, i)?;
                tokens.push(Token::Str(s));
                i = end;
                continue;
            }
            (c, _)
                if c.is_ascii_digit() || (c == '-' && two.is_some_and(|d| d.is_ascii_digit())) =>
            {
                // after a dot only an integer segment is allowed
                let integer_only = tokens.last() == Some(&Token::Dot);
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_digit()
                        || (!integer_only
                            && chars[i] == '.'
                            && chars.get(i + 1).is_some_and(char::is_ascii_digit)))
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{text}'"))?;
                tokens.push(Token::Number(n));
                continue;
            }
            (c, _) if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '-')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
                continue;
            }
            (other, _) => return Err(format!("unexpected character '{other}' at {i}")),
        };
        tokens.push(token);
        i += width;
    }
    Ok(tokens)
}

fn lex_string(chars: &[char], start: usize) -> Result<(String, usize), String> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| "dangling escape in string".to_string())?;
                out.push(*escaped);
                i += 2;
            }
            c if c == quote => return Ok((out, i + 1)),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(format!("unterminated string starting at {start}"))
}

/// Deepest nesting of parentheses and `!` a condition may use.
const MAX_NESTING: usize = 64;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), String> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(format!("expected {expected:?}, found {:?}", self.peek()))
        }
    }

    fn descend(&mut self) -> Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(format!("condition nested too deeply (limit {MAX_NESTING})"));
        }
        Ok(())
    }

    // chains stay flat so a long `a || b || ...` does not deepen the tree
    fn expr(&mut self) -> Result<Expr, String> {
        let first = self.and()?;
        if self.peek() != Some(&Token::OrOr) {
            return Ok(first);
        }
        let mut terms = vec![first];
        while self.eat(&Token::OrOr) {
            terms.push(self.and()?);
        }
        Ok(Expr::Or(terms))
    }

    fn and(&mut self) -> Result<Expr, String> {
        let first = self.unary()?;
        if self.peek() != Some(&Token::AndAnd) {
            return Ok(first);
        }
        let mut terms = vec![first];
        while self.eat(&Token::AndAnd) {
            terms.push(self.unary()?);
        }
        Ok(Expr::And(terms))
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.eat(&Token::Bang) {
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, String> {
        let lhs = self.primary()?;
        let op = match self.peek() {
            Some(Token::EqEq) => CmpOp::Eq,
            Some(Token::NotEq) => CmpOp::Ne,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.primary()?;
        Ok(Expr::Compare(op, Box::new(lhs), Box::new(rhs)))
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.bump() {
            Some(Token::Number(n)) => serde_json::Number::from_f64(n)
                .map(|n| Expr::Literal(Value::Number(n)))
                .ok_or_else(|| format!("unrepresentable number {n}")),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.expr()?;
                self.expect(&Token::RParen)?;
                self.depth -= 1;
                Ok(inner)
            }
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "exists" | "len" if self.peek() == Some(&Token::LParen) => {
                    self.pos += 1;
                    let Some(Token::Ident(head)) = self.bump() else {
                        return Err(format!("{word}() takes a path"));
                    };
                    let path = self.path(head)?;
                    self.expect(&Token::RParen)?;
                    Ok(if word == "exists" {
                        Expr::Exists(path)
                    } else {
                        Expr::Len(path)
                    })
                }
                _ if self.peek() == Some(&Token::LParen) => {
                    Err(format!("unknown function '{word}'"))
                }
                _ => Ok(Expr::Path(self.path(word)?)),
            },
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of condition".to_string()),
        }
    }

    fn path(&mut self, head: String) -> Result<PathRef, String> {
        let mut segments = vec![head];
        while self.eat(&Token::Dot) {
            match self.bump() {
                Some(Token::Ident(s)) => segments.push(s),
                Some(Token::Number(n)) if n >= 0.0 && n.fract() == 0.0 => {
                    segments.push(format!("{n}"));
                }
                other => return Err(format!("invalid path segment {other:?}")),
            }
        }

        let scope = match segments[0].as_str() {
            "context" => Some(Scope::Context),
            "results" => Some(Scope::Results),
            _ => None,
        };
        Ok(match scope {
            Some(scope) => {
                segments.remove(0);
                PathRef { scope, segments }
            }
            None => PathRef {
                scope: Scope::Context,
                segments,
            },
        })
    }
}

fn resolve<'a>(
    path: &PathRef,
    context: &'a serde_json::Map<String, Value>,
    results: &'a serde_json::Map<String, Value>,
) -> Option<&'a Value> {
    let root = match path.scope {
        Scope::Context => context,
        Scope::Results => results,
    };
    let (first, rest) = path.segments.split_first()?;
    let mut current = root.get(first)?;
    for segment in rest {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn eval(
    expr: &Expr,
    context: &serde_json::Map<String, Value>,
    results: &serde_json::Map<String, Value>,
) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Path(path) => resolve(path, context, results)
            .cloned()
            .unwrap_or(Value::Null),
        Expr::Exists(path) => {
            Value::Bool(resolve(path, context, results).is_some_and(|v| !v.is_null()))
        }
        Expr::Len(path) => {
            let len = match resolve(path, context, results) {
                Some(Value::String(s)) => s.chars().count(),
                Some(Value::Array(items)) => items.len(),
                Some(Value::Object(map)) => map.len(),
                _ => 0,
            };
            Value::from(len)
        }
        Expr::Not(inner) => Value::Bool(!truthy(&eval(inner, context, results))),
        Expr::And(terms) => {
            Value::Bool(terms.iter().all(|term| truthy(&eval(term, context, results))))
        }
        Expr::Or(terms) => {
            Value::Bool(terms.iter().any(|term| truthy(&eval(term, context, results))))
        }
        Expr::Compare(op, lhs, rhs) => {
            let l = eval(lhs, context, results);
            let r = eval(rhs, context, results);
            Value::Bool(compare(*op, &l, &r))
        }
    }
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> bool {
    match op {
        CmpOp::Eq => loosely_equal(l, r),
        CmpOp::Ne => !loosely_equal(l, r),
        _ => {
            let ordering = match (l, r) {
                (Value::Number(a), Value::Number(b)) => a
                    .as_f64()
                    .zip(b.as_f64())
                    .and_then(|(a, b)| a.partial_cmp(&b)),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            // mismatched or unordered types compare false
            ordering.is_some_and(|o| match op {
                CmpOp::Gt => o == Ordering::Greater,
                CmpOp::Ge => o != Ordering::Less,
                CmpOp::Lt => o == Ordering::Less,
                CmpOp::Le => o != Ordering::Greater,
                CmpOp::Eq | CmpOp::Ne => false,
            })
        }
    }
}

fn loosely_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => l == r,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> serde_json::Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn check(source: &str, context: Value, results: Value) -> bool {
        Condition::parse(source)
            .unwrap()
            .evaluate(&map(context), &map(results))
    }

    #[test]
    fn test_literals() {
        assert!(check("true", json!({}), json!({})));
        assert!(!check("false", json!({}), json!({})));
        assert!(!check("null", json!({}), json!({})));
        assert!(check("1 < 2.5", json!({}), json!({})));
    }

    #[test]
    fn test_bare_path_reads_context() {
        let ctx = json!({"approved": true, "user": {"tier": "gold"}});
        assert!(check("approved", ctx.clone(), json!({})));
        assert!(check("user.tier == 'gold'", ctx.clone(), json!({})));
        assert!(check("context.user.tier == \"gold\"", ctx, json!({})));
        assert!(!check("missing", json!({}), json!({})));
    }

    #[test]
    fn test_results_scope() {
        let results = json!({"score": {"value": 0.92, "labels": ["a", "b"]}});
        assert!(check("results.score.value >= 0.9", json!({}), results.clone()));
        assert!(check("results.score.labels.1 == 'b'", json!({}), results.clone()));
        assert!(check("len(results.score.labels) == 2", json!({}), results));
    }

    #[test]
    fn test_boolean_operators_and_precedence() {
        let ctx = json!({"a": true, "b": false, "n": 3});
        assert!(check("a && !b", ctx.clone(), json!({})));
        assert!(check("b || a && n > 2", ctx.clone(), json!({})));
        assert!(!check("(b || a) && n > 5", ctx.clone(), json!({})));
        assert!(check("!(n == 4)", ctx, json!({})));
    }

    #[test]
    fn test_exists() {
        let ctx = json!({"present": 0, "nothing": null});
        assert!(check("exists(present)", ctx.clone(), json!({})));
        assert!(!check("exists(nothing)", ctx.clone(), json!({})));
        assert!(!check("exists(context.absent)", ctx, json!({})));
    }

    #[test]
    fn test_mismatched_types_compare_false() {
        let ctx = json!({"n": 5, "s": "5"});
        assert!(!check("n > s", ctx.clone(), json!({})));
        assert!(!check("n == s", ctx.clone(), json!({})));
        assert!(check("n == 5.0", ctx, json!({})));
    }

    #[test]
    fn test_negative_numbers() {
        assert!(check("delta < -1", json!({"delta": -3}), json!({})));
    }

    #[test]
    fn test_rejects_unknown_function() {
        let err = Condition::parse("eval(context)").unwrap_err();
        assert!(err.contains("unknown function 'eval'"));
    }

    #[test]
    fn test_rejects_malformed_input() {
        assert!(Condition::parse("").is_err());
        assert!(Condition::parse("a ==").is_err());
        assert!(Condition::parse("(a").is_err());
        assert!(Condition::parse("a b").is_err());
        assert!(Condition::parse("a = 1").is_err());
        assert!(Condition::parse("'open").is_err());
        assert!(Condition::parse("len(1)").is_err());
    }

    #[test]
    fn test_nesting_limit() {
        let nested = |depth: usize| format!("{}true{}", "(".repeat(depth), ")".repeat(depth));
        assert!(Condition::parse(&nested(MAX_NESTING)).is_ok());
        let err = Condition::parse(&nested(MAX_NESTING + 1)).unwrap_err();
        assert!(err.contains("nested too deeply"));

        let err = Condition::parse(&nested(5000)).unwrap_err();
        assert!(err.contains("nested too deeply"));
        let err = Condition::parse(&format!("{}true", "!".repeat(5000))).unwrap_err();
        assert!(err.contains("nested too deeply"));
    }

    #[test]
    fn test_long_chains_stay_flat() {
        let chain = vec!["flag"; 20_000].join(" && ");
        assert!(check(&chain, json!({"flag": true}), json!({})));
        let chain = vec!["missing"; 20_000].join(" || ");
        assert!(!check(&chain, json!({}), json!({})));
    }

    #[test]
    fn test_source_is_kept() {
        let cond = Condition::parse("x > 1").unwrap();
        assert_eq!(cond.source(), "x > 1");
    }
}
