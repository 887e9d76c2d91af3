//! Whitelisted post-processing expressions applied to extracted values.
//!
//! The only free variable is `rst`, the raw extracted string. Supported:
//! string and integer literals, `+`, parentheses, indexing (`[n]`, negative
//! from the end), slices (`[a:b]`), and the methods `split`, `strip`, `trim`,
//! `replace`, `slice`, `substring`, `lower`, `upper`, `join`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("callback `{source_text}`: {message}")]
pub struct CallbackError {
    pub source_text: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Str(String),
    Int(i64),
    Ident(String),
    Plus,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Colon,
    Comma,
    Dot,
}

fn lex(source: &str) -> Result<Vec<Tok>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '+' => {
                out.push(Tok::Plus);
                i += 1;
            }
            '(' | ')' | '[' | ']' | ':' | ',' | '.' => {
                out.push(match c {
                    '(' => Tok::LParen,
                    ')' => Tok::RParen,
                    '[' => Tok::LBracket,
                    ']' => Tok::RBracket,
                    ':' => Tok::Colon,
                    ',' => Tok::Comma,
                    _ => Tok::Dot,
                });
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string".to_string()),
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = chars
                                .get(i + 1)
                                .ok_or_else(|| "dangling escape".to_string())?;
                            text.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => *other,
                            });
                            i += 2;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                out.push(Tok::Str(text));
            }
            '-' | '0'..='9' => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse()
                    .map_err(|_| format!("bad integer `{text}`"))?;
                out.push(Tok::Int(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                out.push(Tok::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("character `{other}` is not allowed")),
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Split,
    Strip,
    Replace,
    Slice,
    Lower,
    Upper,
    Join,
}

impl Method {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "split" => Method::Split,
            "strip" | "trim" => Method::Strip,
            "replace" => Method::Replace,
            "slice" | "substring" => Method::Slice,
            "lower" | "toLowerCase" => Method::Lower,
            "upper" | "toUpperCase" => Method::Upper,
            "join" => Method::Join,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Raw,
    Str(String),
    Int(i64),
    Concat(Box<Node>, Box<Node>),
    Index(Box<Node>, i64),
    Slice(Box<Node>, Option<i64>, Option<i64>),
    Call(Box<Node>, Method, Vec<Node>),
}

struct Parser {
    tokens: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok) -> Result<(), String> {
        if self.eat(&tok) {
            Ok(())
        } else {
            Err(format!("expected {tok:?}, found {:?}", self.peek()))
        }
    }

    fn expr(&mut self) -> Result<Node, String> {
        let mut left = self.postfix()?;
        while self.eat(&Tok::Plus) {
            let right = self.postfix()?;
            left = Node::Concat(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn primary(&mut self) -> Result<Node, String> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        match tok {
            Some(Tok::Str(s)) => Ok(Node::Str(s)),
            Some(Tok::Int(n)) => Ok(Node::Int(n)),
            Some(Tok::Ident(name)) if name == "rst" => Ok(Node::Raw),
            Some(Tok::Ident(name)) => Err(format!("unknown name `{name}`")),
            Some(Tok::LParen) => {
                let inner = self.expr()?;
                self.expect(Tok::RParen)?;
                Ok(inner)
            }
            other => Err(format!("unexpected {other:?}")),
        }
    }

    fn int_literal(&mut self) -> Option<i64> {
        if let Some(Tok::Int(n)) = self.peek() {
            let n = *n;
            self.pos += 1;
            Some(n)
        } else {
            None
        }
    }

    fn postfix(&mut self) -> Result<Node, String> {
        let mut node = self.primary()?;
        loop {
            if self.eat(&Tok::LBracket) {
                let start = self.int_literal();
                if self.eat(&Tok::Colon) {
                    let end = self.int_literal();
                    self.expect(Tok::RBracket)?;
                    node = Node::Slice(Box::new(node), start, end);
                } else {
                    let index = start.ok_or_else(|| "index must be an integer".to_string())?;
                    self.expect(Tok::RBracket)?;
                    node = Node::Index(Box::new(node), index);
                }
            } else if self.eat(&Tok::Dot) {
                let name = match self.peek().cloned() {
                    Some(Tok::Ident(name)) => name,
                    other => return Err(format!("expected method name, found {other:?}")),
                };
                self.pos += 1;
                let method =
                    Method::from_name(&name).ok_or_else(|| format!("method `{name}` is not allowed"))?;
                self.expect(Tok::LParen)?;
                let mut args = Vec::new();
                if !self.eat(&Tok::RParen) {
                    loop {
                        args.push(self.expr()?);
                        if self.eat(&Tok::RParen) {
                            break;
                        }
                        self.expect(Tok::Comma)?;
                    }
                }
                node = Node::Call(Box::new(node), method, args);
            } else {
                return Ok(node);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Val {
    Str(String),
    Int(i64),
    List(Vec<String>),
}

impl Val {
    fn kind(&self) -> &'static str {
        match self {
            Val::Str(_) => "string",
            Val::Int(_) => "int",
            Val::List(_) => "list",
        }
    }

    fn into_str(self) -> Result<String, String> {
        match self {
            Val::Str(s) => Ok(s),
            Val::Int(n) => Ok(n.to_string()),
            Val::List(_) => Err("expected string, got list".to_string()),
        }
    }
}

/// Python slice bounds over `len` items.
fn slice_bounds(len: usize, start: Option<i64>, end: Option<i64>) -> (usize, usize) {
    let len_i = len as i64;
    let clamp = |v: i64| -> usize {
        let v = if v < 0 { len_i + v } else { v };
        v.clamp(0, len_i) as usize
    };
    let s = start.map(clamp).unwrap_or(0);
    let e = end.map(clamp).unwrap_or(len);
    (s, e.max(s))
}

fn index_of(len: usize, index: i64) -> Option<usize> {
    let len_i = len as i64;
    let resolved = if index < 0 { len_i + index } else { index };
    (0..len_i).contains(&resolved).then_some(resolved as usize)
}

fn eval(node: &Node, raw: &str) -> Result<Val, String> {
    match node {
        Node::Raw => Ok(Val::Str(raw.to_string())),
        Node::Str(s) => Ok(Val::Str(s.clone())),
        Node::Int(n) => Ok(Val::Int(*n)),
        Node::Concat(a, b) => match (eval(a, raw)?, eval(b, raw)?) {
            (Val::Str(x), Val::Str(y)) => Ok(Val::Str(x + &y)),
            (Val::Int(x), Val::Int(y)) => x
                .checked_add(y)
                .map(Val::Int)
                .ok_or_else(|| "integer overflow".to_string()),
            (Val::List(mut x), Val::List(y)) => {
                x.extend(y);
                Ok(Val::List(x))
            }
            (x, y) => Err(format!("cannot add {} and {}", x.kind(), y.kind())),
        },
        Node::Index(target, index) => match eval(target, raw)? {
            Val::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                index_of(chars.len(), *index)
                    .map(|i| Val::Str(chars[i].to_string()))
                    .ok_or_else(|| format!("index {index} out of range"))
            }
            Val::List(items) => index_of(items.len(), *index)
                .map(|i| Val::Str(items[i].clone()))
                .ok_or_else(|| format!("index {index} out of range")),
            Val::Int(_) => Err("cannot index an int".to_string()),
        },
        Node::Slice(target, start, end) => match eval(target, raw)? {
            Val::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let (a, b) = slice_bounds(chars.len(), *start, *end);
                Ok(Val::Str(chars[a..b].iter().collect()))
            }
            Val::List(items) => {
                let (a, b) = slice_bounds(items.len(), *start, *end);
                Ok(Val::List(items[a..b].to_vec()))
            }
            Val::Int(_) => Err("cannot slice an int".to_string()),
        },
        Node::Call(target, method, args) => {
            let receiver = eval(target, raw)?;
            let args = args
                .iter()
                .map(|a| eval(a, raw))
                .collect::<Result<Vec<_>, _>>()?;
            call_method(receiver, *method, args)
        }
    }
}

fn int_arg(args: &[Val], index: usize) -> Result<Option<i64>, String> {
    match args.get(index) {
        None => Ok(None),
        Some(Val::Int(n)) => Ok(Some(*n)),
        Some(other) => Err(format!("expected int argument, got {}", other.kind())),
    }
}

fn str_arg(args: &[Val], index: usize) -> Result<Option<String>, String> {
    match args.get(index) {
        None => Ok(None),
        Some(Val::Str(s)) => Ok(Some(s.clone())),
        Some(other) => Err(format!("expected string argument, got {}", other.kind())),
    }
}

fn call_method(receiver: Val, method: Method, args: Vec<Val>) -> Result<Val, String> {
    let Val::Str(s) = receiver else {
        return Err(format!("{method:?} needs a string receiver"));
    };

    Ok(match method {
        Method::Join => match args.as_slice() {
            [Val::List(items)] => Val::Str(items.join(&s)),
            _ => return Err("join() takes one list".to_string()),
        },
        Method::Split => match str_arg(&args, 0)? {
            Some(sep) if !sep.is_empty() => {
                Val::List(s.split(sep.as_str()).map(str::to_string).collect())
            }
            Some(_) => return Err("empty separator".to_string()),
            None => Val::List(s.split_whitespace().map(str::to_string).collect()),
        },
        Method::Strip => match str_arg(&args, 0)? {
            Some(set) => Val::Str(s.trim_matches(|c| set.contains(c)).to_string()),
            None => Val::Str(s.trim().to_string()),
        },
        Method::Replace => {
            let (Some(from), Some(to)) = (str_arg(&args, 0)?, str_arg(&args, 1)?) else {
                return Err("replace() needs two strings".to_string());
            };
            if from.is_empty() {
                return Err("replace() pattern is empty".to_string());
            }
            Val::Str(s.replace(&from, &to))
        }
        Method::Slice => {
            let chars: Vec<char> = s.chars().collect();
            let (a, b) = slice_bounds(chars.len(), int_arg(&args, 0)?, int_arg(&args, 1)?);
            Val::Str(chars[a..b].iter().collect())
        }
        Method::Lower => Val::Str(s.to_lowercase()),
        Method::Upper => Val::Str(s.to_uppercase()),
    })
}

/// A compiled callback program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Callback {
    source: String,
    program: Node,
}

impl Callback {
    pub fn compile(source: &str) -> Result<Self, CallbackError> {
        let fail = |message: String| CallbackError {
            source_text: source.to_string(),
            message,
        };
        let tokens = lex(source.trim()).map_err(fail)?;
        if tokens.is_empty() {
            return Err(fail("empty callback".to_string()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let program = parser.expr().map_err(fail)?;
        if let Some(tok) = parser.peek() {
            return Err(fail(format!("trailing input at {tok:?}")));
        }
        Ok(Self {
            source: source.trim().to_string(),
            program,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn apply(&self, raw: &str) -> Result<String, CallbackError> {
        eval(&self.program, raw)
            .and_then(Val::into_str)
            .map_err(|message| CallbackError {
                source_text: self.source.clone(),
                message,
            })
    }
}
