//! XPath 1.0 subset evaluated over a `scraper` document.
//!
//! Supports location paths (absolute, relative, `//`, `.`, `..`), the common
//! axes, name/`*`/`text()`/`node()` tests, attributes, unions, predicates and
//! a handful of core functions. Anything else is rejected at parse time.

use std::cmp::Ordering;
use std::collections::HashMap;

use scraper::{ElementRef, Html, Node};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("xpath `{expression}`: {message}")]
pub struct XPathError {
    pub expression: String,
    pub message: String,
}

/// A node reachable by an XPath step.
#[derive(Debug, Clone, Copy)]
pub enum XNode<'a> {
    Root,
    Element(ElementRef<'a>),
    Text {
        parent: ElementRef<'a>,
        key: usize,
        text: &'a str,
    },
    Attribute {
        owner: ElementRef<'a>,
        index: usize,
        name: &'a str,
        value: &'a str,
    },
}

impl<'a> XNode<'a> {
    pub fn as_element(&self) -> Option<ElementRef<'a>> {
        match self {
            XNode::Element(el) => Some(*el),
            _ => None,
        }
    }
}

fn node_addr(node: &Node) -> usize {
    node as *const Node as usize
}

fn element_addr(el: ElementRef<'_>) -> usize {
    node_addr((*el).value())
}

/// A parsed page plus the document-order index XPath results are sorted by.
pub struct XDocument<'a> {
    html: &'a Html,
    order: HashMap<usize, usize>,
}

impl<'a> XDocument<'a> {
    pub fn new(html: &'a Html) -> Self {
        let order = html
            .tree
            .root()
            .descendants()
            .enumerate()
            .map(|(index, node)| (node_addr(node.value()), index))
            .collect();
        Self { html, order }
    }

    pub fn html(&self) -> &'a Html {
        self.html
    }

    fn position_of(&self, addr: usize) -> usize {
        self.order.get(&addr).copied().unwrap_or(usize::MAX)
    }

    fn sort_key(&self, node: &XNode<'a>) -> (usize, usize) {
        match node {
            XNode::Root => (0, 0),
            XNode::Element(el) => (self.position_of(element_addr(*el)), 0),
            XNode::Text { key, .. } => (self.position_of(*key), 0),
            XNode::Attribute { owner, index, .. } => {
                (self.position_of(element_addr(*owner)), index + 1)
            }
        }
    }

    /// Concatenated descendant text, as XPath `string()` defines it.
    pub fn string_value(&self, node: &XNode<'a>) -> String {
        match node {
            XNode::Root => self.html.root_element().text().collect(),
            XNode::Element(el) => el.text().collect(),
            XNode::Text { text, .. } => (*text).to_string(),
            XNode::Attribute { value, .. } => (*value).to_string(),
        }
    }

    pub fn outer_html(&self, node: &XNode<'a>) -> String {
        match node {
            XNode::Root => self.html.html(),
            XNode::Element(el) => el.html(),
            XNode::Text { text, .. } => (*text).to_string(),
            XNode::Attribute { value, .. } => (*value).to_string(),
        }
    }

    pub fn inner_html(&self, node: &XNode<'a>) -> String {
        match node {
            XNode::Root => self.html.root_element().inner_html(),
            XNode::Element(el) => el.inner_html(),
            XNode::Text { text, .. } => (*text).to_string(),
            XNode::Attribute { value, .. } => (*value).to_string(),
        }
    }

    fn children(&self, node: &XNode<'a>) -> Vec<XNode<'a>> {
        match node {
            XNode::Root => self
                .html
                .tree
                .root()
                .children()
                .filter_map(ElementRef::wrap)
                .map(XNode::Element)
                .collect(),
            XNode::Element(el) => {
                let parent = *el;
                el.children()
                    .filter_map(|child| {
                        if let Some(element) = ElementRef::wrap(child) {
                            return Some(XNode::Element(element));
                        }
                        match child.value() {
                            Node::Text(text) => Some(XNode::Text {
                                parent,
                                key: node_addr(child.value()),
                                text: &**text,
                            }),
                            _ => None,
                        }
                    })
                    .collect()
            }
            XNode::Text { .. } | XNode::Attribute { .. } => Vec::new(),
        }
    }

    fn parent(&self, node: &XNode<'a>) -> Option<XNode<'a>> {
        match node {
            XNode::Root => None,
            XNode::Element(el) => {
                let parent = el.parent()?;
                match ElementRef::wrap(parent) {
                    Some(element) => Some(XNode::Element(element)),
                    None => Some(XNode::Root),
                }
            }
            XNode::Text { parent, .. } => Some(XNode::Element(*parent)),
            XNode::Attribute { owner, .. } => Some(XNode::Element(*owner)),
        }
    }

    fn attributes(&self, node: &XNode<'a>) -> Vec<XNode<'a>> {
        match node {
            XNode::Element(el) => {
                let owner = *el;
                owner
                    .value()
                    .attrs()
                    .enumerate()
                    .map(|(index, (name, value))| XNode::Attribute {
                        owner,
                        index,
                        name,
                        value,
                    })
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    fn descendants(&self, node: &XNode<'a>, out: &mut Vec<XNode<'a>>) {
        for child in self.children(node) {
            out.push(child);
            self.descendants(&child, out);
        }
    }

    fn siblings(&self, node: &XNode<'a>, following: bool) -> Vec<XNode<'a>> {
        if matches!(node, XNode::Attribute { .. } | XNode::Root) {
            return Vec::new();
        }
        let Some(parent) = self.parent(node) else {
            return Vec::new();
        };
        let key = self.sort_key(node);
        let siblings = self.children(&parent);
        let Some(index) = siblings.iter().position(|s| self.sort_key(s) == key) else {
            return Vec::new();
        };
        if following {
            siblings[index + 1..].to_vec()
        } else {
            siblings[..index].iter().rev().copied().collect()
        }
    }

    fn axis(&self, node: &XNode<'a>, axis: Axis) -> Vec<XNode<'a>> {
        match axis {
            Axis::Child => self.children(node),
            Axis::Descendant => {
                let mut out = Vec::new();
                self.descendants(node, &mut out);
                out
            }
            Axis::DescendantOrSelf => {
                let mut out = vec![*node];
                self.descendants(node, &mut out);
                out
            }
            Axis::Parent => self.parent(node).into_iter().collect(),
            Axis::Ancestor | Axis::AncestorOrSelf => {
                let mut out = Vec::new();
                if axis == Axis::AncestorOrSelf {
                    out.push(*node);
                }
                let mut current = self.parent(node);
                while let Some(parent) = current {
                    out.push(parent);
                    current = self.parent(&parent);
                }
                out
            }
            Axis::SelfAxis => vec![*node],
            Axis::FollowingSibling => self.siblings(node, true),
            Axis::PrecedingSibling => self.siblings(node, false),
            Axis::Attribute => self.attributes(node),
        }
    }

    fn sort_dedup(&self, nodes: &mut Vec<XNode<'a>>) {
        nodes.sort_by_key(|n| self.sort_key(n));
        nodes.dedup_by_key(|n| self.sort_key(n));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    Descendant,
    DescendantOrSelf,
    Parent,
    Ancestor,
    AncestorOrSelf,
    SelfAxis,
    FollowingSibling,
    PrecedingSibling,
    Attribute,
}

impl Axis {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "child" => Axis::Child,
            "descendant" => Axis::Descendant,
            "descendant-or-self" => Axis::DescendantOrSelf,
            "parent" => Axis::Parent,
            "ancestor" => Axis::Ancestor,
            "ancestor-or-self" => Axis::AncestorOrSelf,
            "self" => Axis::SelfAxis,
            "following-sibling" => Axis::FollowingSibling,
            "preceding-sibling" => Axis::PrecedingSibling,
            "attribute" => Axis::Attribute,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum NodeTest {
    Any,
    Name(String),
    Text,
    Node,
    Comment,
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    axis: Axis,
    test: NodeTest,
    predicates: Vec<Expr>,
}

impl Step {
    fn descendant_or_self() -> Self {
        Step {
            axis: Axis::DescendantOrSelf,
            test: NodeTest::Node,
            predicates: Vec::new(),
        }
    }

    fn accepts(&self, node: &XNode<'_>) -> bool {
        match (&self.test, node) {
            (NodeTest::Node, _) => true,
            (NodeTest::Comment, _) => false,
            (NodeTest::Text, XNode::Text { .. }) => true,
            (NodeTest::Text, _) => false,
            (NodeTest::Any, XNode::Attribute { .. }) => self.axis == Axis::Attribute,
            (NodeTest::Any, XNode::Element(_)) => self.axis != Axis::Attribute,
            (NodeTest::Any, _) => false,
            (NodeTest::Name(name), XNode::Attribute { name: attr, .. }) => {
                self.axis == Axis::Attribute && attr.eq_ignore_ascii_case(name)
            }
            (NodeTest::Name(name), XNode::Element(el)) => {
                self.axis != Axis::Attribute && el.value().name().eq_ignore_ascii_case(name)
            }
            (NodeTest::Name(_), _) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Last,
    Position,
    Count,
    Contains,
    StartsWith,
    NormalizeSpace,
    Not,
    String,
    Concat,
    StringLength,
    True,
    False,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "last" => Function::Last,
            "position" => Function::Position,
            "count" => Function::Count,
            "contains" => Function::Contains,
            "starts-with" => Function::StartsWith,
            "normalize-space" => Function::NormalizeSpace,
            "not" => Function::Not,
            "string" => Function::String,
            "concat" => Function::Concat,
            "string-length" => Function::StringLength,
            "true" => Function::True,
            "false" => Function::False,
            _ => return None,
        })
    }

    fn arity(self) -> (usize, usize) {
        match self {
            Function::Last | Function::Position | Function::True | Function::False => (0, 0),
            Function::Count | Function::Not => (1, 1),
            Function::Contains | Function::StartsWith => (2, 2),
            Function::NormalizeSpace | Function::String | Function::StringLength => (0, 1),
            Function::Concat => (2, usize::MAX),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    Union(Box<Expr>, Box<Expr>),
    Path { absolute: bool, steps: Vec<Step> },
    Filter {
        primary: Box<Expr>,
        predicates: Vec<Expr>,
        steps: Vec<Step>,
    },
    Literal(String),
    Number(f64),
    Call(Function, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Slash,
    DoubleSlash,
    Dot,
    DotDot,
    At,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Pipe,
    Star,
    Plus,
    Minus,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    ColonColon,
    Name(String),
    Literal(String),
    Number(f64),
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '/' if next == Some('/') => {
                tokens.push(Token::DoubleSlash);
                i += 2;
                continue;
            }
            '/' => tokens.push(Token::Slash),
            '.' if next == Some('.') => {
                tokens.push(Token::DotDot);
                i += 2;
                continue;
            }
            '.' if next.is_some_and(|n| n.is_ascii_digit()) => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text.parse().map_err(|_| format!("bad number {text}"))?;
                tokens.push(Token::Number(value));
                continue;
            }
            '.' => tokens.push(Token::Dot),
            '@' => tokens.push(Token::At),
            ',' => tokens.push(Token::Comma),
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            '[' => tokens.push(Token::LBracket),
            ']' => tokens.push(Token::RBracket),
            '|' => tokens.push(Token::Pipe),
            '*' => tokens.push(Token::Star),
            '+' => tokens.push(Token::Plus),
            '-' => tokens.push(Token::Minus),
            '=' => tokens.push(Token::Eq),
            '!' if next == Some('=') => {
                tokens.push(Token::NotEq);
                i += 2;
                continue;
            }
            '<' if next == Some('=') => {
                tokens.push(Token::Le);
                i += 2;
                continue;
            }
            '<' => tokens.push(Token::Lt),
            '>' if next == Some('=') => {
                tokens.push(Token::Ge);
                i += 2;
                continue;
            }
            '>' => tokens.push(Token::Gt),
            ':' if next == Some(':') => {
                tokens.push(Token::ColonColon);
                i += 2;
                continue;
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == quote)
                    .map(|offset| start + offset)
                    .ok_or_else(|| "unterminated string literal".to_string())?;
                tokens.push(Token::Literal(chars[start..end].iter().collect()));
                i = end + 1;
                continue;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text.parse().map_err(|_| format!("bad number {text}"))?;
                tokens.push(Token::Number(value));
                continue;
            }
            c if is_name_start(c) => {
                let start = i;
                while i < chars.len() && is_name_char(chars[i]) {
                    i += 1;
                }
                tokens.push(Token::Name(chars[start..i].iter().collect()));
                continue;
            }
            other => return Err(format!("unexpected character `{other}`")),
        }
        i += 1;
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), String> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(format!("expected {token:?}, found {:?}", self.peek()))
        }
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Token::Name(n)) if n == word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("or") {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_equality()?;
        while self.eat_keyword("and") {
            let right = self.parse_equality()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => CmpOp::Eq,
                Some(Token::NotEq) => CmpOp::Ne,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_relational()?;
            left = Expr::Compare(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => CmpOp::Lt,
                Some(Token::Le) => CmpOp::Le,
                Some(Token::Gt) => CmpOp::Gt,
                Some(Token::Ge) => CmpOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_additive()?;
            left = Expr::Compare(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        loop {
            if self.eat(&Token::Plus) {
                let right = self.parse_unary()?;
                left = Expr::Add(Box::new(left), Box::new(right));
            } else if self.eat(&Token::Minus) {
                let right = self.parse_unary()?;
                left = Expr::Sub(Box::new(left), Box::new(right));
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.eat(&Token::Minus) {
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_union()
    }

    fn parse_union(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_path()?;
        while self.eat(&Token::Pipe) {
            let right = self.parse_path()?;
            left = Expr::Union(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn starts_step(&self) -> bool {
        matches!(
            self.peek(),
            Some(Token::Dot | Token::DotDot | Token::At | Token::Star | Token::Name(_))
        )
    }

    fn starts_filter(&self) -> bool {
        match self.peek() {
            Some(Token::Literal(_) | Token::Number(_) | Token::LParen) => true,
            Some(Token::Name(name)) => {
                self.peek_at(1) == Some(&Token::LParen)
                    && !matches!(name.as_str(), "text" | "node" | "comment")
            }
            _ => false,
        }
    }

    fn parse_path(&mut self) -> Result<Expr, String> {
        if self.eat(&Token::Slash) {
            let steps = if self.starts_step() {
                self.parse_relative_steps()?
            } else {
                Vec::new()
            };
            return Ok(Expr::Path {
                absolute: true,
                steps,
            });
        }
        if self.eat(&Token::DoubleSlash) {
            let mut steps = vec![Step::descendant_or_self()];
            steps.extend(self.parse_relative_steps()?);
            return Ok(Expr::Path {
                absolute: true,
                steps,
            });
        }
        if self.starts_filter() {
            let primary = self.parse_primary()?;
            let predicates = self.parse_predicates()?;
            let mut steps = Vec::new();
            if self.eat(&Token::Slash) {
                steps = self.parse_relative_steps()?;
            } else if self.eat(&Token::DoubleSlash) {
                steps.push(Step::descendant_or_self());
                steps.extend(self.parse_relative_steps()?);
            }
            if predicates.is_empty() && steps.is_empty() {
                return Ok(primary);
            }
            return Ok(Expr::Filter {
                primary: Box::new(primary),
                predicates,
                steps,
            });
        }
        Ok(Expr::Path {
            absolute: false,
            steps: self.parse_relative_steps()?,
        })
    }

    fn parse_relative_steps(&mut self) -> Result<Vec<Step>, String> {
        let mut steps = vec![self.parse_step()?];
        loop {
            if self.eat(&Token::Slash) {
                steps.push(self.parse_step()?);
            } else if self.eat(&Token::DoubleSlash) {
                steps.push(Step::descendant_or_self());
                steps.push(self.parse_step()?);
            } else {
                break;
            }
        }
        Ok(steps)
    }

    fn parse_step(&mut self) -> Result<Step, String> {
        if self.eat(&Token::Dot) {
            return Ok(Step {
                axis: Axis::SelfAxis,
                test: NodeTest::Node,
                predicates: self.parse_predicates()?,
            });
        }
        if self.eat(&Token::DotDot) {
            return Ok(Step {
                axis: Axis::Parent,
                test: NodeTest::Node,
                predicates: self.parse_predicates()?,
            });
        }

        let axis = if self.eat(&Token::At) {
            Axis::Attribute
        } else if let (Some(Token::Name(name)), Some(Token::ColonColon)) =
            (self.peek(), self.peek_at(1))
        {
            let axis = Axis::from_name(name).ok_or_else(|| format!("unsupported axis {name}"))?;
            self.pos += 2;
            axis
        } else {
            Axis::Child
        };

        let test = match self.advance() {
            Some(Token::Star) => NodeTest::Any,
            Some(Token::Name(name)) if self.peek() == Some(&Token::LParen) => {
                let test = match name.as_str() {
                    "text" => NodeTest::Text,
                    "node" => NodeTest::Node,
                    "comment" => NodeTest::Comment,
                    other => return Err(format!("`{other}()` is not a node test")),
                };
                self.expect(Token::LParen)?;
                self.expect(Token::RParen)?;
                test
            }
            Some(Token::Name(name)) => NodeTest::Name(name.to_ascii_lowercase()),
            other => return Err(format!("expected node test, found {other:?}")),
        };

        Ok(Step {
            axis,
            test,
            predicates: self.parse_predicates()?,
        })
    }

    fn parse_predicates(&mut self) -> Result<Vec<Expr>, String> {
        let mut predicates = Vec::new();
        while self.eat(&Token::LBracket) {
            predicates.push(self.parse_expr()?);
            self.expect(Token::RBracket)?;
        }
        Ok(predicates)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Literal(text)) => Ok(Expr::Literal(text)),
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Name(name)) => {
                let function = Function::from_name(&name)
                    .ok_or_else(|| format!("unsupported function {name}()"))?;
                self.expect(Token::LParen)?;
                let mut args = Vec::new();
                if !self.eat(&Token::RParen) {
                    loop {
                        args.push(self.parse_expr()?);
                        if self.eat(&Token::RParen) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                    }
                }
                let (min, max) = function.arity();
                if args.len() < min || args.len() > max {
                    return Err(format!("{name}() takes {min}..{max} arguments"));
                }
                Ok(Expr::Call(function, args))
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}

/// Result of evaluating an expression.
#[derive(Debug, Clone)]
pub enum Value<'a> {
    Nodes(Vec<XNode<'a>>),
    Str(String),
    Num(f64),
    Bool(bool),
}

struct Context<'a> {
    node: XNode<'a>,
    position: usize,
    size: usize,
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn parse_number(text: &str) -> f64 {
    text.trim().parse().unwrap_or(f64::NAN)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl<'a> Value<'a> {
    fn to_bool(&self) -> bool {
        match self {
            Value::Nodes(nodes) => !nodes.is_empty(),
            Value::Str(s) => !s.is_empty(),
            Value::Num(n) => *n != 0.0 && !n.is_nan(),
            Value::Bool(b) => *b,
        }
    }

    fn to_string_in(&self, doc: &XDocument<'a>) -> String {
        match self {
            Value::Nodes(nodes) => nodes
                .first()
                .map(|n| doc.string_value(n))
                .unwrap_or_default(),
            Value::Str(s) => s.clone(),
            Value::Num(n) => format_number(*n),
            Value::Bool(b) => b.to_string(),
        }
    }

    fn to_number_in(&self, doc: &XDocument<'a>) -> f64 {
        match self {
            Value::Num(n) => *n,
            Value::Bool(b) => f64::from(u8::from(*b)),
            other => parse_number(&other.to_string_in(doc)),
        }
    }
}

fn compare_atoms(doc: &XDocument<'_>, op: CmpOp, left: &Value<'_>, right: &Value<'_>) -> bool {
    match op {
        CmpOp::Eq | CmpOp::Ne => {
            let equal = if matches!(left, Value::Bool(_)) || matches!(right, Value::Bool(_)) {
                left.to_bool() == right.to_bool()
            } else if matches!(left, Value::Num(_)) || matches!(right, Value::Num(_)) {
                left.to_number_in(doc) == right.to_number_in(doc)
            } else {
                left.to_string_in(doc) == right.to_string_in(doc)
            };
            (op == CmpOp::Eq) == equal
        }
        _ => {
            let (l, r) = (left.to_number_in(doc), right.to_number_in(doc));
            match l.partial_cmp(&r) {
                None => false,
                Some(ordering) => match op {
                    CmpOp::Lt => ordering == Ordering::Less,
                    CmpOp::Le => ordering != Ordering::Greater,
                    CmpOp::Gt => ordering == Ordering::Greater,
                    CmpOp::Ge => ordering != Ordering::Less,
                    CmpOp::Eq | CmpOp::Ne => false,
                },
            }
        }
    }
}

fn atomize<'a>(doc: &XDocument<'a>, node: &XNode<'a>, like: &Value<'a>) -> Value<'a> {
    let text = doc.string_value(node);
    match like {
        Value::Num(_) => Value::Num(parse_number(&text)),
        _ => Value::Str(text),
    }
}

fn compare<'a>(doc: &XDocument<'a>, op: CmpOp, left: &Value<'a>, right: &Value<'a>) -> bool {
    match (left, right) {
        (Value::Nodes(l), Value::Nodes(r)) => l.iter().any(|a| {
            let a = Value::Str(doc.string_value(a));
            r.iter()
                .any(|b| compare_atoms(doc, op, &a, &Value::Str(doc.string_value(b))))
        }),
        (Value::Nodes(l), Value::Bool(b)) => {
            compare_atoms(doc, op, &Value::Bool(!l.is_empty()), &Value::Bool(*b))
        }
        (Value::Bool(b), Value::Nodes(r)) => {
            compare_atoms(doc, op, &Value::Bool(*b), &Value::Bool(!r.is_empty()))
        }
        (Value::Nodes(l), atom) => l
            .iter()
            .any(|n| compare_atoms(doc, op, &atomize(doc, n, atom), atom)),
        (atom, Value::Nodes(r)) => r
            .iter()
            .any(|n| compare_atoms(doc, op, atom, &atomize(doc, n, atom))),
        (a, b) => compare_atoms(doc, op, a, b),
    }
}

fn eval<'a>(expr: &Expr, doc: &XDocument<'a>, ctx: &Context<'a>) -> Result<Value<'a>, String> {
    Ok(match expr {
        Expr::Or(a, b) => Value::Bool(eval(a, doc, ctx)?.to_bool() || eval(b, doc, ctx)?.to_bool()),
        Expr::And(a, b) => {
            Value::Bool(eval(a, doc, ctx)?.to_bool() && eval(b, doc, ctx)?.to_bool())
        }
        Expr::Compare(op, a, b) => {
            let (left, right) = (eval(a, doc, ctx)?, eval(b, doc, ctx)?);
            Value::Bool(compare(doc, *op, &left, &right))
        }
        Expr::Add(a, b) => Value::Num(
            eval(a, doc, ctx)?.to_number_in(doc) + eval(b, doc, ctx)?.to_number_in(doc),
        ),
        Expr::Sub(a, b) => Value::Num(
            eval(a, doc, ctx)?.to_number_in(doc) - eval(b, doc, ctx)?.to_number_in(doc),
        ),
        Expr::Neg(a) => Value::Num(-eval(a, doc, ctx)?.to_number_in(doc)),
        Expr::Union(a, b) => match (eval(a, doc, ctx)?, eval(b, doc, ctx)?) {
            (Value::Nodes(mut left), Value::Nodes(right)) => {
                left.extend(right);
                doc.sort_dedup(&mut left);
                Value::Nodes(left)
            }
            _ => return Err("union operands must be node-sets".to_string()),
        },
        Expr::Path { absolute, steps } => {
            let start = if *absolute { XNode::Root } else { ctx.node };
            Value::Nodes(eval_steps(doc, vec![start], steps)?)
        }
        Expr::Filter {
            primary,
            predicates,
            steps,
        } => {
            let Value::Nodes(mut nodes) = eval(primary, doc, ctx)? else {
                return Err("predicates and steps need a node-set".to_string());
            };
            doc.sort_dedup(&mut nodes);
            for predicate in predicates {
                nodes = apply_predicate(doc, nodes, predicate)?;
            }
            Value::Nodes(eval_steps(doc, nodes, steps)?)
        }
        Expr::Literal(text) => Value::Str(text.clone()),
        Expr::Number(n) => Value::Num(*n),
        Expr::Call(function, args) => call(*function, args, doc, ctx)?,
    })
}

fn call<'a>(
    function: Function,
    args: &[Expr],
    doc: &XDocument<'a>,
    ctx: &Context<'a>,
) -> Result<Value<'a>, String> {
    let arg_string = |index: usize| -> Result<String, String> {
        match args.get(index) {
            Some(arg) => Ok(eval(arg, doc, ctx)?.to_string_in(doc)),
            None => Ok(doc.string_value(&ctx.node)),
        }
    };

    Ok(match function {
        Function::Last => Value::Num(ctx.size as f64),
        Function::Position => Value::Num(ctx.position as f64),
        Function::Count => match eval(&args[0], doc, ctx)? {
            Value::Nodes(nodes) => Value::Num(nodes.len() as f64),
            _ => return Err("count() needs a node-set".to_string()),
        },
        Function::Contains => Value::Bool(arg_string(0)?.contains(&arg_string(1)?)),
        Function::StartsWith => Value::Bool(arg_string(0)?.starts_with(&arg_string(1)?)),
        Function::NormalizeSpace => Value::Str(collapse_whitespace(&arg_string(0)?)),
        Function::Not => Value::Bool(!eval(&args[0], doc, ctx)?.to_bool()),
        Function::String => Value::Str(arg_string(0)?),
        Function::Concat => {
            let mut out = String::new();
            for index in 0..args.len() {
                out.push_str(&arg_string(index)?);
            }
            Value::Str(out)
        }
        Function::StringLength => Value::Num(arg_string(0)?.chars().count() as f64),
        Function::True => Value::Bool(true),
        Function::False => Value::Bool(false),
    })
}

fn apply_predicate<'a>(
    doc: &XDocument<'a>,
    nodes: Vec<XNode<'a>>,
    predicate: &Expr,
) -> Result<Vec<XNode<'a>>, String> {
    let size = nodes.len();
    let mut kept = Vec::with_capacity(size);
    for (index, node) in nodes.into_iter().enumerate() {
        let ctx = Context {
            node,
            position: index + 1,
            size,
        };
        let keep = match eval(predicate, doc, &ctx)? {
            Value::Num(n) => n == (index + 1) as f64,
            other => other.to_bool(),
        };
        if keep {
            kept.push(node);
        }
    }
    Ok(kept)
}

fn eval_steps<'a>(
    doc: &XDocument<'a>,
    mut nodes: Vec<XNode<'a>>,
    steps: &[Step],
) -> Result<Vec<XNode<'a>>, String> {
    for step in steps {
        let mut next = Vec::new();
        for node in &nodes {
            let mut candidates: Vec<XNode<'a>> = doc
                .axis(node, step.axis)
                .into_iter()
                .filter(|candidate| step.accepts(candidate))
                .collect();
            for predicate in &step.predicates {
                candidates = apply_predicate(doc, candidates, predicate)?;
            }
            next.extend(candidates);
        }
        doc.sort_dedup(&mut next);
        nodes = next;
    }
    Ok(nodes)
}

/// A compiled expression.
#[derive(Debug, Clone, PartialEq)]
pub struct XPath {
    source: String,
    expr: Expr,
}

impl XPath {
    pub fn parse(source: &str) -> Result<Self, XPathError> {
        let fail = |message: String| XPathError {
            expression: source.to_string(),
            message,
        };
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err(fail("empty expression".to_string()));
        }
        let tokens = tokenize(trimmed).map_err(fail)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_expr().map_err(fail)?;
        if let Some(token) = parser.peek() {
            return Err(fail(format!("trailing input at {token:?}")));
        }
        Ok(Self {
            source: trimmed.to_string(),
            expr,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn evaluate<'a>(
        &self,
        doc: &XDocument<'a>,
        context: XNode<'a>,
    ) -> Result<Value<'a>, XPathError> {
        let ctx = Context {
            node: context,
            position: 1,
            size: 1,
        };
        eval(&self.expr, doc, &ctx).map_err(|message| XPathError {
            expression: self.source.clone(),
            message,
        })
    }

    /// Evaluates to a node-set in document order.
    pub fn select<'a>(
        &self,
        doc: &XDocument<'a>,
        context: XNode<'a>,
    ) -> Result<Vec<XNode<'a>>, XPathError> {
        match self.evaluate(doc, context)? {
            Value::Nodes(nodes) => Ok(nodes),
            _ => Err(XPathError {
                expression: self.source.clone(),
                message: "expression does not select nodes".to_string(),
            }),
        }
    }

    /// String value of the expression, as XPath `string()` would give it.
    pub fn string<'a>(&self, doc: &XDocument<'a>, context: XNode<'a>) -> Result<String, XPathError> {
        Ok(self.evaluate(doc, context)?.to_string_in(doc))
    }
}
