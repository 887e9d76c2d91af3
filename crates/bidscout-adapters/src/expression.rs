//! Field expressions: `<xpath>[|-<target>[|-<callback>]]`.

use bidscout_core::MULTI_VALUE_SEPARATOR;

use crate::callback::{Callback, CallbackError};
use crate::xpath::{XPath, XPathError};

/// What to read from the matched nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Trimmed, whitespace-collapsed text of the first node.
    Text,
    /// Text of every node joined with the multi-value separator.
    Content,
    /// Full text content of the first node only.
    First,
    OuterHtml,
    InnerHtml,
    Attribute(String),
}

impl Target {
    fn parse(slot: &str) -> Self {
        let slot = slot.trim();
        match slot.to_ascii_lowercase().as_str() {
            "" | "text" => Target::Text,
            "content" => Target::Content,
            "first" => Target::First,
            "outerhtml" => Target::OuterHtml,
            "innerhtml" | "html" => Target::InnerHtml,
            _ => Target::Attribute(slot.trim_start_matches('@').to_string()),
        }
    }
}

/// Post-processing attached to a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostProcess {
    Program(Callback),
    /// Constant replacement value.
    Literal(String),
    /// Looked like a program but failed to compile; the raw value is kept.
    Rejected(CallbackError),
}

impl PostProcess {
    /// Text mentioning `rst` or containing a call must compile; anything
    /// else that does not compile is taken as a constant.
    pub fn parse(source: &str) -> Option<Self> {
        let source = source.trim();
        if source.is_empty() {
            return None;
        }
        let looks_like_code = source.contains("rst") || source.contains('(');
        Some(match Callback::compile(source) {
            Ok(program) => PostProcess::Program(program),
            Err(err) if looks_like_code => PostProcess::Rejected(err),
            Err(_) => PostProcess::Literal(source.to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldExpression {
    pub source: String,
    pub xpath: XPath,
    pub target: Target,
    pub post: Option<PostProcess>,
}

impl FieldExpression {
    pub fn parse(source: &str) -> Result<Self, XPathError> {
        let mut parts = source.splitn(3, MULTI_VALUE_SEPARATOR);
        let xpath = XPath::parse(parts.next().unwrap_or_default())?;
        let target = parts.next().map(Target::parse).unwrap_or(Target::Text);
        let post = parts.next().and_then(PostProcess::parse);
        Ok(Self {
            source: source.trim().to_string(),
            xpath,
            target,
            post,
        })
    }
}
