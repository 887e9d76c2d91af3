use bidscout_core::MULTI_VALUE_SEPARATOR;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::expression::{FieldExpression, PostProcess, Target};
use crate::xpath::{XDocument, XNode};

/// Non-fatal extraction problem for one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDiagnostic {
    pub field: String,
    pub expression: String,
    pub message: String,
}

/// Extracted value plus any diagnostic raised on the way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extracted {
    pub value: String,
    pub diagnostic: Option<FieldDiagnostic>,
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn node_text(doc: &XDocument<'_>, node: &XNode<'_>) -> String {
    // Direct text children win; fall back to the full text content.
    let direct: Vec<String> = match node {
        XNode::Element(el) => el
            .children()
            .filter_map(|child| child.value().as_text().map(|t| t.trim().to_string()))
            .filter(|t| !t.is_empty())
            .collect(),
        _ => Vec::new(),
    };
    if direct.is_empty() {
        collapse_whitespace(&doc.string_value(node))
    } else {
        collapse_whitespace(&direct.join(" "))
    }
}

fn read_target(doc: &XDocument<'_>, node: &XNode<'_>, target: &Target) -> String {
    match target {
        Target::Text | Target::Content => node_text(doc, node),
        Target::First => collapse_whitespace(&doc.string_value(node)),
        Target::OuterHtml => doc.outer_html(node).trim().to_string(),
        Target::InnerHtml => doc.inner_html(node).trim().to_string(),
        Target::Attribute(name) => match node {
            XNode::Element(el) => el.value().attr(name).unwrap_or_default().trim().to_string(),
            other => doc.string_value(other).trim().to_string(),
        },
    }
}

/// Evaluates `expr` against `context`. Failures yield an empty value and a
/// diagnostic; they never abort the caller.
pub fn extract_field(
    doc: &XDocument<'_>,
    context: XNode<'_>,
    field: &str,
    expr: &FieldExpression,
    multi_valued: bool,
) -> Extracted {
    let diagnostic = |message: String| FieldDiagnostic {
        field: field.to_string(),
        expression: expr.source.clone(),
        message,
    };

    let nodes = match expr.xpath.select(doc, context) {
        Ok(nodes) => nodes,
        Err(err) => {
            return Extracted {
                value: String::new(),
                diagnostic: Some(diagnostic(err.message)),
            }
        }
    };
    if nodes.is_empty() {
        return Extracted {
            value: String::new(),
            diagnostic: Some(diagnostic("selector matched nothing".to_string())),
        };
    }

    let raw_values: Vec<String> = if multi_valued || expr.target == Target::Content {
        nodes
            .iter()
            .map(|n| read_target(doc, n, &expr.target))
            .collect()
    } else {
        vec![read_target(doc, &nodes[0], &expr.target)]
    };

    let mut issue = None;
    let values: Vec<String> = raw_values
        .into_iter()
        .map(|raw| apply_post(raw, expr, field, &mut issue))
        .collect();

    Extracted {
        value: values.join(MULTI_VALUE_SEPARATOR),
        diagnostic: issue,
    }
}

fn apply_post(
    raw: String,
    expr: &FieldExpression,
    field: &str,
    issue: &mut Option<FieldDiagnostic>,
) -> String {
    let diagnostic = |message: String| FieldDiagnostic {
        field: field.to_string(),
        expression: expr.source.clone(),
        message,
    };
    match &expr.post {
        _ if raw.is_empty() => raw,
        None => raw,
        Some(PostProcess::Literal(text)) => text.clone(),
        Some(PostProcess::Rejected(err)) => {
            issue.get_or_insert_with(|| diagnostic(err.to_string()));
            raw
        }
        Some(PostProcess::Program(program)) => match program.apply(&raw) {
            Ok(value) => value.trim().to_string(),
            Err(err) => {
                debug!(field, error = %err, "callback failed, keeping raw value");
                issue.get_or_insert_with(|| diagnostic(err.to_string()));
                raw
            }
        },
    }
}

/// Reads an attachment list: one value per matched node, empty slots left
/// out. Text is read uncollapsed so that, with `first_line`, only the first
/// non-blank line of each node survives the callback (`공고문.hwp` out of
/// `공고문.hwp\n(120KB)`).
pub fn extract_attachments(
    doc: &XDocument<'_>,
    context: XNode<'_>,
    field: &str,
    expr: &FieldExpression,
    first_line: bool,
) -> Extracted {
    let diagnostic = |message: String| FieldDiagnostic {
        field: field.to_string(),
        expression: expr.source.clone(),
        message,
    };
    let nodes = match expr.xpath.select(doc, context) {
        Ok(nodes) if nodes.is_empty() => {
            return Extracted {
                value: String::new(),
                diagnostic: Some(diagnostic("selector matched nothing".to_string())),
            }
        }
        Ok(nodes) => nodes,
        Err(err) => {
            return Extracted {
                value: String::new(),
                diagnostic: Some(diagnostic(err.message)),
            }
        }
    };

    let mut issue = None;
    let values: Vec<String> = nodes
        .iter()
        .map(|node| match &expr.target {
            Target::Text | Target::Content | Target::First => {
                doc.string_value(node).trim().to_string()
            }
            other => read_target(doc, node, other),
        })
        .filter(|raw| !raw.is_empty())
        .map(|raw| apply_post(raw, expr, field, &mut issue))
        .map(|value| {
            let value = if first_line {
                value
                    .trim()
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .to_string()
            } else {
                value
            };
            collapse_whitespace(&value)
        })
        .filter(|value| !value.is_empty())
        .collect();

    Extracted {
        value: values.join(MULTI_VALUE_SEPARATOR),
        diagnostic: issue,
    }
}

/// Exception-row predicates skip a row when they yield anything truthy.
pub fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    !(value.is_empty() || value == "0" || value.eq_ignore_ascii_case("false"))
}
