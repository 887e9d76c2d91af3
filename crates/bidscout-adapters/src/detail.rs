use std::collections::BTreeMap;

use bidscout_core::{DetailField, OrganizationDetailConfig, ScrapeError, MULTI_VALUE_SEPARATOR};
use bidscout_storage::resolve_url;
use scraper::Html;
use serde::Serialize;
use tracing::{info, info_span, Instrument};

use crate::context::ScrapeContext;
use crate::expression::FieldExpression;
use crate::extract::{extract_attachments, extract_field, FieldDiagnostic};
use crate::fetch::{fetch_page, FetchPlan, FetchStrategy, PageFetcher, Sufficiency};
use crate::xpath::{XDocument, XNode};

/// Field map of one detail page keyed by field name, plus how it was fetched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DetailScrape {
    pub fields: BTreeMap<String, String>,
    pub strategy: Option<FetchStrategy>,
    pub diagnostics: Vec<FieldDiagnostic>,
    #[serde(skip)]
    pub error: Option<ScrapeError>,
}

impl DetailScrape {
    pub fn field(&self, field: DetailField) -> Option<&str> {
        self.fields.get(field.as_str()).map(String::as_str)
    }
}

fn resolve_each(page_url: &str, value: &str) -> String {
    value
        .split(MULTI_VALUE_SEPARATOR)
        .map(|href| resolve_url(page_url, href).unwrap_or_else(|| href.to_string()))
        .collect::<Vec<_>>()
        .join(MULTI_VALUE_SEPARATOR)
}

fn extract_detail(
    page_url: &str,
    html: &str,
    expressions: &[(DetailField, FieldExpression)],
    out: &mut DetailScrape,
) {
    let parsed = Html::parse_document(html);
    let doc = XDocument::new(&parsed);
    for (field, expr) in expressions {
        let name = field.as_str();
        let extracted = match field {
            DetailField::FileName => extract_attachments(&doc, XNode::Root, name, expr, true),
            DetailField::FileUrl => extract_attachments(&doc, XNode::Root, name, expr, false),
            _ => extract_field(&doc, XNode::Root, name, expr, field.is_multi_valued()),
        };
        if let Some(diagnostic) = extracted.diagnostic {
            out.diagnostics.push(diagnostic);
        }
        let value = match field {
            DetailField::FileUrl if !extracted.value.is_empty() => {
                resolve_each(page_url, &extracted.value)
            }
            _ => extracted.value,
        };
        out.fields.insert(name.to_string(), value);
    }
}

/// Scrapes one notice's detail page. Expressions that fail to parse are
/// reported as diagnostics and leave their field empty.
pub async fn scrape_detail(
    fetcher: &dyn PageFetcher,
    org_name: &str,
    url: &str,
    config: &OrganizationDetailConfig,
    ctx: &ScrapeContext,
) -> DetailScrape {
    let span = info_span!("scrape_detail", run_id = %ctx.run_id, org_name, url);
    async move {
        let mut out = DetailScrape::default();
        let mut expressions = Vec::with_capacity(config.fields.len());
        for (field, source) in &config.fields {
            match FieldExpression::parse(source) {
                Ok(expr) => expressions.push((*field, expr)),
                Err(err) => {
                    out.diagnostics.push(FieldDiagnostic {
                        field: field.as_str().to_string(),
                        expression: source.clone(),
                        message: err.message,
                    });
                    out.fields.insert(field.as_str().to_string(), String::new());
                }
            }
        }

        let title = expressions
            .iter()
            .find(|(field, _)| *field == DetailField::Title)
            .map(|(_, expr)| expr);
        let mut plan = FetchPlan::new(
            url,
            title.map(Sufficiency::Field).unwrap_or(Sufficiency::LengthOnly),
        );
        plan.wait_for = title.map(|expr| expr.xpath.as_str().to_string());

        match fetch_page(fetcher, ctx, org_name, &plan).await {
            Ok(page) => {
                ctx.dump_page(org_name, "detail", &page.html).await;
                out.strategy = Some(page.strategy);
                extract_detail(&page.url, &page.html, &expressions, &mut out);
            }
            Err(err) => out.error = Some(err),
        }

        out.fields.insert("detail_url".to_string(), url.to_string());
        out.fields.insert("org_name".to_string(), org_name.to_string());
        info!(
            strategy = ?out.strategy,
            fields = out.fields.len(),
            diagnostics = out.diagnostics.len(),
            failed = out.error.is_some(),
            "detail scrape finished"
        );
        out
    }
    .instrument(span)
    .await
}
