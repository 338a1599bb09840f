//! HTML listing page adapter.
//!
//! Scrapes an index page where each announcement is one repeated element,
//! using the CSS selectors configured for the source.

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use tracing::info;

use regwatch_shared::{
    CandidateRecord, ListingSelectors, RegwatchError, Result, SourceConfig, SourceLimits,
};

use super::{AdapterOutput, SourceAdapter, resolve_link};
use crate::dates::parse_date;
use crate::fetch::HttpFetcher;

/// Scrapes announcement listings with configured selectors.
#[derive(Debug, Clone)]
pub struct ListingAdapter {
    fetcher: HttpFetcher,
}

impl ListingAdapter {
    pub fn new(fetcher: HttpFetcher) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl SourceAdapter for ListingAdapter {
    async fn fetch(&self, source: &SourceConfig, limits: &SourceLimits) -> AdapterOutput {
        let Some(selectors) = source.selectors.as_ref() else {
            return AdapterOutput::failed(RegwatchError::adapter(
                &source.code,
                "html_listing source has no selectors",
            ));
        };
        // Fail fast on bad selectors before touching the network.
        if let Err(e) = CompiledSelectors::compile(&source.code, selectors) {
            return AdapterOutput::failed(e);
        }

        let mut output = AdapterOutput::default();
        for page_url in &source.urls {
            let body = match self.fetcher.get_text(&source.code, page_url, limits.timeout).await {
                Ok(body) => body,
                Err(e) => {
                    output.note_error(e);
                    continue;
                }
            };
            match extract_listing(&source.code, selectors, page_url, &body) {
                Ok(records) => {
                    info!(source = %source.code, page_url, items = records.len(), "listing: parsed");
                    output.records.extend(records);
                }
                Err(e) => output.note_error(e),
            }
        }
        output
    }

    fn name(&self) -> &str {
        "html_listing"
    }
}

/// Parse one listing page into candidates, in page order.
pub fn extract_listing(
    authority: &str,
    selectors: &ListingSelectors,
    page_url: &str,
    body: &str,
) -> Result<Vec<CandidateRecord>> {
    let compiled = CompiledSelectors::compile(authority, selectors)?;
    Ok(compiled.extract(authority, page_url, body))
}

struct CompiledSelectors {
    item: Selector,
    headline: Selector,
    link: Option<Selector>,
    date: Option<Selector>,
    summary: Option<Selector>,
    anchor: Selector,
}

fn compile(source: &str, css: &str) -> Result<Selector> {
    Selector::parse(css)
        .map_err(|e| RegwatchError::adapter(source, format!("invalid selector '{css}': {e}")))
}

impl CompiledSelectors {
    fn compile(source: &str, s: &ListingSelectors) -> Result<Self> {
        Ok(Self {
            item: compile(source, &s.item)?,
            headline: compile(source, &s.headline)?,
            link: s.link.as_deref().map(|css| compile(source, css)).transpose()?,
            date: s.date.as_deref().map(|css| compile(source, css)).transpose()?,
            summary: s.summary.as_deref().map(|css| compile(source, css)).transpose()?,
            anchor: compile(source, "a[href]")?,
        })
    }

    fn extract(&self, authority: &str, page_url: &str, body: &str) -> Vec<CandidateRecord> {
        let doc = Html::parse_document(body);
        doc.select(&self.item)
            .filter_map(|item| {
                let headline_el = item.select(&self.headline).next()?;
                let headline = element_text(&headline_el);

                let link_el = match &self.link {
                    Some(sel) => item.select(sel).next(),
                    None => Some(headline_el),
                };
                let url = link_el
                    .and_then(|el| self.href_of(&el))
                    .map(|href| resolve_link(page_url, &href))
                    .unwrap_or_default();

                let published = self
                    .date
                    .as_ref()
                    .and_then(|sel| item.select(sel).next())
                    .and_then(|el| {
                        el.value()
                            .attr("datetime")
                            .and_then(parse_date)
                            .or_else(|| parse_date(&element_text(&el)))
                    });

                let mut record = CandidateRecord::new(headline, url, authority, published);
                if let Some(summary) = self
                    .summary
                    .as_ref()
                    .and_then(|sel| item.select(sel).next())
                    .map(|el| element_text(&el))
                    .filter(|s| !s.is_empty())
                {
                    record = record.with_field("summary", summary);
                }
                Some(record)
            })
            .collect()
    }

    /// The element's own `href`, or that of its first descendant anchor.
    fn href_of(&self, el: &ElementRef<'_>) -> Option<String> {
        el.value()
            .attr("href")
            .or_else(|| {
                el.select(&self.anchor)
                    .next()
                    .and_then(|a| a.value().attr("href"))
            })
            .map(str::to_string)
    }
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}
