use std::collections::HashSet;
use std::fmt;

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::transform::Transform;
use crate::types::TransformError;

/// JSON half of a crawl result line.
#[derive(Debug, Deserialize)]
struct CrawlResult {
    final_url: String,
    #[serde(default)]
    html: Option<String>,
}

/// Title and images of one crawled page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageSummary {
    pub landing_page: String,
    pub title: String,
    pub images: Vec<String>,
}

impl fmt::Display for PageSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

/// Summarizes crawl result lines of the form `url\t{"final_url":..,"html":..}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PageSummaryTransform;

#[async_trait::async_trait]
impl Transform for PageSummaryTransform {
    type Output = PageSummary;

    async fn process(&self, raw: &[u8]) -> Result<PageSummary, TransformError> {
        let line =
            std::str::from_utf8(raw).map_err(|err| TransformError::Malformed(err.to_string()))?;
        let (_url, json) = line
            .split_once('\t')
            .ok_or_else(|| TransformError::Malformed("expected `url<TAB>json`".into()))?;
        let crawl: CrawlResult = serde_json::from_str(json)?;
        Ok(summarize(crawl))
    }
}

fn summarize(crawl: CrawlResult) -> PageSummary {
    let Some(html) = crawl.html.as_deref() else {
        return PageSummary {
            landing_page: crawl.final_url,
            title: String::new(),
            images: Vec::new(),
        };
    };

    let doc = Html::parse_document(html);
    let base = Url::parse(&crawl.final_url).ok();

    let title = Selector::parse("title")
        .ok()
        .and_then(|sel| {
            doc.select(&sel)
                .next()
                .map(|t| t.text().collect::<String>().trim().to_string())
        })
        .unwrap_or_default();

    let mut seen = HashSet::new();
    let mut images = Vec::new();
    if let Ok(sel) = Selector::parse("img[src]") {
        for img in doc.select(&sel) {
            let Some(src) = img.value().attr("src") else {
                continue;
            };
            if let Some(url) = resolve_url(src, base.as_ref()) {
                let url = String::from(url);
                if seen.insert(url.clone()) {
                    images.push(url);
                }
            }
        }
    }

    PageSummary {
        landing_page: crawl.final_url,
        title,
        images,
    }
}

fn resolve_url(reference: &str, base: Option<&Url>) -> Option<Url> {
    let trimmed = reference.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    if trimmed
        .get(..5)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("data:"))
    {
        return None;
    }
    if let Ok(url) = Url::parse(trimmed) {
        return Some(url);
    }
    base.and_then(|base| base.join(trimmed).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn crawl_line(final_url: &str, html: &str) -> Vec<u8> {
        let json = serde_json::json!({ "final_url": final_url, "html": html });
        format!("http://origin.test/\t{json}").into_bytes()
    }

    #[tokio::test]
    async fn extracts_title_and_resolved_images() {
        let html = r#"<html><head><title> Shop </title></head><body>
            <img src="/a.png"><img src="b.jpg"><img src="/a.png">
            <img src="https://cdn.test/c.gif"><img src="data:image/png;base64,AA"><img>
            </body></html>"#;
        let line = crawl_line("http://site.test/dir/page.html", html);

        let summary = PageSummaryTransform.process(&line).await.unwrap();
        assert_eq!(
            summary,
            PageSummary {
                landing_page: "http://site.test/dir/page.html".into(),
                title: "Shop".into(),
                images: vec![
                    "http://site.test/a.png".into(),
                    "http://site.test/dir/b.jpg".into(),
                    "https://cdn.test/c.gif".into(),
                ],
            }
        );
    }

    #[tokio::test]
    async fn missing_html_yields_empty_summary() {
        let line = b"http://a.test/\t{\"final_url\":\"http://a.test/\"}";
        let summary = PageSummaryTransform.process(line).await.unwrap();
        assert_eq!(summary.title, "");
        assert!(summary.images.is_empty());
    }

    #[tokio::test]
    async fn line_without_tab_is_malformed() {
        let err = PageSummaryTransform.process(b"no tab here").await.unwrap_err();
        assert!(matches!(err, TransformError::Malformed(_)));
    }

    #[test]
    fn display_is_single_line_json() {
        let summary = PageSummary {
            landing_page: "http://a.test/".into(),
            title: "A".into(),
            images: vec!["http://a.test/x.png".into()],
        };
        assert_eq!(
            summary.to_string(),
            r#"{"landing_page":"http://a.test/","title":"A","images":["http://a.test/x.png"]}"#
        );
    }
}
