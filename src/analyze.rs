//! Page analysis.
//!
//! Backs `POST /analyze`: fetches a page and reports repeated element
//! groups, a suggested extraction schema, and candidate follow selectors
//! and patterns for a subsequent crawl. Detection is structural — elements
//! bucketed by tag-and-class signature, groups of three or more treated as
//! listing entries.

use crate::error::{ExtractError, ExtractResult};
use crate::pipeline::{FetchKind, FetchMode, Fetcher};
use crate::tier::TierLimits;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

/// Groups with at least this many same-signature elements count as
/// repeated structure.
const MIN_GROUP: usize = 3;
/// Sample texts reported per detected group.
const SAMPLE_LIMIT: usize = 3;
const SAMPLE_CHARS: usize = 80;

/// One repeated element group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedElement {
    /// CSS selector addressing the group.
    pub selector: String,
    pub count: usize,
    pub sample_text: Vec<String>,
    /// Whether the group's elements carry links.
    pub has_links: bool,
}

/// Analysis result for one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageAnalysis {
    pub url: String,
    pub detected_elements: Vec<DetectedElement>,
    /// Field-name → type-guess schema for the dominant group.
    pub suggested_schema: serde_json::Value,
    pub follow_selectors: Vec<String>,
    /// URL-path regexes that bucket at least [`MIN_GROUP`] links.
    pub follow_patterns: Vec<String>,
}

pub struct PageAnalyzer {
    fetcher: Arc<dyn Fetcher>,
}

impl PageAnalyzer {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self { fetcher }
    }

    /// Fetch and analyze one page.
    pub async fn analyze(
        &self,
        url: &str,
        fetch_mode: FetchMode,
        limits: &TierLimits,
    ) -> ExtractResult<PageAnalysis> {
        let (kind, timeout) = match fetch_mode {
            FetchMode::Dynamic => (FetchKind::Dynamic, limits.dynamic_fetch_timeout),
            _ => (FetchKind::Static, limits.static_fetch_timeout),
        };
        let page = self.fetcher.fetch(url, kind, timeout).await?;
        let base = Url::parse(&page.final_url)
            .or_else(|_| Url::parse(url))
            .map_err(|e| ExtractError::invalid_response(format!("page URL did not parse: {e}")))?;
        Ok(analyze_html(&page.content, &base))
    }
}

/// Structural analysis of one document. Pure so tests can drive it with
/// fixture HTML.
pub fn analyze_html(html: &str, base: &Url) -> PageAnalysis {
    let document = Html::parse_document(html);

    // Bucket elements by (tag, sorted classes).
    let mut groups: HashMap<String, Vec<ElementRef>> = HashMap::new();
    for node in document.root_element().descendants() {
        let Some(element) = ElementRef::wrap(node) else {
            continue;
        };
        let tag = element.value().name();
        if matches!(tag, "html" | "head" | "body" | "script" | "style" | "meta" | "link") {
            continue;
        }
        let mut classes: Vec<&str> = element.value().classes().collect();
        if classes.is_empty() {
            continue;
        }
        classes.sort_unstable();
        let signature = format!("{tag}.{}", classes.join("."));
        groups.entry(signature).or_default().push(element);
    }

    let mut detected: Vec<DetectedElement> = groups
        .iter()
        .filter(|(_, elements)| elements.len() >= MIN_GROUP)
        .filter_map(|(signature, elements)| {
            let sample_text: Vec<String> = elements
                .iter()
                .filter_map(|el| {
                    let text = el.text().collect::<String>();
                    let trimmed = text.split_whitespace().collect::<Vec<_>>().join(" ");
                    (!trimmed.is_empty()).then(|| truncate(&trimmed, SAMPLE_CHARS))
                })
                .take(SAMPLE_LIMIT)
                .collect();
            if sample_text.is_empty() {
                return None;
            }
            let has_links = elements.iter().any(|el| contains_link(el));
            Some(DetectedElement {
                selector: signature.clone(),
                count: elements.len(),
                sample_text,
                has_links,
            })
        })
        .collect();
    detected.sort_by(|a, b| b.count.cmp(&a.count).then(a.selector.cmp(&b.selector)));

    let suggested_schema = suggest_schema(detected.first(), &groups);

    let follow_selectors: Vec<String> = detected
        .iter()
        .filter(|d| d.has_links)
        .map(|d| {
            if d.selector.starts_with("a.") {
                d.selector.clone()
            } else {
                format!("{} a", d.selector)
            }
        })
        .take(3)
        .collect();

    let follow_patterns = link_patterns(&document, base);

    PageAnalysis {
        url: base.to_string(),
        detected_elements: detected,
        suggested_schema,
        follow_selectors,
        follow_patterns,
    }
}

fn contains_link(element: &ElementRef) -> bool {
    element.value().name() == "a" || has_descendant(element, "a")
}

fn has_descendant(element: &ElementRef, tag: &str) -> bool {
    element
        .descendants()
        .filter_map(ElementRef::wrap)
        .any(|el| el.value().name() == tag)
}

/// Field guesses for the dominant repeated group.
fn suggest_schema(
    dominant: Option<&DetectedElement>,
    groups: &HashMap<String, Vec<ElementRef>>,
) -> serde_json::Value {
    let Some(dominant) = dominant else {
        // No repeated structure: suggest a single-record scrape.
        return json!({"title": "string", "description": "string"});
    };

    let mut fields = serde_json::Map::new();
    fields.insert("title".to_string(), json!("string"));
    if let Some(elements) = groups.get(&dominant.selector) {
        if elements.iter().any(|el| contains_link(el)) {
            fields.insert("url".to_string(), json!("string"));
        }
        let has_image = elements.iter().any(|el| has_descendant(el, "img"));
        if has_image {
            fields.insert("image".to_string(), json!("string"));
        }
        let has_price = elements.iter().any(|el| {
            let text = el.text().collect::<String>();
            text.contains('$') || text.contains('€') || text.contains('£')
        });
        if has_price {
            fields.insert("price".to_string(), json!("string"));
        }
    }
    json!({ "items": [serde_json::Value::Object(fields)] })
}

/// Path-prefix regexes covering at least [`MIN_GROUP`] same-host links.
fn link_patterns(document: &Html, base: &Url) -> Vec<String> {
    let Ok(anchors) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let mut segment_counts: HashMap<String, usize> = HashMap::new();
    for href in document
        .select(&anchors)
        .filter_map(|el| el.value().attr("href"))
    {
        let Some(url) = crate::crawl::discovery::normalize(base, href) else {
            continue;
        };
        if url.host_str() != base.host_str() {
            continue;
        }
        if let Some(segment) = url
            .path_segments()
            .and_then(|mut segments| segments.next())
            .filter(|s| !s.is_empty())
        {
            *segment_counts.entry(segment.to_string()).or_insert(0) += 1;
        }
    }

    let mut patterns: Vec<(usize, String)> = segment_counts
        .into_iter()
        .filter(|(_, count)| *count >= MIN_GROUP)
        .map(|(segment, count)| (count, format!("/{}/.+", regex::escape(&segment))))
        .collect();
    patterns.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    patterns.into_iter().map(|(_, pattern)| pattern).collect()
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        text.chars().take(limit).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r##"<html><body>
      <div class="product"><a href="/items/1">Widget <span class="price">$9</span></a></div>
      <div class="product"><a href="/items/2">Gadget <span class="price">$19</span></a></div>
      <div class="product"><a href="/items/3">Sprocket <span class="price">$29</span></a></div>
      <div class="footer">About</div>
      <a href="/about">About us</a>
    </body></html>"##;

    fn base() -> Url {
        Url::parse("https://shop.test/listing").unwrap()
    }

    #[test]
    fn repeated_groups_are_detected() {
        let analysis = analyze_html(LISTING, &base());
        let product = analysis
            .detected_elements
            .iter()
            .find(|d| d.selector == "div.product")
            .expect("product group detected");
        assert_eq!(product.count, 3);
        assert!(product.has_links);
        assert!(!product.sample_text.is_empty());
        // Below-threshold groups stay out.
        assert!(analysis
            .detected_elements
            .iter()
            .all(|d| d.selector != "div.footer"));
    }

    #[test]
    fn schema_guesses_fields_from_dominant_group() {
        let analysis = analyze_html(LISTING, &base());
        let items = &analysis.suggested_schema["items"][0];
        assert_eq!(items["title"], "string");
        assert_eq!(items["url"], "string");
        assert_eq!(items["price"], "string");
    }

    #[test]
    fn follow_candidates_cover_the_listing_links() {
        let analysis = analyze_html(LISTING, &base());
        assert!(analysis
            .follow_selectors
            .iter()
            .any(|s| s.contains("div.product")));
        assert_eq!(analysis.follow_patterns, vec!["/items/.+".to_string()]);
    }

    #[test]
    fn pages_without_repeated_structure_get_a_flat_schema() {
        let html = "<html><body><article class=\"post\">One story</article></body></html>";
        let analysis = analyze_html(html, &base());
        assert!(analysis.detected_elements.is_empty());
        assert_eq!(analysis.suggested_schema["title"], "string");
    }
}
