//! URL discovery for crawl jobs.
//!
//! Three sources feed the frontier: sitemap.xml from the seed origin,
//! CSS-selector link collection from fetched pages, and the depth-preserving
//! `next_selector` successor. Every candidate passes through the same
//! normalization (scheme check, fragment strip, host-case canonicalization)
//! and filter (domain scoping, follow pattern) before admission.

use crate::error::ExtractResult;
use crate::pipeline::{FetchKind, Fetcher};
use crate::logging::log_debug;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use std::time::Duration;
use url::Url;

/// Selector used when a crawl specifies none.
pub const DEFAULT_FOLLOW_SELECTOR: &str = "a[href]";

static SITEMAP_LOC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<loc>\s*([^<]+?)\s*</loc>").expect("sitemap loc pattern"));

/// Normalize a raw href against its base page.
///
/// Returns `None` for non-HTTP(S) schemes and unparseable values. The
/// fragment is stripped and the host lowercased so the dedup set treats
/// `HTTPS://Ex.Test/a#top` and `https://ex.test/a` as the same URL.
pub fn normalize(base: &Url, raw: &str) -> Option<Url> {
    let mut url = base.join(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    if let Some(host) = url.host_str() {
        let lowered = host.to_lowercase();
        if lowered != host {
            url.set_host(Some(&lowered)).ok()?;
        }
    }
    Some(url)
}

/// Admission filter applied after normalization.
pub fn passes_filters(
    url: &Url,
    seed_host: &str,
    same_domain_only: bool,
    follow_pattern: Option<&Regex>,
) -> bool {
    if same_domain_only && url.host_str() != Some(seed_host) {
        return false;
    }
    if let Some(pattern) = follow_pattern {
        if !pattern.is_match(url.as_str()) {
            return false;
        }
    }
    true
}

/// Links collected from one fetched page.
#[derive(Debug, Default)]
pub struct DiscoveredLinks {
    /// Depth-increasing candidates from the follow selector.
    pub follow: Vec<Url>,
    /// Depth-preserving successors from the next selector.
    pub next: Vec<Url>,
}

/// Collect candidate URLs from a page by CSS selector.
pub fn discover_links(
    html: &str,
    base: &Url,
    follow_selector: Option<&str>,
    next_selector: Option<&str>,
) -> DiscoveredLinks {
    let document = Html::parse_document(html);
    let mut links = DiscoveredLinks::default();

    let follow = follow_selector.unwrap_or(DEFAULT_FOLLOW_SELECTOR);
    if let Ok(selector) = Selector::parse(follow) {
        links.follow = select_hrefs(&document, &selector, base);
    }

    if let Some(next) = next_selector {
        if let Ok(selector) = Selector::parse(next) {
            links.next = select_hrefs(&document, &selector, base);
        }
    }

    links
}

fn select_hrefs(document: &Html, selector: &Selector, base: &Url) -> Vec<Url> {
    document
        .select(selector)
        .filter_map(|el| el.value().attr("href"))
        .filter_map(|href| normalize(base, href))
        .collect()
}

/// Extract URLs from a sitemap document. Handles both urlset and sitemap
/// index files; nested sitemaps are not fetched recursively.
pub fn parse_sitemap(xml: &str, base: &Url) -> Vec<Url> {
    SITEMAP_LOC
        .captures_iter(xml)
        .filter_map(|cap| normalize(base, &cap[1]))
        .filter(|u| !u.path().ends_with(".xml"))
        .collect()
}

/// Fetch and parse `sitemap.xml` from the seed's origin.
///
/// Failures bubble up; the crawl worker falls back to selector discovery.
pub async fn sitemap_urls(
    fetcher: &dyn Fetcher,
    seed: &Url,
    timeout: Duration,
) -> ExtractResult<Vec<Url>> {
    let sitemap_url = format!(
        "{}://{}/sitemap.xml",
        seed.scheme(),
        seed.host_str().unwrap_or_default()
    );
    let page = fetcher
        .fetch(&sitemap_url, FetchKind::Static, timeout)
        .await?;
    let urls = parse_sitemap(&page.content, seed);
    log_debug!(sitemap = %sitemap_url, urls = urls.len(), "Sitemap parsed");
    Ok(urls)
}
