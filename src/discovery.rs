use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use tracing::{info, warn};
use url::Url;

use crate::error::FetchError;

static PART_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^pp-(\d{4})-part(\d+)\.csv$").unwrap());
static ANCHOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

/// Year and part number parsed from a `pp-<year>-part<N>.csv` name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartFile {
    pub year: i32,
    pub part: u32,
}

pub fn parse_part_name(name: &str) -> Option<PartFile> {
    let caps = PART_RE.captures(name)?;
    Some(PartFile {
        year: caps.get(1)?.as_str().parse().ok()?,
        part: caps.get(2)?.as_str().parse().ok()?,
    })
}

/// Fetch every catalog page and collect part-file links. Failed pages are skipped.
pub async fn discover(client: &reqwest::Client, pages: &[String]) -> Vec<String> {
    let mut found = BTreeSet::new();

    for page in pages {
        info!("Fetching catalog page: {}", page);
        let base = match Url::parse(page) {
            Ok(u) => u,
            Err(e) => {
                warn!("Skipping catalog page {}: {}", page, e);
                continue;
            }
        };
        match fetch_page(client, page).await {
            Ok(html) => {
                let links = extract_part_links(&html, &base);
                info!(page = %page, links = links.len(), "Part files on page");
                found.extend(links.into_iter().map(String::from));
            }
            Err(e) => warn!("Skipping catalog page: {}", e),
        }
    }

    info!("Found {} part files total", found.len());
    found.into_iter().collect()
}

async fn fetch_page(client: &reqwest::Client, page: &str) -> Result<String, FetchError> {
    let network = |source| FetchError::Network {
        url: page.to_string(),
        source,
    };
    let response = client.get(page).send().await.map_err(network)?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            url: page.to_string(),
            status,
        });
    }
    response.text().await.map_err(network)
}

/// Absolute URLs of anchors whose last path segment is a part file, sorted and deduplicated.
pub fn extract_part_links(html: &str, base: &Url) -> Vec<Url> {
    let document = Html::parse_document(html);
    let links: BTreeSet<Url> = document
        .select(&ANCHOR)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| base.join(href.trim()).ok())
        .filter(|url| last_segment(url).is_some_and(|s| parse_part_name(s).is_some()))
        .collect();
    links.into_iter().collect()
}

pub fn last_segment(url: &Url) -> Option<&str> {
    url.path_segments()?.last().filter(|s| !s.is_empty())
}
