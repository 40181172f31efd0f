//! Directory listing parser
//!
//! Understands the HTML index pages served by Apache/nginx autoindex, which
//! is what the DWD open data server returns for directory URLs.

use scraper::{Html, Selector};
use url::Url;

use crate::error::{IngestError, Result};

/// Links found on one listing page, resolved to absolute URLs
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Listing {
    /// Child directories of the page, sorted
    pub dirs: Vec<Url>,
    /// Files below the crawl root, sorted
    pub files: Vec<Url>,
}

/// Parse `html` served at `page`, keeping only links inside `root`
///
/// Sort-order links (`?C=N;O=D`), fragments, parent links and anything on
/// another host are dropped. Directory links must point below `page` so the
/// traversal only ever descends.
pub fn parse_listing(html: &str, page: &Url, root: &Url) -> Result<Listing> {
    let selector = Selector::parse("a[href]")
        .map_err(|e| IngestError::config(format!("invalid link selector: {}", e)))?;
    let document = Html::parse_document(html);

    let mut listing = Listing::default();
    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href").map(str::trim) else {
            continue;
        };
        if href.is_empty() || href.starts_with('?') || href.starts_with('#') {
            continue;
        }

        let Ok(mut url) = page.join(href) else {
            continue;
        };
        url.set_query(None);
        url.set_fragment(None);

        if !same_origin(&url, root) || !url.path().starts_with(root.path()) {
            continue;
        }

        if url.path().ends_with('/') {
            if url.path().len() > page.path().len() && url.path().starts_with(page.path()) {
                listing.dirs.push(url);
            }
        } else {
            listing.files.push(url);
        }
    }

    listing.dirs.sort();
    listing.dirs.dedup();
    listing.files.sort();
    listing.files.dedup();
    Ok(listing)
}

fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}
