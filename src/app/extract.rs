//! Listing extraction from fetched pages and the price-band screen.

use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};
use url::Url;

use super::error::ExtractError;
use super::price::normalize_price;
use super::types::{Candidate, FetchedPage, Listing, PriceBand, Selectors};

pub const NO_TITLE: &str = "No title found";
pub const NO_PRICE: &str = "No price found";

/// Reads every listing item on `page` into a [`Candidate`].
///
/// Never fails: an unparsable selector or a page without matches yields no
/// candidates, and items without a usable link are skipped.
pub fn extract(page: &FetchedPage, selectors: &Selectors) -> Vec<Candidate> {
    let compiled = match CompiledSelectors::new(selectors) {
        Ok(compiled) => compiled,
        Err(err) => {
            warn!(url = %page.url, "{err}");
            return Vec::new();
        }
    };

    let doc = Html::parse_document(&page.body);
    let items = doc.select(&compiled.item).collect::<Vec<_>>();
    debug!(url = %page.url, count = items.len(), "listing items matched");
    if items.is_empty() {
        warn!(url = %page.url, "no listings found");
        return Vec::new();
    }

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let title = first_text(item, &compiled.title).unwrap_or_else(|| NO_TITLE.to_string());
        let price_text =
            first_text(item, &compiled.price).unwrap_or_else(|| NO_PRICE.to_string());

        match item_link(item, &compiled.anchor, &page.url) {
            Ok(link) => {
                debug!(%title, price = %price_text, "found listing");
                out.push(Candidate {
                    title,
                    price_text,
                    link,
                });
            }
            Err(err) => warn!(url = %page.url, %title, "{err}"),
        }
    }
    out
}

/// Why a candidate did not become a [`Listing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    UnparsablePrice,
    OutOfBand(i64),
}

/// Normalizes the candidate's price and keeps it iff it lies inside `band`.
pub fn screen(candidate: &Candidate, band: PriceBand) -> Result<Listing, Rejection> {
    let price = normalize_price(&candidate.price_text).ok_or(Rejection::UnparsablePrice)?;
    if !band.contains(price) {
        return Err(Rejection::OutOfBand(price));
    }
    Ok(Listing {
        title: candidate.title.clone(),
        link: candidate.link.clone(),
        price,
    })
}

struct CompiledSelectors {
    item: Selector,
    title: Selector,
    price: Selector,
    anchor: Selector,
}

impl CompiledSelectors {
    fn new(selectors: &Selectors) -> Result<Self, ExtractError> {
        Ok(Self {
            item: parse_selector(&selectors.listing_item)?,
            title: parse_selector(&selectors.title)?,
            price: parse_selector(&selectors.price)?,
            anchor: parse_selector("a[href]")?,
        })
    }
}

pub(crate) fn parse_selector(raw: &str) -> Result<Selector, ExtractError> {
    Selector::parse(raw).map_err(|_| ExtractError::Selector {
        selector: raw.to_string(),
    })
}

fn first_text(item: ElementRef<'_>, selector: &Selector) -> Option<String> {
    item.select(selector)
        .map(|el| normalize_text(&el.text().collect::<Vec<_>>().join(" ")))
        .find(|text| !text.is_empty())
}

fn normalize_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn item_link(
    item: ElementRef<'_>,
    anchors: &Selector,
    page_url: &str,
) -> Result<String, ExtractError> {
    let own_href = (item.value().name() == "a")
        .then(|| item.value().attr("href"))
        .flatten();
    own_href
        .into_iter()
        .chain(item.select(anchors).filter_map(|a| a.value().attr("href")))
        .find_map(|href| resolve_href(page_url, href.trim()))
        .ok_or(ExtractError::MissingLink)
}

fn resolve_href(page_url: &str, href: &str) -> Option<String> {
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("mailto:")
        || href.starts_with("javascript:")
        || href.starts_with("tel:")
    {
        return None;
    }

    let base = Url::parse(page_url).ok()?;
    let mut url = base.join(href).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    strip_tracking_params(&mut url);
    url.set_fragment(None);
    Some(url.to_string())
}

fn strip_tracking_params(url: &mut Url) {
    if url.query().is_none() {
        return;
    }
    let kept_params = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_query_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect::<Vec<_>>();
    if kept_params.is_empty() {
        url.set_query(None);
    } else {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in kept_params {
            serializer.append_pair(&k, &v);
        }
        url.set_query(Some(&serializer.finish()));
    }
}

fn is_tracking_query_param(param: &str) -> bool {
    let name = param.to_ascii_lowercase();
    if name.starts_with("utm_") || name.starts_with("gad_") {
        return true;
    }
    matches!(
        name.as_str(),
        "gclid" | "fbclid" | "gbraid" | "wbraid" | "_gl" | "mc_cid" | "mc_eid"
    )
}
