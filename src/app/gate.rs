//! URL admission: syntax check plus a simplified robots.txt policy check.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};

use regex::Regex;
use tracing::{info, warn};
use url::Url;

use super::error::PolicyError;
use super::fetch::PageFetcher;

static URL_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:http|https)://[^\s/$.?#].[^\s]*$").expect("URL shape pattern is valid")
});

/// Admits the URLs that are well formed and not disallowed for `user_agent`.
///
/// robots.txt is fetched once per host. A host whose robots.txt cannot be
/// retrieved has all of its URLs excluded. The result keeps first-seen input
/// order with duplicates removed.
///
/// `shutdown` is checked before each robots.txt fetch; once set, the URLs
/// admitted so far are returned.
pub async fn admit(
    urls: &[String],
    user_agent: &str,
    fetcher: &dyn PageFetcher,
    shutdown: &AtomicBool,
) -> Vec<String> {
    let mut policies: HashMap<String, Option<Vec<String>>> = HashMap::new();
    let mut seen = HashSet::new();
    let mut admitted = Vec::new();

    for raw in urls {
        if !seen.insert(raw.as_str()) {
            continue;
        }
        let Some(url) = well_formed(raw) else {
            warn!("{}", PolicyError::MalformedUrl { url: raw.clone() });
            continue;
        };
        let origin = origin_authority(&url);

        if !policies.contains_key(&origin) {
            if shutdown.load(Ordering::Relaxed) {
                info!("shutdown requested, stopping URL admission");
                break;
            }
            let policy = match fetch_rules(&origin, user_agent, fetcher).await {
                Ok(rules) => Some(rules),
                Err(err) => {
                    warn!("{err}");
                    None
                }
            };
            policies.insert(origin.clone(), policy);
        }

        let Some(rules) = policies.get(&origin).and_then(Option::as_ref) else {
            warn!(url = %raw, "skipping URL: no usable robots.txt for {origin}");
            continue;
        };
        match check(raw, &url, rules) {
            Ok(()) => {
                info!(url = %raw, "valid URL added");
                admitted.push(raw.clone());
            }
            Err(err) => warn!("{err}"),
        }
    }

    admitted
}

fn check(raw: &str, url: &Url, rules: &[String]) -> Result<(), PolicyError> {
    match matching_rule(url, rules) {
        Some(rule) => Err(PolicyError::Disallowed {
            url: raw.to_string(),
            rule: rule.to_string(),
        }),
        None => Ok(()),
    }
}

async fn fetch_rules(
    origin: &str,
    user_agent: &str,
    fetcher: &dyn PageFetcher,
) -> Result<Vec<String>, PolicyError> {
    let page = fetcher
        .fetch(&robots_url(origin))
        .await
        .map_err(|source| PolicyError::RobotsUnavailable {
            host: origin.to_string(),
            source,
        })?;
    Ok(disallowed_prefixes(&page.body, user_agent))
}

/// Parses `raw` if it has the `scheme://host/path` shape and an http(s) scheme.
pub fn well_formed(raw: &str) -> Option<Url> {
    let trimmed = raw.trim();
    if !URL_SHAPE.is_match(trimmed) {
        return None;
    }
    let url = Url::parse(trimmed).ok()?;
    url.host_str()?;
    Some(url)
}

fn origin_authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn robots_url(authority: &str) -> String {
    format!("https://{authority}/robots.txt")
}

/// Collects the `Disallow` prefixes that apply to `user_agent`.
///
/// Consecutive `User-agent` lines form one group; a group applies when it
/// names the agent (case-insensitively) or `*`. There is no precedence
/// between groups and `Allow` lines are ignored.
pub fn disallowed_prefixes(robots_txt: &str, user_agent: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut group_applies = false;
    let mut in_agent_lines = false;

    let robots_txt = robots_txt.strip_prefix('\u{feff}').unwrap_or(robots_txt);
    for line in robots_txt.lines() {
        let line = line.split('#').next().unwrap_or_default().trim();
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let field = field.trim().to_ascii_lowercase();
        let value = value.trim();

        match field.as_str() {
            "user-agent" => {
                if !in_agent_lines {
                    group_applies = false;
                    in_agent_lines = true;
                }
                if value == "*" || value.eq_ignore_ascii_case(user_agent) {
                    group_applies = true;
                }
            }
            "disallow" => {
                in_agent_lines = false;
                let prefix = value.trim_end_matches('*');
                if group_applies && !prefix.is_empty() {
                    prefixes.push(prefix.to_string());
                }
            }
            _ => in_agent_lines = false,
        }
    }

    prefixes
}

fn matching_rule<'a>(url: &Url, prefixes: &'a [String]) -> Option<&'a str> {
    let target = match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    };
    prefixes
        .iter()
        .find(|prefix| target.starts_with(prefix.as_str()))
        .map(String::as_str)
}
