use std::collections::{BTreeSet, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;

/// Absolute URLs, plain or with `\/`-escaped slashes (minified JS embeds
/// both forms). The char class stops at JS string/expression delimiters.
static ABSOLUTE_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?:(?:\\?/){2}[^\s"'<>`()]+"#).expect("absolute url regex"));

/// Quoted protocol-relative URLs: "//host/path".
static PROTOCOL_RELATIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"["']((?:\\?/){2}[A-Za-z0-9][^\s"'<>`]*)["']"#).expect("protocol-relative regex")
});

/// File extensions that identify static assets rather than trackable
/// endpoints. Assets load fine from their real origin and bloat the cache.
const ASSET_EXTENSIONS: &[&str] = &[
    "css", "eot", "gif", "ico", "jpeg", "jpg", "mp4", "otf", "png", "svg", "ttf", "webm", "webp",
    "woff", "woff2",
];

/// Hosts belonging to the trackers this proxy fronts. Used by the
/// `TrackerList` filter mode; `AllExternal` ignores this list.
const TRACKER_DOMAINS: &[&str] = &[
    "analytics.google.com",
    "connect.facebook.net",
    "doubleclick.net",
    "facebook.com",
    "facebook.net",
    "google-analytics.com",
    "googleadservices.com",
    "googlesyndication.com",
    "googletagmanager.com",
];

/// Which extracted URLs qualify for proxying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// Only URLs whose host is (a subdomain of) a known tracker domain.
    TrackerList,
    /// Every external HTTPS-reachable URL. The recommended mode: new tracker
    /// hosts appear in scripts faster than any list gets updated.
    AllExternal,
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Scripts larger than this skip extraction entirely to bound CPU.
    pub max_script_bytes: usize,
    pub mode: FilterMode,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            max_script_bytes: 10 * 1024 * 1024,
            mode: FilterMode::AllExternal,
        }
    }
}

/// Pull every qualifying upstream URL out of a script body.
///
/// Candidates are de-duplicated and returned in deterministic (sorted)
/// order. An oversized script yields no candidates; the caller proxies it
/// unmodified.
pub fn extract_urls(script: &str, opts: &ExtractOptions) -> Vec<String> {
    if script.len() > opts.max_script_bytes {
        return Vec::new();
    }

    let mut found = BTreeSet::new();

    for m in ABSOLUTE_URL_RE.find_iter(script) {
        if let Some(url) = clean_candidate(m.as_str()) {
            found.insert(url);
        }
    }

    for caps in PROTOCOL_RELATIVE_RE.captures_iter(script) {
        if let Some(raw) = caps.get(1) {
            if let Some(url) = clean_candidate(&format!("https:{}", raw.as_str())) {
                found.insert(url);
            }
        }
    }

    found
        .into_iter()
        .filter(|url| qualifies(url, opts.mode))
        .collect()
}

/// Strip wrapping junk and JS escaping from a regex match, then validate.
/// Returns `None` for anything that is not a plausible http(s) URL.
fn clean_candidate(raw: &str) -> Option<String> {
    let trimmed = raw.trim_matches(|c: char| {
        matches!(c, '"' | '\'' | '`' | '(' | ')' | ',' | ';' | '.' | '|')
    });
    let unescaped = trimmed.replace("\\/", "/");

    // An escape sequence other than \/ means we sliced into the middle of a
    // JS string, not a URL we can trust.
    if unescaped.contains('\\') {
        return None;
    }
    if !unescaped.starts_with("http://") && !unescaped.starts_with("https://") {
        return None;
    }
    if unescaped.contains(' ') {
        return None;
    }

    let host = host_of(&unescaped)?;
    if !host.contains('.') {
        return None;
    }
    if is_asset_url(&unescaped) {
        return None;
    }

    Some(unescaped)
}

/// Host portion of an http(s) URL, lowercased, without port or credentials.
pub fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

fn is_asset_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last_segment = path.rsplit('/').next().unwrap_or("");
    match last_segment.rsplit_once('.') {
        Some((_, ext)) => ASSET_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()),
        None => false,
    }
}

fn is_local_host(host: &str) -> bool {
    host == "localhost"
        || host == "0.0.0.0"
        || host == "::1"
        || host.starts_with("127.")
        || host.starts_with("10.")
        || host.starts_with("192.168.")
        || host.ends_with(".local")
        || host.ends_with(".internal")
}

fn is_tracker_host(host: &str) -> bool {
    TRACKER_DOMAINS
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
}

fn qualifies(url: &str, mode: FilterMode) -> bool {
    let Some(host) = host_of(url) else {
        return false;
    };
    if is_local_host(&host) {
        return false;
    }
    match mode {
        FilterMode::TrackerList => is_tracker_host(&host),
        FilterMode::AllExternal => true,
    }
}

/// Substitute proxied URLs into a script body.
///
/// URLs are processed longest-first so a short URL can never clobber part of
/// a longer one that contains it. Replacement is literal (no regex), and
/// each URL is substituted in both its plain and `\/`-escaped forms. Output
/// length is unrelated to input length.
pub fn rewrite_script(script: &str, replacements: &HashMap<String, String>) -> String {
    let mut ordered: Vec<(&String, &String)> = replacements.iter().collect();
    ordered.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));

    let mut out = script.to_string();
    for (url, proxy_path) in ordered {
        out = out.replace(url.as_str(), proxy_path);

        let escaped_url = url.replace('/', "\\/");
        let escaped_path = proxy_path.replace('/', "\\/");
        out = out.replace(&escaped_url, &escaped_path);
    }
    out
}
