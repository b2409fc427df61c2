use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use url::Url;

/// Page size assumed when converting between page numbers and offsets.
pub const DEFAULT_ITEMS_PER_PAGE: u32 = 20;

/// Pagination scheme detected in a URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "param", rename_all = "snake_case")]
pub enum PatternKind {
    /// `?page=N`
    QueryPage,
    /// `?p=N`
    QueryP,
    /// `?offset=N`, value is `(page - 1) * items_per_page`
    QueryOffset,
    /// `?start=N`, value is `(page - 1) * items_per_page`
    QueryStart,
    /// `/page/N` or `/page-N`
    PathPage,
    /// Any other `key=N` query parameter
    QueryCustom(String),
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternInfo {
    pub kind: PatternKind,
    pub current_page: u64,
}

lazy_static! {
    static ref QUERY_PAGE_REGEX: Regex = Regex::new(r"(?i)([?&]page=)(\d+)").unwrap();
    static ref QUERY_P_REGEX: Regex = Regex::new(r"(?i)([?&]p=)(\d+)").unwrap();
    static ref QUERY_OFFSET_REGEX: Regex = Regex::new(r"(?i)([?&]offset=)(\d+)").unwrap();
    static ref QUERY_START_REGEX: Regex = Regex::new(r"(?i)([?&]start=)(\d+)").unwrap();
    static ref PATH_PAGE_REGEX: Regex = Regex::new(r"(?i)(/page[/-])(\d+)").unwrap();
    static ref QUERY_CUSTOM_REGEX: Regex = Regex::new(r"(?i)[?&](\w+)=(\d+)").unwrap();
}

/// Detects pagination schemes and rewrites URLs to target pages.
///
/// Pure and deterministic. `items_per_page` only matters for offset-style
/// parameters, where detection and generation are inverses of each other:
/// page N is written as `(N - 1) * items_per_page` and read back as
/// `value / items_per_page + 1`.
#[derive(Debug, Clone, Copy)]
pub struct Paginator {
    items_per_page: u32,
}

impl Default for Paginator {
    fn default() -> Self {
        Self::new(DEFAULT_ITEMS_PER_PAGE)
    }
}

impl Paginator {
    pub fn new(items_per_page: u32) -> Self {
        Self {
            items_per_page: items_per_page.max(1),
        }
    }

    pub fn items_per_page(&self) -> u32 {
        self.items_per_page
    }

    /// Detect the pagination scheme of `url`, checked in priority order:
    /// `page=`, `p=`, `offset=`, `start=`, `/page/N`, any `key=N`.
    pub fn detect_pattern(&self, url: &str) -> PatternInfo {
        let per_page = self.items_per_page as u64;

        let simple: [(&Regex, PatternKind); 5] = [
            (&*QUERY_PAGE_REGEX, PatternKind::QueryPage),
            (&*QUERY_P_REGEX, PatternKind::QueryP),
            (&*QUERY_OFFSET_REGEX, PatternKind::QueryOffset),
            (&*QUERY_START_REGEX, PatternKind::QueryStart),
            (&*PATH_PAGE_REGEX, PatternKind::PathPage),
        ];

        for (regex, kind) in simple {
            if let Some(caps) = regex.captures(url) {
                let value = parse_number(&caps, 2);
                let current_page = match kind {
                    PatternKind::QueryOffset | PatternKind::QueryStart => value / per_page + 1,
                    _ => value,
                };
                return PatternInfo { kind, current_page };
            }
        }

        if let Some(caps) = QUERY_CUSTOM_REGEX.captures(url) {
            return PatternInfo {
                kind: PatternKind::QueryCustom(caps[1].to_string()),
                current_page: parse_number(&caps, 2),
            };
        }

        PatternInfo {
            kind: PatternKind::Unknown,
            current_page: 1,
        }
    }

    /// Rewrite `url` so it points at `target_page` (1-based).
    ///
    /// Uses `pattern` when given, otherwise detects it. URLs without a
    /// recognizable scheme get a `page` query parameter appended.
    pub fn next_page_url(&self, url: &str, target_page: u64, pattern: Option<&PatternInfo>) -> String {
        let target_page = target_page.max(1);
        let detected;
        let pattern = match pattern {
            Some(p) => p,
            None => {
                detected = self.detect_pattern(url);
                &detected
            }
        };

        let offset_value = (target_page - 1) * self.items_per_page as u64;

        let rewritten = match &pattern.kind {
            PatternKind::QueryPage => replace_value(&QUERY_PAGE_REGEX, url, target_page),
            PatternKind::QueryP => replace_value(&QUERY_P_REGEX, url, target_page),
            PatternKind::QueryOffset => replace_value(&QUERY_OFFSET_REGEX, url, offset_value),
            PatternKind::QueryStart => replace_value(&QUERY_START_REGEX, url, offset_value),
            PatternKind::PathPage => replace_value(&PATH_PAGE_REGEX, url, target_page),
            PatternKind::QueryCustom(param) => {
                match Regex::new(&format!(r"(?i)([?&]{}=)(\d+)", regex::escape(param))) {
                    Ok(regex) => replace_value(&regex, url, target_page),
                    Err(e) => {
                        tracing::warn!(param = %param, error = %e, "Invalid custom pagination parameter");
                        None
                    }
                }
            }
            PatternKind::Unknown => None,
        };

        rewritten.unwrap_or_else(|| append_page_param(url, target_page))
    }

    /// Page number `url` currently points at (1 when no scheme is found).
    pub fn extract_page_number(&self, url: &str) -> u64 {
        self.detect_pattern(url).current_page
    }

    /// Highest page number found across `urls` (1 when none carry one).
    pub fn estimate_total_pages<'a, I>(&self, urls: I) -> u64
    where
        I: IntoIterator<Item = &'a str>,
    {
        urls.into_iter()
            .map(|u| self.extract_page_number(u))
            .max()
            .unwrap_or(1)
            .max(1)
    }
}

fn parse_number(caps: &Captures<'_>, group: usize) -> u64 {
    caps.get(group)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(1)
}

/// Replace the numeric group of every match, keeping the matched prefix.
fn replace_value(regex: &Regex, url: &str, value: u64) -> Option<String> {
    if !regex.is_match(url) {
        return None;
    }
    Some(
        regex
            .replace_all(url, |caps: &Captures<'_>| format!("{}{}", &caps[1], value))
            .into_owned(),
    )
}

fn append_page_param(url: &str, page: u64) -> String {
    let (head, fragment) = match url.find('#') {
        Some(idx) => url.split_at(idx),
        None => (url, ""),
    };
    let separator = if head.contains('?') { '&' } else { '?' };
    format!("{}{}page={}{}", head, separator, page, fragment)
}

/// Detect the scheme of `url` assuming the default page size.
pub fn detect_pattern(url: &str) -> PatternInfo {
    Paginator::default().detect_pattern(url)
}

/// Rewrite `url` to `target_page` assuming the default page size.
pub fn next_page_url(url: &str, target_page: u64, pattern: Option<&PatternInfo>) -> String {
    Paginator::default().next_page_url(url, target_page, pattern)
}

pub fn extract_page_number(url: &str) -> u64 {
    Paginator::default().extract_page_number(url)
}

/// True for absolute http(s) URLs with a host.
pub fn validate_url(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => {
            matches!(parsed.scheme(), "http" | "https")
                && parsed.host_str().map(|h| !h.is_empty()).unwrap_or(false)
        }
        Err(_) => false,
    }
}

/// Scheme, host (and port) and path of `url`, without query or fragment.
pub fn base_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    let authority = match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    Some(format!("{}://{}{}", parsed.scheme(), authority, parsed.path()))
}
