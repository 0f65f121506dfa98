//! Structured Google News RSS search queries and their cache keys.

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::fingerprint::{canonical_json, short_hash};

pub const DEFAULT_EDITION: &str = "US:en";
pub const DEFAULT_FEED_BASE_URL: &str = "https://news.google.com/rss/search";

const UNSUPPORTED_OPERATORS: [&str; 4] = ["filetype:", "intitle:", "source:", "location:"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edition {
    pub code: &'static str,
    pub gl: &'static str,
    pub ceid: &'static str,
    pub description: &'static str,
}

/// English-only editions accepted by the search feed.
pub const SUPPORTED_EDITIONS: [Edition; 6] = [
    Edition { code: "US:en", gl: "US", ceid: "US:en", description: "United States (English)" },
    Edition { code: "AE:en", gl: "AE", ceid: "AE:en", description: "UAE (English)" },
    Edition { code: "GB:en", gl: "GB", ceid: "GB:en", description: "United Kingdom (English)" },
    Edition { code: "IN:en", gl: "IN", ceid: "IN:en", description: "India (English)" },
    Edition { code: "SG:en", gl: "SG", ceid: "SG:en", description: "Singapore (English)" },
    Edition { code: "AU:en", gl: "AU", ceid: "AU:en", description: "Australia (English)" },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryTime {
    /// `24h`, `48h`, `7d`, rendered as `when:<window>`.
    Window(String),
    Range {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GoogleNewsQuerySpec {
    /// Implicit AND.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub none: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exact: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sites: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<QueryTime>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wildcards: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edition: Option<String>,
}

impl GoogleNewsQuerySpec {
    fn terms(&self) -> impl Iterator<Item = &String> {
        self.all
            .iter()
            .chain(&self.any)
            .chain(&self.none)
            .chain(&self.exact)
            .chain(&self.wildcards)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuerySpecError {
    #[error("unsupported edition: {0}. Must be one of: US:en, AE:en, GB:en, IN:en, SG:en, AU:en")]
    UnsupportedEdition(String),
    #[error("only English editions are supported (must end with :en): {0}")]
    NonEnglishEdition(String),
    #[error("non-ASCII characters not allowed in query terms: \"{0}\"")]
    NonAsciiTerm(String),
    #[error("unsupported operator found in term: \"{0}\"")]
    UnsupportedOperator(String),
    #[error("query spec renders to an empty search query")]
    EmptyQuery,
    #[error("invalid feed url: {0}")]
    InvalidUrl(String),
}

pub fn resolve_edition(code: Option<&str>) -> Result<&'static Edition, QuerySpecError> {
    let code = code.filter(|c| !c.trim().is_empty()).unwrap_or(DEFAULT_EDITION);
    SUPPORTED_EDITIONS
        .iter()
        .find(|e| e.code == code)
        .ok_or_else(|| QuerySpecError::UnsupportedEdition(code.to_string()))
}

/// Rejects specs the feed cannot serve. Runs at tracker creation, before any I/O.
pub fn validate_query_spec(spec: &GoogleNewsQuerySpec) -> Result<(), QuerySpecError> {
    if let Some(edition) = spec.edition.as_deref().filter(|e| !e.trim().is_empty()) {
        if !edition.ends_with(":en") {
            return Err(QuerySpecError::NonEnglishEdition(edition.to_string()));
        }
        resolve_edition(Some(edition))?;
    }

    for term in spec.terms() {
        if !term.is_ascii() {
            return Err(QuerySpecError::NonAsciiTerm(term.clone()));
        }
        if contains_unsupported_operator(term) {
            return Err(QuerySpecError::UnsupportedOperator(term.clone()));
        }
    }

    if build_search_query(spec).is_empty() {
        return Err(QuerySpecError::EmptyQuery);
    }
    Ok(())
}

fn contains_unsupported_operator(term: &str) -> bool {
    let lowered = term.to_ascii_lowercase();
    UNSUPPORTED_OPERATORS.iter().any(|op| {
        lowered.match_indices(op).any(|(idx, _)| {
            idx == 0
                || !lowered[..idx]
                    .chars()
                    .next_back()
                    .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        })
    })
}

/// Renders the structured spec into the search operator syntax.
pub fn build_search_query(spec: &GoogleNewsQuerySpec) -> String {
    let mut parts: Vec<String> = Vec::new();

    if !spec.all.is_empty() {
        parts.push(spec.all.join(" "));
    }
    parts.extend(spec.exact.iter().map(|phrase| format!("\"{phrase}\"")));
    if !spec.any.is_empty() {
        parts.push(format!("({})", spec.any.join(" OR ")));
    }
    parts.extend(spec.none.iter().map(|term| format!("-{term}")));
    if !spec.sites.is_empty() {
        let sites = spec
            .sites
            .iter()
            .map(|site| format!("site:{site}"))
            .collect::<Vec<_>>();
        parts.push(format!("({})", sites.join(" OR ")));
    }
    parts.extend(spec.wildcards.iter().cloned());

    match &spec.time {
        Some(QueryTime::Window(window)) => parts.push(format!("when:{window}")),
        Some(QueryTime::Range { after, before }) => {
            if let Some(after) = after {
                parts.push(format!("after:{after}"));
            }
            if let Some(before) = before {
                parts.push(format!("before:{before}"));
            }
        }
        None => {}
    }

    parts.join(" ").trim().to_string()
}

/// Full RSS search URL for `spec` under `base_url` (normally [`DEFAULT_FEED_BASE_URL`]).
pub fn build_feed_url(
    spec: &GoogleNewsQuerySpec,
    base_url: &str,
) -> Result<String, QuerySpecError> {
    let edition = resolve_edition(spec.edition.as_deref())?;
    let query = build_search_query(spec);
    let url = url::Url::parse_with_params(
        base_url,
        &[
            ("q", query.as_str()),
            ("hl", "en-US"),
            ("gl", edition.gl),
            ("ceid", edition.ceid),
        ],
    )
    .map_err(|err| QuerySpecError::InvalidUrl(err.to_string()))?;
    Ok(url.to_string())
}

/// Cache key over the rendered query plus the edition's locale parameters.
///
/// Specs that differ structurally but render the same query share a key.
pub fn compute_query_key(spec: &GoogleNewsQuerySpec) -> Result<String, QuerySpecError> {
    let edition = resolve_edition(spec.edition.as_deref())?;
    let input = json!({
        "q": build_search_query(spec),
        "gl": edition.gl,
        "ceid": edition.ceid,
    });
    Ok(short_hash(&canonical_json(&input)))
}
