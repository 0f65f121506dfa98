//! RSS 2.0 feed client and parser for news searches and newsletter feeds.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use scraper::Html;
use tracing::warn;
use tracker_core::RssItem;
use tracker_storage::{FetchError, HttpFetcher};

use crate::AdapterError;

/// Collapses runs of whitespace to single spaces and trims.
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Plain text of an HTML fragment with entities decoded and whitespace collapsed.
pub fn strip_html(html: &str) -> String {
    if !html.contains('<') && !html.contains('&') {
        return clean_text(html);
    }
    let fragment = Html::parse_fragment(html);
    let text: String = fragment.root_element().text().collect();
    clean_text(&text)
}

/// Host of `link` without a leading `www.`; empty when `link` is not a URL.
pub fn extract_domain(link: &str) -> String {
    url::Url::parse(link)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.strip_prefix("www.").unwrap_or(h).to_string()))
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy)]
enum ItemField {
    Guid,
    Title,
    Link,
    Description,
    Source,
    PubDate,
}

impl ItemField {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "guid" => Some(Self::Guid),
            "title" => Some(Self::Title),
            "link" => Some(Self::Link),
            "description" => Some(Self::Description),
            "source" => Some(Self::Source),
            "pubDate" => Some(Self::PubDate),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct ItemBuilder {
    guid: String,
    title: String,
    link: String,
    description: String,
    source: String,
    pub_date: String,
}

impl ItemBuilder {
    fn push(&mut self, field: ItemField, text: &str) {
        let slot = match field {
            ItemField::Guid => &mut self.guid,
            ItemField::Title => &mut self.title,
            ItemField::Link => &mut self.link,
            ItemField::Description => &mut self.description,
            ItemField::Source => &mut self.source,
            ItemField::PubDate => &mut self.pub_date,
        };
        slot.push_str(text);
    }

    fn finish(self, now: DateTime<Utc>) -> RssItem {
        let link = self.link.trim().to_string();
        let guid = match self.guid.trim() {
            "" => link.clone(),
            guid => guid.to_string(),
        };
        let source = match clean_text(&self.source) {
            s if s.is_empty() => extract_domain(&link),
            s => s,
        };
        let pub_date = match self.pub_date.trim() {
            "" => now.to_rfc2822(),
            date => date.to_string(),
        };
        RssItem {
            guid,
            title: clean_text(&self.title),
            link,
            description: strip_html(&self.description),
            source: Some(source),
            pub_date,
        }
    }
}

/// Parses the `<item>` entries of an RSS 2.0 `<channel>`.
///
/// A document without a channel is an error; missing item fields are filled
/// with defaults (`guid` from `link`, `source` from the link's domain,
/// `pubDate` from `now`).
pub fn parse_rss(xml: &str, now: DateTime<Utc>) -> Result<Vec<RssItem>, AdapterError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<String> = Vec::new();
    let mut saw_channel = false;
    let mut current: Option<ItemBuilder> = None;
    let mut field: Option<(ItemField, usize)> = None;
    let mut items = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match tag.as_str() {
                    "channel" => saw_channel = true,
                    "item" if stack.iter().any(|t| t == "channel") => {
                        current = Some(ItemBuilder::default());
                    }
                    _ => {
                        if current.is_some() && stack.last().is_some_and(|t| t == "item") {
                            field = ItemField::from_tag(&tag).map(|f| (f, stack.len() + 1));
                        }
                    }
                }
                stack.push(tag);
            }
            Ok(Event::End(_)) => {
                let depth = stack.len();
                let closed = stack.pop();
                if field.is_some_and(|(_, d)| d == depth) {
                    field = None;
                }
                if closed.as_deref() == Some("item") {
                    if let Some(builder) = current.take() {
                        items.push(builder.finish(now));
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if let (Some(builder), Some((f, _))) = (current.as_mut(), field) {
                    let text = t
                        .unescape()
                        .map(|c| c.into_owned())
                        .unwrap_or_else(|_| String::from_utf8_lossy(&t).into_owned());
                    builder.push(f, &text);
                }
            }
            Ok(Event::CData(c)) => {
                if let (Some(builder), Some((f, _))) = (current.as_mut(), field) {
                    builder.push(f, &String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(AdapterError::Parse(err.to_string())),
            Ok(_) => {}
        }
    }

    if !saw_channel {
        return Err(AdapterError::Parse("no <channel> element".into()));
    }
    Ok(items)
}

/// Fetches and parses RSS feeds.
///
/// 429 and 503 surface as [`AdapterError::RateLimited`]; every other failure
/// is logged and yields an empty list.
#[derive(Debug, Clone)]
pub struct RssClient {
    http: Arc<HttpFetcher>,
}

impl RssClient {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }

    pub async fn fetch_feed(&self, url: &str) -> Result<Vec<RssItem>, AdapterError> {
        let body = match self.http.get_text(url).await {
            Ok(body) => body,
            Err(FetchError::HttpStatus { status, .. }) if status == 429 || status == 503 => {
                return Err(AdapterError::RateLimited { status });
            }
            Err(err) => {
                warn!(url, error = %err, "rss fetch failed");
                return Ok(Vec::new());
            }
        };

        match parse_rss(&body, Utc::now()) {
            Ok(items) => Ok(items),
            Err(err) => {
                warn!(url, error = %err, "invalid rss feed");
                Ok(Vec::new())
            }
        }
    }
}
