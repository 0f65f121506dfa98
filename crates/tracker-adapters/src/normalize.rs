//! Raw source records to [`NormalizedItem`]s. Never fails on bad fields.

use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use tracker_core::{canonical_json, fingerprint, short_hash, ItemData, NormalizedItem, RssItem};

use crate::polymarket::{PolymarketEvent, PolymarketMarket};
use crate::rss::{clean_text, extract_domain, strip_html};
use crate::RawRecord;

pub fn normalize(record: &RawRecord, now: DateTime<Utc>) -> NormalizedItem {
    match record {
        RawRecord::PolymarketMarket(market) => normalize_market(market, now),
        RawRecord::PolymarketEvent(event) => normalize_event(event, now),
        RawRecord::Rss(item) => normalize_rss_item(item, now),
        RawRecord::Http(value) => normalize_http_record(value, now),
    }
}

pub fn normalize_all(records: &[RawRecord], now: DateTime<Utc>) -> Vec<NormalizedItem> {
    records.iter().map(|r| normalize(r, now)).collect()
}

fn object(value: JsonValue) -> ItemData {
    match value {
        JsonValue::Object(map) => map,
        _ => ItemData::new(),
    }
}

pub fn normalize_market(market: &PolymarketMarket, now: DateTime<Utc>) -> NormalizedItem {
    let data = object(json!({
        "question": market.question,
        "outcomes": market.outcomes,
        "outcomePrices": market.outcome_prices,
        "volume": market.volume,
        "liquidity": market.liquidity,
        "endDate": market.end_date,
    }));
    NormalizedItem::from_data(market.id.clone(), now, data)
}

pub fn normalize_event(event: &PolymarketEvent, now: DateTime<Utc>) -> NormalizedItem {
    let markets: Vec<JsonValue> = event
        .markets
        .iter()
        .map(|m| {
            json!({
                "id": m.id,
                "question": m.question,
                "outcomePrices": m.outcome_prices,
            })
        })
        .collect();
    let data = object(json!({
        "title": event.title,
        "volume": event.volume,
        "liquidity": event.liquidity,
        "endDate": event.end_date,
        "markets": markets,
    }));
    NormalizedItem::from_data(event.id.clone(), now, data)
}

/// RFC 2822 first, then RFC 3339.
pub fn parse_pub_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// News items are keyed by link so the id survives title edits; the short
/// fingerprint covers the fields readers see.
pub fn normalize_rss_item(item: &RssItem, now: DateTime<Utc>) -> NormalizedItem {
    let title = clean_text(&item.title);
    let description = strip_html(&item.description);
    let source = item
        .source
        .as_deref()
        .map(clean_text)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| extract_domain(&item.link));
    let pub_date = match item.pub_date.trim() {
        "" => now.to_rfc2822(),
        date => date.to_string(),
    };

    let id_source = if item.link.is_empty() { &item.guid } else { &item.link };
    let id = short_hash(id_source);
    let fingerprint = short_hash(&canonical_json(&json!({
        "id": id,
        "title": title,
        "description": description,
        "pubDate": pub_date,
    })));
    let timestamp = parse_pub_date(&pub_date).unwrap_or(now);

    let data = object(json!({
        "title": title,
        "link": item.link,
        "description": description,
        "source": source,
        "pubDate": pub_date,
    }));

    NormalizedItem {
        id,
        timestamp,
        data,
        fingerprint,
    }
}

/// Objects pass through as-is; anything else is wrapped under `value`.
pub fn normalize_http_record(record: &JsonValue, now: DateTime<Utc>) -> NormalizedItem {
    let data = match record {
        JsonValue::Object(map) => map.clone(),
        other => object(json!({ "value": other })),
    };
    let id = match data.get("id") {
        Some(JsonValue::String(s)) if !s.is_empty() => s.clone(),
        Some(JsonValue::Number(n)) => n.to_string(),
        _ => {
            let mut hash = fingerprint(&data);
            hash.truncate(tracker_core::fingerprint::SHORT_HASH_LEN);
            hash
        }
    };
    NormalizedItem::from_data(id, now, data)
}
