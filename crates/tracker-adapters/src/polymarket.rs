//! Gamma API market and event payloads.
//!
//! Gamma encodes list fields such as `outcomes` and `outcomePrices` as JSON
//! strings and numeric fields as either strings or numbers, so parsing is
//! field-by-field and lenient.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const DEFAULT_GAMMA_URL: &str = "https://gamma-api.polymarket.com";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolymarketMarket {
    pub id: String,
    pub question: String,
    pub outcomes: Vec<String>,
    pub outcome_prices: Vec<String>,
    pub volume: Option<f64>,
    pub liquidity: Option<f64>,
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolymarketEvent {
    pub id: String,
    pub title: String,
    pub volume: Option<f64>,
    pub liquidity: Option<f64>,
    pub end_date: Option<String>,
    pub markets: Vec<PolymarketMarket>,
}

/// String or number id. Anything else is unusable.
fn native_id(v: &JsonValue) -> Option<String> {
    match v.get("id")? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_field(v: &JsonValue, key: &str) -> Option<String> {
    v.get(key).and_then(|s| s.as_str()).map(str::to_string)
}

fn number_field(v: &JsonValue, key: &str) -> Option<f64> {
    v.get(key)
        .and_then(|x| x.as_f64().or_else(|| x.as_str().and_then(|s| s.trim().parse().ok())))
}

/// Accepts a real JSON array or a JSON-encoded array string.
fn string_list_field(v: &JsonValue, key: &str) -> Vec<String> {
    let list = match v.get(key) {
        Some(JsonValue::String(encoded)) => serde_json::from_str::<Vec<JsonValue>>(encoded).ok(),
        Some(JsonValue::Array(items)) => Some(items.clone()),
        _ => None,
    };
    list.unwrap_or_default()
        .into_iter()
        .map(|item| match item {
            JsonValue::String(s) => s,
            other => other.to_string(),
        })
        .collect()
}

impl PolymarketMarket {
    /// `None` only when the payload carries no usable id.
    pub fn from_json(v: &JsonValue) -> Option<Self> {
        Some(Self {
            id: native_id(v)?,
            question: string_field(v, "question").unwrap_or_default(),
            outcomes: string_list_field(v, "outcomes"),
            outcome_prices: string_list_field(v, "outcomePrices"),
            volume: number_field(v, "volume"),
            liquidity: number_field(v, "liquidity"),
            end_date: string_field(v, "endDate"),
        })
    }
}

impl PolymarketEvent {
    pub fn from_json(v: &JsonValue) -> Option<Self> {
        let markets = v
            .get("markets")
            .and_then(|m| m.as_array())
            .map(|arr| arr.iter().filter_map(PolymarketMarket::from_json).collect())
            .unwrap_or_default();
        Some(Self {
            id: native_id(v)?,
            title: string_field(v, "title").unwrap_or_default(),
            volume: number_field(v, "volume"),
            liquidity: number_field(v, "liquidity"),
            end_date: string_field(v, "endDate"),
            markets,
        })
    }
}

pub fn market_url(base_url: &str, market_id: &str) -> String {
    format!("{}/markets/{}", base_url.trim_end_matches('/'), market_id)
}

pub fn event_url(base_url: &str, event_id: &str) -> String {
    format!("{}/events/{}", base_url.trim_end_matches('/'), event_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn gamma_market_with_encoded_lists() {
        let raw = json!({
            "id": "12345",
            "question": "Will BTC close above 100k?",
            "outcomes": "[\"Yes\", \"No\"]",
            "outcomePrices": "[\"0.45\", \"0.55\"]",
            "volume": "1520.5",
            "liquidity": 310.25,
            "endDate": "2026-12-31T00:00:00Z",
            "clobTokenIds": "[\"1\", \"2\"]"
        });
        let market = PolymarketMarket::from_json(&raw).unwrap();
        assert_eq!(market.outcomes, vec!["Yes", "No"]);
        assert_eq!(market.outcome_prices, vec!["0.45", "0.55"]);
        assert_eq!(market.volume, Some(1520.5));
        assert_eq!(market.liquidity, Some(310.25));
    }

    #[test]
    fn malformed_fields_degrade_to_defaults() {
        let raw = json!({"id": 77, "outcomes": "not json", "volume": {"x": 1}});
        let market = PolymarketMarket::from_json(&raw).unwrap();
        assert_eq!(market.id, "77");
        assert!(market.question.is_empty());
        assert!(market.outcomes.is_empty());
        assert_eq!(market.volume, None);

        assert!(PolymarketMarket::from_json(&json!({"question": "no id"})).is_none());
    }

    #[test]
    fn event_keeps_only_markets_with_ids() {
        let raw = json!({
            "id": "e1",
            "title": "Fed decision",
            "markets": [{"id": "m1", "question": "Cut?"}, {"question": "orphan"}]
        });
        let event = PolymarketEvent::from_json(&raw).unwrap();
        assert_eq!(event.markets.len(), 1);
        assert_eq!(event_url("https://gamma.example/", "e1"), "https://gamma.example/events/e1");
    }
}
