//! Content fingerprints and snapshot diffing. Pure functions, no I/O.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::{ChangeEvent, FieldChange, ItemData, NormalizedItem, Snapshot};

/// Length of the truncated hashes used for RSS ids and cache keys.
pub const SHORT_HASH_LEN: usize = 16;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// First [`SHORT_HASH_LEN`] hex chars of the SHA-256 of `input`.
pub fn short_hash(input: &str) -> String {
    let mut hash = sha256_hex(input.as_bytes());
    hash.truncate(SHORT_HASH_LEN);
    hash
}

/// Compact JSON with object keys sorted by byte order at every depth.
///
/// Key order does not depend on whether serde_json was built with
/// `preserve_order`.
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Null => out.push_str("null"),
        JsonValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        JsonValue::Number(n) => out.push_str(&n.to_string()),
        JsonValue::String(s) => write_string(s, out),
        JsonValue::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        JsonValue::Object(map) => {
            let sorted: BTreeMap<&String, &JsonValue> = map.iter().collect();
            out.push('{');
            for (idx, (key, item)) in sorted.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    // Serializing a str through serde_json cannot fail.
    match serde_json::to_string(s) {
        Ok(quoted) => out.push_str(&quoted),
        Err(_) => out.push_str("\"\""),
    }
}

/// SHA-256 over the canonical serialization of `value`.
pub fn fingerprint_value(value: &JsonValue) -> String {
    sha256_hex(canonical_json(value).as_bytes())
}

/// Item fingerprint: identical `data` always yields the same hash.
pub fn fingerprint(data: &ItemData) -> String {
    fingerprint_value(&JsonValue::Object(data.clone()))
}

/// Order-independent hash over the sorted item fingerprints.
pub fn snapshot_fingerprint(items: &[NormalizedItem]) -> String {
    let mut fingerprints: Vec<&str> = items.iter().map(|i| i.fingerprint.as_str()).collect();
    fingerprints.sort_unstable();
    sha256_hex(fingerprints.concat().as_bytes())
}

/// Diffs `new_items` against the previous snapshot.
///
/// Emits `added`/`modified` in new-item order, then `removed` in previous-item
/// order. Each id appears at most once; repeated ids in `new_items` only count
/// on their first occurrence.
pub fn compute_change_set(
    previous: Option<&Snapshot>,
    new_items: &[NormalizedItem],
) -> Vec<ChangeEvent> {
    let mut previous_by_id: HashMap<&str, &NormalizedItem> = HashMap::new();
    if let Some(snapshot) = previous {
        for item in &snapshot.items {
            previous_by_id.entry(item.id.as_str()).or_insert(item);
        }
    }

    let mut changes = Vec::new();
    let mut seen_new: HashSet<&str> = HashSet::new();

    for item in new_items {
        if !seen_new.insert(item.id.as_str()) {
            continue;
        }
        match previous_by_id.get(item.id.as_str()) {
            None => changes.push(ChangeEvent::Added {
                item_id: item.id.clone(),
                item: item.clone(),
            }),
            Some(old) if old.fingerprint != item.fingerprint => {
                changes.push(ChangeEvent::Modified {
                    item_id: item.id.clone(),
                    diff: diff_data(&old.data, &item.data),
                })
            }
            Some(_) => {}
        }
    }

    if let Some(snapshot) = previous {
        let mut reported: HashSet<&str> = HashSet::new();
        for old in &snapshot.items {
            if !seen_new.contains(old.id.as_str()) && reported.insert(old.id.as_str()) {
                changes.push(ChangeEvent::Removed {
                    item_id: old.id.clone(),
                    item: old.clone(),
                });
            }
        }
    }

    changes
}

/// Field-level diff over the union of top-level keys; a missing key reads as `null`.
fn diff_data(old: &ItemData, new: &ItemData) -> BTreeMap<String, FieldChange> {
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    let mut diff = BTreeMap::new();
    for key in keys {
        let old_value = old.get(key).cloned().unwrap_or(JsonValue::Null);
        let new_value = new.get(key).cloned().unwrap_or(JsonValue::Null);
        if canonical_json(&old_value) != canonical_json(&new_value) {
            diff.insert(key.clone(), FieldChange { old_value, new_value });
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChangeKind;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn item(id: &str, data: JsonValue) -> NormalizedItem {
        let data = data.as_object().cloned().unwrap();
        NormalizedItem::from_data(id, Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(), data)
    }

    fn snapshot(items: Vec<NormalizedItem>) -> Snapshot {
        Snapshot::capture("t1", items, Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap())
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(short_hash("hello world"), "b94d27b9934d3e08");
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"z": [true, null], "y": "q\"uote"}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"y":"q\"uote","z":[true,null]},"b":1}"#
        );
    }

    #[test]
    fn fingerprint_ignores_key_insertion_order() {
        let mut a = ItemData::new();
        a.insert("price".into(), json!(0.5));
        a.insert("volume".into(), json!("100"));
        let mut b = ItemData::new();
        b.insert("volume".into(), json!("100"));
        b.insert("price".into(), json!(0.5));
        assert_eq!(fingerprint(&a), fingerprint(&b));

        b.insert("price".into(), json!(0.51));
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn first_run_reports_every_item_as_added() {
        let items = vec![
            item("1", json!({"val": 1})),
            item("2", json!({"val": 2})),
            item("3", json!({"val": 3})),
        ];
        let changes = compute_change_set(None, &items);
        assert_eq!(changes.len(), 3);
        assert!(changes.iter().all(|c| c.kind() == ChangeKind::Added));
    }

    #[test]
    fn modified_item_carries_field_diff() {
        let before = snapshot(vec![item("1", json!({"val": 1, "name": "x"}))]);
        let after = vec![item("1", json!({"val": 2, "name": "x"}))];
        let changes = compute_change_set(Some(&before), &after);
        assert_eq!(changes.len(), 1);
        match &changes[0] {
            ChangeEvent::Modified { item_id, diff } => {
                assert_eq!(item_id, "1");
                assert_eq!(diff.len(), 1);
                assert_eq!(diff["val"].old_value, json!(1));
                assert_eq!(diff["val"].new_value, json!(2));
            }
            other => panic!("expected modified, got {other:?}"),
        }
    }

    #[test]
    fn dropped_key_diffs_against_null() {
        let before = snapshot(vec![item("1", json!({"val": 1, "note": "gone"}))]);
        let after = vec![item("1", json!({"val": 1}))];
        let changes = compute_change_set(Some(&before), &after);
        let ChangeEvent::Modified { diff, .. } = &changes[0] else {
            panic!("expected modified");
        };
        assert_eq!(diff["note"].old_value, json!("gone"));
        assert_eq!(diff["note"].new_value, JsonValue::Null);
    }

    #[test]
    fn removed_item_keeps_stale_copy() {
        let stale = item("1", json!({"val": 1}));
        let before = snapshot(vec![stale.clone()]);
        let changes = compute_change_set(Some(&before), &[]);
        assert_eq!(
            changes,
            vec![ChangeEvent::Removed {
                item_id: "1".into(),
                item: stale
            }]
        );
    }

    #[test]
    fn duplicate_new_ids_do_not_double_report() {
        let items = vec![item("1", json!({"val": 1})), item("1", json!({"val": 9}))];
        let changes = compute_change_set(None, &items);
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn price_change_and_disappearance_scenario() {
        let before = snapshot(vec![
            item("a", json!({"price": 0.40, "title": "A"})),
            item("b", json!({"price": 0.10, "title": "B"})),
            item("c", json!({"price": 0.77, "title": "C"})),
        ]);
        let after = vec![
            item("a", json!({"price": 0.45, "title": "A"})),
            item("c", json!({"price": 0.77, "title": "C"})),
        ];
        let changes = compute_change_set(Some(&before), &after);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].kind(), ChangeKind::Modified);
        assert_eq!(changes[0].item_id(), "a");
        let ChangeEvent::Modified { diff, .. } = &changes[0] else {
            panic!("expected modified");
        };
        assert_eq!(diff.keys().collect::<Vec<_>>(), vec!["price"]);
        assert_eq!(changes[1].kind(), ChangeKind::Removed);
        assert_eq!(changes[1].item_id(), "b");
    }
}
