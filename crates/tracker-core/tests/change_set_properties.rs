use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;
use tracker_core::{
    compute_change_set, snapshot_fingerprint, ChangeKind, ItemData, NormalizedItem, Snapshot,
};

fn item(id: u8, value: u8) -> NormalizedItem {
    let mut data = ItemData::new();
    data.insert("value".into(), json!(value));
    data.insert("label".into(), json!(format!("item-{id}")));
    NormalizedItem::from_data(
        id.to_string(),
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
        data,
    )
}

/// Unique-id item sets as id -> value maps.
fn item_set() -> impl Strategy<Value = BTreeMap<u8, u8>> {
    prop::collection::btree_map(0u8..24, 0u8..4, 0..16)
}

fn items(set: &BTreeMap<u8, u8>) -> Vec<NormalizedItem> {
    set.iter().map(|(id, value)| item(*id, *value)).collect()
}

proptest! {
    #[test]
    fn change_set_partitions_ids(old in item_set(), new in item_set()) {
        let previous = Snapshot::capture("t", items(&old), Utc::now());
        let changes = compute_change_set(Some(&previous), &items(&new));

        let mut by_kind: HashMap<ChangeKind, BTreeSet<String>> = HashMap::new();
        let mut seen = BTreeSet::new();
        for change in &changes {
            prop_assert!(seen.insert(change.item_id().to_string()), "id reported twice");
            by_kind.entry(change.kind()).or_default().insert(change.item_id().to_string());
        }

        let old_ids: BTreeSet<String> = old.keys().map(|k| k.to_string()).collect();
        let new_ids: BTreeSet<String> = new.keys().map(|k| k.to_string()).collect();
        let added: BTreeSet<String> = new_ids.difference(&old_ids).cloned().collect();
        let removed: BTreeSet<String> = old_ids.difference(&new_ids).cloned().collect();
        let modified: BTreeSet<String> = new
            .iter()
            .filter(|(id, value)| old.get(id).is_some_and(|prev| prev != *value))
            .map(|(id, _)| id.to_string())
            .collect();

        prop_assert_eq!(by_kind.remove(&ChangeKind::Added).unwrap_or_default(), added);
        prop_assert_eq!(by_kind.remove(&ChangeKind::Removed).unwrap_or_default(), removed);
        prop_assert_eq!(by_kind.remove(&ChangeKind::Modified).unwrap_or_default(), modified);
    }

    #[test]
    fn rediffing_own_items_is_empty(set in item_set()) {
        let snapshot = Snapshot::capture("t", items(&set), Utc::now());
        prop_assert!(compute_change_set(Some(&snapshot), &snapshot.items).is_empty());
    }

    #[test]
    fn snapshot_fingerprint_ignores_order(set in item_set(), seed in any::<u64>()) {
        let forward = items(&set);
        let mut shuffled = forward.clone();
        if !shuffled.is_empty() {
            let len = shuffled.len();
            shuffled.rotate_left((seed as usize) % len);
        }
        shuffled.reverse();
        prop_assert_eq!(snapshot_fingerprint(&forward), snapshot_fingerprint(&shuffled));
    }
}
