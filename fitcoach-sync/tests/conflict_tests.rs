use chrono::{DateTime, Duration, TimeZone, Utc};
use fitcoach_sync::conflict::{ConflictLedger, resolve};
use fitcoach_sync::record::{FieldValue, Record};
use fitcoach_sync::{ConflictDecision, ConflictStrategy, ConflictedEntity};
use fitcoach_types::{EntityId, RecordKey, RecordType};
use proptest::prelude::*;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn parked(key: RecordKey) -> ConflictedEntity {
    ConflictedEntity {
        key,
        local: None,
        remote: None,
        detected_at: at(0),
    }
}

// ── Strategies ───────────────────────────────────────────────────

#[test]
fn fixed_strategies_ignore_timestamps() {
    assert_eq!(
        resolve(ConflictStrategy::ServerWins, at(100), Some(at(0))),
        ConflictDecision::UseRemote
    );
    assert_eq!(
        resolve(ConflictStrategy::ClientWins, at(0), Some(at(100))),
        ConflictDecision::UseLocal
    );
    assert_eq!(
        resolve(ConflictStrategy::Manual, at(0), None),
        ConflictDecision::RequiresManualResolution
    );
}

#[test]
fn newest_wins_picks_strictly_newer_side() {
    assert_eq!(
        resolve(ConflictStrategy::NewestWins, at(10), Some(at(5))),
        ConflictDecision::UseLocal
    );
    assert_eq!(
        resolve(ConflictStrategy::NewestWins, at(5), Some(at(10))),
        ConflictDecision::UseRemote
    );
}

#[test]
fn newest_wins_tie_goes_to_remote() {
    assert_eq!(
        resolve(ConflictStrategy::NewestWins, at(7), Some(at(7))),
        ConflictDecision::UseRemote
    );
}

#[test]
fn missing_remote_timestamp_goes_to_remote() {
    assert_eq!(
        resolve(ConflictStrategy::NewestWins, at(1_000_000), None),
        ConflictDecision::UseRemote
    );
}

#[test]
fn default_strategy_is_server_wins() {
    assert_eq!(ConflictStrategy::default(), ConflictStrategy::ServerWins);
}

#[test]
fn strategy_serializes_camel_case() {
    assert_eq!(
        serde_json::to_string(&ConflictStrategy::NewestWins).unwrap(),
        "\"newestWins\""
    );
}

proptest! {
    #[test]
    fn newest_wins_is_deterministic(local in -1_000_000i64..1_000_000, remote in -1_000_000i64..1_000_000) {
        let first = resolve(ConflictStrategy::NewestWins, at(local), Some(at(remote)));
        let second = resolve(ConflictStrategy::NewestWins, at(local), Some(at(remote)));
        prop_assert_eq!(first, second);
        let expected = if local > remote {
            ConflictDecision::UseLocal
        } else {
            ConflictDecision::UseRemote
        };
        prop_assert_eq!(first, expected);
    }
}

// ── Ledger ───────────────────────────────────────────────────────

#[test]
fn ledger_records_and_takes() {
    let mut ledger = ConflictLedger::new();
    let key = RecordKey::new(RecordType::Goal, EntityId::new());
    ledger.record(parked(key));

    assert!(ledger.contains(&key));
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger.take(&key).map(|c| c.key), Some(key));
    assert!(ledger.is_empty());
}

#[test]
fn ledger_tracks_later_changes_on_both_sides() {
    let mut ledger = ConflictLedger::new();
    let key = RecordKey::new(RecordType::Goal, EntityId::new());
    ledger.record(parked(key));

    let mut remote = Record::new(key);
    remote.set("title", FieldValue::String("Run 10k".into()));
    remote.modified_at = Some(at(0) + Duration::minutes(1));
    ledger.update_remote(&key, Some(remote.clone()));
    ledger.update_local(&key, None);

    let entry = ledger.get(&key).unwrap();
    assert_eq!(entry.remote.as_ref(), Some(&remote));
    assert!(entry.local.is_none());
}

#[test]
fn updates_for_unknown_keys_are_ignored() {
    let mut ledger = ConflictLedger::new();
    let key = RecordKey::new(RecordType::Goal, EntityId::new());
    ledger.update_remote(&key, None);
    assert!(ledger.is_empty());
}

#[test]
fn ledger_lists_in_key_order_and_clears() {
    let mut ledger = ConflictLedger::new();
    let keys: Vec<RecordKey> = (0..3)
        .map(|_| RecordKey::new(RecordType::FoodEntry, EntityId::new()))
        .collect();
    for key in keys.iter().rev() {
        ledger.record(parked(*key));
    }

    let listed: Vec<RecordKey> = ledger.list().into_iter().map(|c| c.key).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(listed, sorted);

    ledger.clear();
    assert!(ledger.is_empty());
}
