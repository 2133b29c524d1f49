use fitcoach_sync::tokens::{ChangeToken, ChangeTokenStore, TokenScope};
use fitcoach_sync::zone::{DatabaseScope, ZoneId};
use tempfile::TempDir;

fn workouts() -> TokenScope {
    TokenScope::Zone(ZoneId::private("workouts"))
}

fn token(bytes: &[u8]) -> ChangeToken {
    ChangeToken::new(bytes.to_vec())
}

// ── In-memory behaviour ──────────────────────────────────────────

#[test]
fn scope_keys_are_stable() {
    assert_eq!(TokenScope::Database(DatabaseScope::Private).key(), "database:private");
    assert_eq!(workouts().key(), "zone:private:workouts");
}

#[test]
fn update_then_read_back() {
    let mut store = ChangeTokenStore::in_memory();
    assert!(store.token_for(&workouts()).is_none());

    store.update(&workouts(), token(&[1, 2, 3]));
    assert_eq!(store.token_for(&workouts()), Some(&token(&[1, 2, 3])));

    store.update(&workouts(), token(&[4]));
    assert_eq!(store.token_for(&workouts()), Some(&token(&[4])));
    assert_eq!(store.len(), 1);
}

#[test]
fn remove_and_clear() {
    let mut store = ChangeTokenStore::in_memory();
    store.update(&workouts(), token(&[1]));
    store.update(&TokenScope::Database(DatabaseScope::Private), token(&[2]));

    assert_eq!(store.remove(&workouts()), Some(token(&[1])));
    assert!(store.token_for(&workouts()).is_none());
    assert_eq!(store.len(), 1);

    store.clear();
    assert!(store.is_empty());
}

#[test]
fn in_memory_persist_is_noop() {
    let mut store = ChangeTokenStore::in_memory();
    store.update(&workouts(), token(&[9]));
    store.persist_all().unwrap();
}

#[test]
fn token_serializes_as_base64() {
    let json = serde_json::to_string(&token(&[0xde, 0xad, 0xbe, 0xef])).unwrap();
    assert_eq!(json, "\"3q2+7w==\"");
    let back: ChangeToken = serde_json::from_str(&json).unwrap();
    assert_eq!(back.as_bytes(), &[0xde, 0xad, 0xbe, 0xef]);
}

#[test]
fn invalid_base64_is_rejected() {
    assert!(ChangeToken::from_base64("***").is_err());
}

// ── Persistence ──────────────────────────────────────────────────

#[test]
fn missing_file_opens_empty() {
    let dir = TempDir::new().unwrap();
    let store = ChangeTokenStore::open(dir.path().join("tokens.json")).unwrap();
    assert!(store.is_empty());
}

#[test]
fn persisted_tokens_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tokens.json");

    let mut store = ChangeTokenStore::open(&path).unwrap();
    store.update(&workouts(), token(&[1, 2]));
    store.update(&TokenScope::Database(DatabaseScope::Private), token(&[3]));
    store.persist_all().unwrap();

    let reopened = ChangeTokenStore::open(&path).unwrap();
    assert_eq!(reopened.token_for(&workouts()), Some(&token(&[1, 2])));
    assert_eq!(
        reopened.token_for(&TokenScope::Database(DatabaseScope::Private)),
        Some(&token(&[3]))
    );
}

#[test]
fn unpersisted_updates_are_lost() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tokens.json");

    let mut store = ChangeTokenStore::open(&path).unwrap();
    store.update(&workouts(), token(&[1]));
    store.persist_all().unwrap();
    store.update(&workouts(), token(&[2]));

    let reopened = ChangeTokenStore::open(&path).unwrap();
    assert_eq!(reopened.token_for(&workouts()), Some(&token(&[1])));
}

#[test]
fn persist_leaves_no_temp_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tokens.json");

    let mut store = ChangeTokenStore::open(&path).unwrap();
    store.update(&workouts(), token(&[1]));
    store.persist_all().unwrap();

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["tokens.json".to_string()]);
}

#[test]
fn corrupt_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tokens.json");
    std::fs::write(&path, b"{ not json").unwrap();

    assert!(ChangeTokenStore::open(&path).is_err());
}
