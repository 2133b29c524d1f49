//! Change token persistence.
//!
//! Tokens are opaque cursors handed out by the remote change feeds. They are
//! stored as base64 strings in a small JSON document keyed by scope. Writes
//! go to a sibling temp file which is then renamed over the document, so a
//! crash leaves either the old or the new set of tokens, never a torn file.

use crate::error::{SyncError, SyncResult};
use crate::zone::{DatabaseScope, ZoneId};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Opaque cursor into a remote change feed.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ChangeToken(Vec<u8>);

impl ChangeToken {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Base64 text form, as persisted.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    pub fn from_base64(text: &str) -> SyncResult<Self> {
        STANDARD
            .decode(text)
            .map(Self)
            .map_err(|e| SyncError::Storage(format!("invalid change token: {e}")))
    }
}

impl fmt::Debug for ChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangeToken({})", self.to_base64())
    }
}

impl Serialize for ChangeToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for ChangeToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        ChangeToken::from_base64(&text).map_err(serde::de::Error::custom)
    }
}

/// The feed a token belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TokenScope {
    /// The database-level feed of changed zones.
    Database(DatabaseScope),
    /// One zone's record feed.
    Zone(ZoneId),
}

impl TokenScope {
    /// Stable string key used in the token document.
    pub fn key(&self) -> String {
        match self {
            TokenScope::Database(scope) => format!("database:{}", scope.as_str()),
            TokenScope::Zone(zone) => format!("zone:{}:{}", zone.scope.as_str(), zone.name),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenDocument {
    version: u32,
    tokens: BTreeMap<String, ChangeToken>,
}

const DOCUMENT_VERSION: u32 = 1;

/// Tokens by scope, optionally backed by a file.
#[derive(Debug)]
pub struct ChangeTokenStore {
    path: Option<PathBuf>,
    tokens: BTreeMap<String, ChangeToken>,
}

impl ChangeTokenStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            tokens: BTreeMap::new(),
        }
    }

    /// Opens the token document at `path`. A missing file is an empty store.
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref().to_path_buf();
        let tokens = match std::fs::read(&path) {
            Ok(bytes) => {
                let doc: TokenDocument = serde_json::from_slice(&bytes)?;
                if doc.version != DOCUMENT_VERSION {
                    return Err(SyncError::Storage(format!(
                        "unsupported token document version {}",
                        doc.version
                    )));
                }
                doc.tokens
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("Loaded {} change tokens from {}", tokens.len(), path.display());
        Ok(Self {
            path: Some(path),
            tokens,
        })
    }

    pub fn token_for(&self, scope: &TokenScope) -> Option<&ChangeToken> {
        self.tokens.get(&scope.key())
    }

    /// Replaces the token for a scope (in memory; see [`Self::persist_all`]).
    pub fn update(&mut self, scope: &TokenScope, token: ChangeToken) {
        self.tokens.insert(scope.key(), token);
    }

    pub fn remove(&mut self, scope: &TokenScope) -> Option<ChangeToken> {
        self.tokens.remove(&scope.key())
    }

    /// Forgets every token, forcing the next fetch to start from scratch.
    pub fn clear(&mut self) {
        self.tokens.clear();
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Scope keys with a stored token.
    pub fn scope_keys(&self) -> Vec<String> {
        self.tokens.keys().cloned().collect()
    }

    /// Stored tokens in scope key order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &ChangeToken)> {
        self.tokens.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Writes all tokens to disk atomically. No-op for in-memory stores.
    pub fn persist_all(&self) -> SyncResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let doc = TokenDocument {
            version: DOCUMENT_VERSION,
            tokens: self.tokens.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;

        let tmp = path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        debug!("Persisted {} change tokens", self.tokens.len());
        Ok(())
    }
}
