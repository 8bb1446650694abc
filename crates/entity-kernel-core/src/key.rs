use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::identity::{Identity, Namespace, ScopeStyle};

pub const KEY_SEPARATOR: char = ':';
pub const DEFAULT_MAX_KEY_LENGTH: usize = 1024;
pub const MIN_MAX_KEY_LENGTH: usize = 64;
pub const MAX_MAX_KEY_LENGTH: usize = 2048;

const HASH_TAIL_MARKER: char = '~';
const HASH_TAIL_HEX_LEN: usize = 16;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KeyError {
    #[error("an identifier MUST be provided to derive a key in {namespace}")]
    MissingIdentifier { namespace: String },
    #[error("scope MUST NOT be empty")]
    EmptyScope,
    #[error("scope MUST NOT contain the key separator: {scope}")]
    SeparatorInScope { scope: String },
    #[error("key prefix `{prefix}` leaves no room for an identifier within {max_key_length} bytes")]
    PrefixTooLong { prefix: String, max_key_length: usize },
}

/// What to do with the identifier suffix when a key would exceed the bound.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TruncationStrategy {
    /// Cut the suffix at the last character boundary that fits.
    #[default]
    Truncate,
    /// Keep the head of the suffix and replace the overflow with `~` and a
    /// digest of the full identifier, so identifiers sharing a long prefix
    /// still receive distinct keys.
    HashTail,
}

impl TruncationStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Truncate => "truncate",
            Self::HashTail => "hash_tail",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "truncate" => Some(Self::Truncate),
            "hash_tail" => Some(Self::HashTail),
            _ => None,
        }
    }
}

/// Store-addressable name of a record: `<label>:<scope>:<identifier>`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Wraps a key read back from storage. No derivation rules are applied.
    #[must_use]
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for CanonicalKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct KeyDeriver {
    max_key_length: usize,
    truncation: TruncationStrategy,
}

impl Default for KeyDeriver {
    fn default() -> Self {
        Self { max_key_length: DEFAULT_MAX_KEY_LENGTH, truncation: TruncationStrategy::Truncate }
    }
}

impl KeyDeriver {
    /// Callers are expected to have validated `max_key_length` through
    /// [`crate::EngineConfig::validate`]; values are clamped to the supported range.
    #[must_use]
    pub fn new(max_key_length: usize, truncation: TruncationStrategy) -> Self {
        Self {
            max_key_length: max_key_length.clamp(MIN_MAX_KEY_LENGTH, MAX_MAX_KEY_LENGTH),
            truncation,
        }
    }

    #[must_use]
    pub fn max_key_length(&self) -> usize {
        self.max_key_length
    }

    #[must_use]
    pub fn truncation(&self) -> TruncationStrategy {
        self.truncation
    }

    /// Derive the key from the highest-ranked identifier present.
    ///
    /// # Errors
    /// Returns [`KeyError::EmptyScope`] for a blank scope,
    /// [`KeyError::MissingIdentifier`] when neither identifier is present, and
    /// [`KeyError::PrefixTooLong`] when the prefix alone reaches the bound.
    pub fn derive(&self, namespace: &Namespace, identity: &Identity) -> Result<CanonicalKey, KeyError> {
        let prefix = self.checked_prefix(namespace)?;
        let Some((_, identifier)) = identity.strongest() else {
            return Err(KeyError::MissingIdentifier { namespace: namespace.prefix() });
        };
        Ok(self.compose(prefix, identifier.trim()))
    }

    /// The key the record would carry if only its weak identifier were known.
    ///
    /// # Errors
    /// Same prefix failures as [`KeyDeriver::derive`].
    pub fn derive_weak(
        &self,
        namespace: &Namespace,
        identity: &Identity,
    ) -> Result<Option<CanonicalKey>, KeyError> {
        let prefix = self.checked_prefix(namespace)?;
        Ok(identity.weak().map(|weak| self.compose(prefix, weak.trim())))
    }

    fn checked_prefix(&self, namespace: &Namespace) -> Result<String, KeyError> {
        let scope = namespace.scope.trim();
        if scope.is_empty() {
            return Err(KeyError::EmptyScope);
        }
        if scope.contains(KEY_SEPARATOR) {
            return Err(KeyError::SeparatorInScope { scope: scope.to_string() });
        }
        // Namespaces may be built without `Namespace::new`, so fold here too.
        let scope = match namespace.kind.scope_style() {
            ScopeStyle::Domain => scope.to_ascii_lowercase(),
            ScopeStyle::Tenant => scope.to_string(),
        };
        let label = namespace.kind.label();
        let prefix = format!("{label}{KEY_SEPARATOR}{scope}{KEY_SEPARATOR}");
        if prefix.len() >= self.max_key_length {
            return Err(KeyError::PrefixTooLong { prefix, max_key_length: self.max_key_length });
        }
        Ok(prefix)
    }

    fn compose(&self, mut prefix: String, identifier: &str) -> CanonicalKey {
        let suffix = identifier.to_lowercase();
        let budget = self.max_key_length - prefix.len();
        if suffix.len() <= budget {
            prefix.push_str(&suffix);
            return CanonicalKey(prefix);
        }

        match self.truncation {
            TruncationStrategy::Truncate => {
                prefix.push_str(&suffix[..floor_char_boundary(&suffix, budget)]);
            }
            TruncationStrategy::HashTail => {
                let tail_len = HASH_TAIL_MARKER.len_utf8() + HASH_TAIL_HEX_LEN;
                if budget > tail_len {
                    let head = floor_char_boundary(&suffix, budget - tail_len);
                    let digest = format!("{:x}", Sha256::digest(suffix.as_bytes()));
                    prefix.push_str(&suffix[..head]);
                    prefix.push(HASH_TAIL_MARKER);
                    prefix.push_str(&digest[..HASH_TAIL_HEX_LEN]);
                } else {
                    prefix.push_str(&suffix[..floor_char_boundary(&suffix, budget)]);
                }
            }
        }
        CanonicalKey(prefix)
    }
}

/// Largest index `<= max` that sits on a char boundary of `value`.
fn floor_char_boundary(value: &str, max: usize) -> usize {
    if max >= value.len() {
        return value.len();
    }
    let mut index = max;
    while index > 0 && !value.is_char_boundary(index) {
        index -= 1;
    }
    index
}
