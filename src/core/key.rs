use std::fmt;

/// Longest key memcached accepts, in bytes
pub const MAX_KEY_LENGTH: usize = 250;

/// A key that is safe to put on the wire: non-empty, at most 250 bytes with
/// the prefix applied, and free of whitespace and control characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    full: String,
    prefix_len: usize,
}

impl CacheKey {
    pub fn new(prefix: &str, key: &str) -> Result<Self, KeyError> {
        if key.is_empty() {
            return Err(KeyError::Empty);
        }
        if let Some(bad) = key.chars().find(|c| is_forbidden(*c)) {
            return Err(KeyError::InvalidCharacter {
                key: key.to_string(),
                character: bad,
            });
        }
        let length = prefix.len() + key.len();
        if length > MAX_KEY_LENGTH {
            return Err(KeyError::TooLong {
                length,
                max: MAX_KEY_LENGTH,
            });
        }
        Ok(Self {
            full: format!("{}{}", prefix, key),
            prefix_len: prefix.len(),
        })
    }

    /// Key as sent to the server, prefix included
    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// Key as the caller gave it
    pub fn unprefixed(&self) -> &str {
        &self.full[self.prefix_len..]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

fn is_forbidden(c: char) -> bool {
    c.is_control() || c.is_whitespace()
}

/// Checks a prefix against the same character and length rules as keys
pub fn validate_prefix(prefix: &str) -> Result<(), KeyError> {
    if let Some(bad) = prefix.chars().find(|c| is_forbidden(*c)) {
        return Err(KeyError::InvalidCharacter {
            key: prefix.to_string(),
            character: bad,
        });
    }
    if prefix.len() >= MAX_KEY_LENGTH {
        return Err(KeyError::TooLong {
            length: prefix.len(),
            max: MAX_KEY_LENGTH - 1,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Key must not be empty")]
    Empty,
    #[error("Key is {length} bytes, longer than the {max} byte limit")]
    TooLong { length: usize, max: usize },
    #[error("Key {key:?} contains invalid character {character:?}")]
    InvalidCharacter { key: String, character: char },
}
