//! Chunk cache interface
//!
//! Entries are keyed by [`ChunkKey::cache_key`] and expire lazily on read;
//! `cleanup_expired` is the opportunistic sweep that bounds storage growth.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::Result;

use super::types::{CachedChunk, ChunkKey};

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: u64,
    pub expired_entries: u64,
    pub valid_entries: u64,
}

/// TTL store of raw per-window payloads
#[async_trait]
pub trait ChunkCache: Send + Sync {
    /// Fresh entry for `key`, or `None`. An expired entry is a miss and is
    /// removed on the way out.
    async fn get(&self, key: &ChunkKey) -> Result<Option<CachedChunk>>;

    /// Insert or overwrite. `ttl = None` uses the store's default TTL.
    async fn put(&self, key: &ChunkKey, payload: &Value, ttl: Option<Duration>) -> Result<()>;

    /// Remove every entry whose cache key matches a glob pattern
    /// (`*` any run, `?` one character), e.g. `ozon:*` or `*:2024-03-*`.
    async fn invalidate(&self, pattern: &str) -> Result<u64>;

    /// Delete expired entries, returning how many were removed
    async fn cleanup_expired(&self) -> Result<u64>;

    async fn stats(&self) -> Result<CacheStats>;
}

/// Glob match over cache keys with SQLite `GLOB` semantics: `*`, `?` and
/// `[...]` classes (ranges, `^` negation, a leading `]` is literal).
/// Case-sensitive; an unterminated class never matches.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    // Pattern index after the last `*` and the text index it is matched up to
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                '*' => {
                    star = Some((p + 1, t));
                    p += 1;
                    continue;
                },
                '?' => {
                    p += 1;
                    t += 1;
                    continue;
                },
                '[' => match match_class(&pattern, p, text[t]) {
                    Some((true, next)) => {
                        p = next;
                        t += 1;
                        continue;
                    },
                    Some((false, _)) => {},
                    None => return false,
                },
                c if c == text[t] => {
                    p += 1;
                    t += 1;
                    continue;
                },
                _ => {},
            }
        }

        match star {
            Some((after_star, matched_to)) => {
                p = after_star;
                t = matched_to + 1;
                star = Some((after_star, t));
            },
            None => return false,
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

/// Test `c` against the class opening at `pattern[open]`. Returns the
/// outcome and the index past the closing `]`, or `None` if unterminated.
fn match_class(pattern: &[char], open: usize, c: char) -> Option<(bool, usize)> {
    let mut i = open + 1;
    let negated = pattern.get(i) == Some(&'^');
    if negated {
        i += 1;
    }

    let mut found = false;
    let mut first = true;
    loop {
        let lo = *pattern.get(i)?;
        if lo == ']' && !first {
            break;
        }
        first = false;

        match (pattern.get(i + 1), pattern.get(i + 2)) {
            (Some('-'), Some(hi)) if *hi != ']' => {
                found |= lo <= c && c <= *hi;
                i += 3;
            },
            _ => {
                found |= lo == c;
                i += 1;
            },
        }
    }

    Some((found != negated, i + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        let key = "ozon:2024-03-01:2024-03-31:0123456789abcdef";
        assert!(glob_match("ozon:*", key));
        assert!(glob_match("*:2024-03-*", key));
        assert!(glob_match("ozon:2024-0?-01:*", key));
        assert!(glob_match("*", key));
        assert!(!glob_match("wildberries:*", key));
        assert!(!glob_match("ozon:2024-04-*", key));
        assert!(!glob_match("ozon", key));
    }

    #[test]
    fn test_glob_character_classes() {
        let key = "ozon:2024-03-01:2024-03-31:0123456789abcdef";
        assert!(glob_match("ozon:2024-0[34]-*", key));
        assert!(glob_match("ozon:2024-0[1-3]-*", key));
        assert!(glob_match("[ow]*:2024-03-*", key));
        assert!(!glob_match("ozon:2024-0[^3]-*", key));
        assert!(glob_match("ozon:2024-0[^4]-*", key));
        assert!(!glob_match("ozon:2024-0[4-9]-*", key));

        // `]` first in a class and `-` last are literal
        assert!(glob_match("a[]]b", "a]b"));
        assert!(glob_match("a[x-]b", "a-b"));

        // Unterminated classes match nothing, even after a star
        assert!(!glob_match("ozon:[2024*", key));
        assert!(!glob_match("*[", key));
    }
}
