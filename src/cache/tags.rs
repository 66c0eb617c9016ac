//! Tag-based invalidation
//!
//! Each tag on an entry is a marker key `<prefix>tag:<tag>:<key>` written
//! with the entry's TTL, so markers never outlive what they track.
//! Invalidating a tag enumerates its markers and deletes each tracked entry
//! together with its marker.

use std::time::Duration;

use super::manager::CacheManager;
use crate::common::utils::escape_glob;
use crate::common::{Error, OpContext, Result};

const TAG_MARKER: &[u8] = b"1";

/// Tags are a single marker-key segment
fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() || tag.contains(':') {
        return Err(Error::InvalidConfig(format!(
            "invalid tag {:?}: must be non-empty without ':'",
            tag
        )));
    }
    Ok(())
}

/// Cache entries grouped by tag
///
/// Markers are only removed by [`TaggedCache::delete`], tag invalidation or
/// expiry. Deleting an entry through [`CacheManager::delete`] leaves its
/// markers behind, so a later write under the same key is still invalidated
/// with the old tags until the markers expire.
#[derive(Clone)]
pub struct TaggedCache {
    cache: CacheManager,
}

impl TaggedCache {
    pub fn new(cache: CacheManager) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    fn tag_prefix(&self, tag: &str) -> String {
        self.cache.storage_key(&format!("tag:{}:", tag))
    }

    /// Store key of the marker tying `key` to `tag`
    pub fn tag_key(&self, tag: &str, key: &str) -> String {
        format!("{}{}", self.tag_prefix(tag), key)
    }

    /// Write the entry, then one marker per tag sharing the entry's TTL
    pub async fn set_with_tags(
        &self,
        ctx: &OpContext,
        key: &str,
        value: &[u8],
        tags: &[&str],
        ttl: Option<Duration>,
    ) -> Result<()> {
        for tag in tags {
            validate_tag(tag)?;
        }
        let ttl = match ttl {
            Some(ttl) => self.cache.strategy().clamp(ttl),
            None => self.cache.ttl_for_key(key),
        };
        self.cache.set(ctx, key, value, Some(ttl)).await?;

        for tag in tags {
            self.cache
                .client()
                .set(ctx, &self.tag_key(tag, key), TAG_MARKER, Some(ttl))
                .await?;
        }
        Ok(())
    }

    /// Delete the entry and its markers for `tags`
    ///
    /// Returns whether the entry itself was removed.
    pub async fn delete(&self, ctx: &OpContext, key: &str, tags: &[&str]) -> Result<bool> {
        for tag in tags {
            validate_tag(tag)?;
        }
        let removed = self.cache.delete(ctx, key).await?;
        let markers: Vec<String> = tags.iter().map(|tag| self.tag_key(tag, key)).collect();
        self.cache.client().delete(ctx, &markers[..]).await?;
        Ok(removed)
    }

    /// Delete every entry tagged `tag` and the tag's markers
    ///
    /// Returns the number of tracked keys processed. Entries that already
    /// expired still have their marker removed.
    pub async fn invalidate_by_tag(&self, ctx: &OpContext, tag: &str) -> Result<usize> {
        validate_tag(tag)?;
        let client = self.cache.client();
        let marker_prefix = self.tag_prefix(tag);
        let pattern = format!(
            "{}{}:*",
            escape_glob(&self.cache.storage_key("tag:")),
            escape_glob(tag)
        );
        let markers = client.keys(ctx, &pattern).await?;

        let mut processed = 0;
        let mut removed_entries = 0;
        for marker in &markers {
            let Some(key) = marker.strip_prefix(&marker_prefix) else {
                continue;
            };
            let entry = self.cache.storage_key(key);
            match client.delete(ctx, &[entry.as_str(), marker.as_str()]).await {
                Ok(n) => {
                    processed += 1;
                    // n counts the marker too when the entry was still live
                    removed_entries += n.saturating_sub(1);
                }
                Err(e) if e.is_context_error() => return Err(e),
                Err(e) => tracing::warn!(tag, key, "Failed to invalidate tagged entry: {}", e),
            }
        }

        self.cache.record_invalidations(removed_entries);
        tracing::debug!(tag, processed, "Invalidated tag");
        Ok(processed)
    }

    pub async fn invalidate_by_tags(&self, ctx: &OpContext, tags: &[&str]) -> Result<usize> {
        let mut processed = 0;
        for tag in tags {
            processed += self.invalidate_by_tag(ctx, tag).await?;
        }
        Ok(processed)
    }
}
