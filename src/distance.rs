//! # Distance Providers
//!
//! Pairwise travel cost between portals. The route engine only ever talks to a
//! [`DistanceProvider`]; whether the answer comes from an upstream directions
//! service, the confidence-tagged [`DistanceCache`] or a straight-line estimate
//! is the provider's business.

use std::collections::HashMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::DistanceCacheConfig;
use crate::error::{CatalogError, Result};
use crate::geo_utils::haversine_distance;
use crate::types::Portal;

// ============================================================================
// Cache entries
// ============================================================================

/// How much a cached distance can be trusted.
///
/// Ordered: a higher confidence always wins over a lower one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Local straight-line fallback
    Estimated,
    /// Measured by an external service
    Authoritative,
}

impl Confidence {
    /// Stable integer rank used for persistence and comparison in SQL.
    pub fn rank(&self) -> i64 {
        match self {
            Confidence::Estimated => 0,
            Confidence::Authoritative => 1,
        }
    }

    pub fn from_rank(rank: i64) -> Self {
        if rank >= 1 {
            Confidence::Authoritative
        } else {
            Confidence::Estimated
        }
    }
}

/// Unordered pair of portal ids, stored with the smaller id first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortalPair(String, String);

impl PortalPair {
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self(a.to_string(), b.to_string())
        } else {
            Self(b.to_string(), a.to_string())
        }
    }

    pub fn first(&self) -> &str {
        &self.0
    }

    pub fn second(&self) -> &str {
        &self.1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistanceEntry {
    /// Meters
    pub distance: f64,
    pub confidence: Confidence,
    /// Unix timestamp (seconds)
    pub recorded_at: i64,
}

/// In-memory pairwise distance cache.
#[derive(Debug, Clone, Default)]
pub struct DistanceCache {
    entries: HashMap<PortalPair, DistanceEntry>,
    dirty: bool,
}

impl DistanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, a: &str, b: &str) -> Option<&DistanceEntry> {
        self.entries.get(&PortalPair::new(a, b))
    }

    /// Store an entry unless an equal or higher confidence one is already cached.
    ///
    /// Returns whether the cache changed.
    pub fn insert(&mut self, pair: PortalPair, entry: DistanceEntry) -> bool {
        match self.entries.get(&pair) {
            Some(existing) if existing.confidence >= entry.confidence => false,
            _ => {
                self.entries.insert(pair, entry);
                self.dirty = true;
                true
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PortalPair, &DistanceEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether entries were added since the cache was loaded or last saved.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Drop entries recorded before `now - max_age_secs`.
    pub fn purge_stale(&mut self, now: i64, max_age_secs: i64) -> usize {
        let cutoff = now - max_age_secs;
        let before = self.entries.len();
        self.entries.retain(|_, e| e.recorded_at >= cutoff);
        before - self.entries.len()
    }
}

// ============================================================================
// Providers
// ============================================================================

/// Source of pairwise travel cost.
///
/// May fail with [`CatalogError::ProviderUnavailable`] when the backing service
/// is down or out of quota; callers treat that as "use the fallback estimate".
pub trait DistanceProvider {
    fn distance(&mut self, from: &Portal, to: &Portal) -> Result<f64>;
}

impl<P: DistanceProvider + ?Sized> DistanceProvider for &mut P {
    fn distance(&mut self, from: &Portal, to: &Portal) -> Result<f64> {
        (**self).distance(from, to)
    }
}

impl<P: DistanceProvider + ?Sized> DistanceProvider for Box<P> {
    fn distance(&mut self, from: &Portal, to: &Portal) -> Result<f64> {
        (**self).distance(from, to)
    }
}

/// Great-circle distance. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct StraightLineProvider;

impl DistanceProvider for StraightLineProvider {
    fn distance(&mut self, from: &Portal, to: &Portal) -> Result<f64> {
        Ok(haversine_distance(&from.position, &to.position))
    }
}

/// Wraps an upstream provider with a confidence-tagged cache and a call quota.
///
/// Authoritative cached answers are returned without calling upstream. When
/// upstream fails or the quota is spent, the pair is answered with a cached or
/// freshly computed straight-line estimate, which is cached as `Estimated`.
pub struct CachingProvider<P> {
    upstream: P,
    cache: DistanceCache,
    max_upstream_calls: Option<usize>,
    upstream_calls: usize,
    now: i64,
}

impl<P: DistanceProvider> CachingProvider<P> {
    /// `now` stamps newly cached entries.
    pub fn new(upstream: P, cache: DistanceCache, config: &DistanceCacheConfig, now: i64) -> Self {
        Self {
            upstream,
            cache,
            max_upstream_calls: config.max_upstream_calls,
            upstream_calls: 0,
            now,
        }
    }

    pub fn cache(&self) -> &DistanceCache {
        &self.cache
    }

    /// Hand back the cache so newly learned distances can be persisted.
    pub fn into_cache(self) -> DistanceCache {
        self.cache
    }

    pub fn upstream_calls(&self) -> usize {
        self.upstream_calls
    }

    fn quota_spent(&self) -> bool {
        self.max_upstream_calls
            .is_some_and(|max| self.upstream_calls >= max)
    }

    fn ask_upstream(&mut self, from: &Portal, to: &Portal) -> Result<f64> {
        if self.quota_spent() {
            return Err(CatalogError::ProviderUnavailable {
                message: format!("upstream quota of {} calls spent", self.upstream_calls),
            });
        }
        self.upstream_calls += 1;
        self.upstream.distance(from, to)
    }
}

impl<P: DistanceProvider> DistanceProvider for CachingProvider<P> {
    fn distance(&mut self, from: &Portal, to: &Portal) -> Result<f64> {
        if from.id == to.id {
            return Ok(0.0);
        }

        let cached = self.cache.get(&from.id, &to.id).copied();
        if let Some(entry) = cached {
            if entry.confidence == Confidence::Authoritative {
                return Ok(entry.distance);
            }
        }

        let pair = PortalPair::new(&from.id, &to.id);
        match self.ask_upstream(from, to) {
            Ok(distance) => {
                self.cache.insert(
                    pair,
                    DistanceEntry {
                        distance,
                        confidence: Confidence::Authoritative,
                        recorded_at: self.now,
                    },
                );
                Ok(distance)
            }
            Err(e) if e.is_transient() => {
                debug!(
                    "[Route] Upstream distance {} -> {} unavailable ({}), estimating",
                    from.id, to.id, e
                );
                if let Some(entry) = cached {
                    return Ok(entry.distance);
                }
                let distance = haversine_distance(&from.position, &to.position);
                self.cache.insert(
                    pair,
                    DistanceEntry {
                        distance,
                        confidence: Confidence::Estimated,
                        recorded_at: self.now,
                    },
                );
                Ok(distance)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GeoPoint;

    fn portal(id: &str, lat: f64, lng: f64) -> Portal {
        Portal::new(id, id, GeoPoint::new(lat, lng), 0)
    }

    /// Upstream returning a fixed cost, failing after `fail_after` calls.
    struct FixedUpstream {
        cost: f64,
        calls: usize,
        fail_after: Option<usize>,
    }

    impl DistanceProvider for FixedUpstream {
        fn distance(&mut self, _from: &Portal, _to: &Portal) -> Result<f64> {
            self.calls += 1;
            if self.fail_after.is_some_and(|n| self.calls > n) {
                return Err(CatalogError::ProviderUnavailable {
                    message: "offline".to_string(),
                });
            }
            Ok(self.cost)
        }
    }

    #[test]
    fn test_pair_is_unordered() {
        assert_eq!(PortalPair::new("b", "a"), PortalPair::new("a", "b"));
        assert_eq!(PortalPair::new("b", "a").first(), "a");
    }

    #[test]
    fn test_cache_never_downgrades() {
        let mut cache = DistanceCache::new();
        let pair = PortalPair::new("a", "b");
        let authoritative = DistanceEntry {
            distance: 120.0,
            confidence: Confidence::Authoritative,
            recorded_at: 10,
        };
        assert!(cache.insert(pair.clone(), authoritative));
        assert!(!cache.insert(
            pair.clone(),
            DistanceEntry {
                distance: 90.0,
                confidence: Confidence::Estimated,
                recorded_at: 20,
            }
        ));
        assert!(!cache.insert(
            pair,
            DistanceEntry {
                distance: 130.0,
                confidence: Confidence::Authoritative,
                recorded_at: 30,
            }
        ));
        assert_eq!(cache.get("b", "a"), Some(&authoritative));
    }

    #[test]
    fn test_estimate_upgraded_by_authoritative() {
        let mut cache = DistanceCache::new();
        cache.insert(
            PortalPair::new("a", "b"),
            DistanceEntry {
                distance: 90.0,
                confidence: Confidence::Estimated,
                recorded_at: 1,
            },
        );
        assert!(cache.insert(
            PortalPair::new("a", "b"),
            DistanceEntry {
                distance: 120.0,
                confidence: Confidence::Authoritative,
                recorded_at: 2,
            }
        ));
        assert_eq!(cache.get("a", "b").map(|e| e.distance), Some(120.0));
    }

    #[test]
    fn test_caching_provider_reuses_authoritative() {
        let upstream = FixedUpstream {
            cost: 500.0,
            calls: 0,
            fail_after: None,
        };
        let mut provider =
            CachingProvider::new(upstream, DistanceCache::new(), &DistanceCacheConfig::default(), 0);
        let a = portal("a", 0.0, 0.0);
        let b = portal("b", 0.0, 0.01);

        assert_eq!(provider.distance(&a, &b).unwrap(), 500.0);
        assert_eq!(provider.distance(&b, &a).unwrap(), 500.0);
        assert_eq!(provider.upstream_calls(), 1);
    }

    #[test]
    fn test_quota_falls_back_to_estimate() {
        let upstream = FixedUpstream {
            cost: 500.0,
            calls: 0,
            fail_after: None,
        };
        let config = DistanceCacheConfig {
            max_upstream_calls: Some(1),
            ..Default::default()
        };
        let mut provider = CachingProvider::new(upstream, DistanceCache::new(), &config, 0);
        let a = portal("a", 0.0, 0.0);
        let b = portal("b", 0.0, 0.01);
        let c = portal("c", 0.0, 0.02);

        assert_eq!(provider.distance(&a, &b).unwrap(), 500.0);
        let estimate = provider.distance(&a, &c).unwrap();
        assert!((estimate - haversine_distance(&a.position, &c.position)).abs() < 1e-9);

        let cache = provider.into_cache();
        assert_eq!(
            cache.get("a", "c").map(|e| e.confidence),
            Some(Confidence::Estimated)
        );
    }

    #[test]
    fn test_upstream_failure_uses_cached_estimate() {
        let mut cache = DistanceCache::new();
        cache.insert(
            PortalPair::new("a", "b"),
            DistanceEntry {
                distance: 777.0,
                confidence: Confidence::Estimated,
                recorded_at: 0,
            },
        );
        let upstream = FixedUpstream {
            cost: 500.0,
            calls: 0,
            fail_after: Some(0),
        };
        let mut provider =
            CachingProvider::new(upstream, cache, &DistanceCacheConfig::default(), 0);
        let a = portal("a", 0.0, 0.0);
        let b = portal("b", 0.0, 0.01);
        assert_eq!(provider.distance(&a, &b).unwrap(), 777.0);
    }

    #[test]
    fn test_purge_stale() {
        let mut cache = DistanceCache::new();
        for (id, ts) in [("b", 10), ("c", 100)] {
            cache.insert(
                PortalPair::new("a", id),
                DistanceEntry {
                    distance: 1.0,
                    confidence: Confidence::Estimated,
                    recorded_at: ts,
                },
            );
        }
        assert_eq!(cache.purge_stale(150, 60), 1);
        assert!(cache.get("a", "c").is_some());
    }
}
