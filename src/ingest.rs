//! # Ingestion and Merge
//!
//! Reconciles snapshot records into the store. Every snapshot contributes one
//! observation timestamp (taken from the source file, not per record), and
//! reconciliation is a min/max over those timestamps, so merging the same
//! snapshots in any order and any number of times converges to one state.
//!
//! Records are flattened into [`Observation`]s and folded per identifier by a
//! single function; the whole batch is applied in one store transaction.

use std::collections::BTreeMap;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::MergeConfig;
use crate::error::{CatalogError, Result};
use crate::geo_utils::haversine_distance;
use crate::store::{PortalStore, StoreRead};
use crate::types::Portal;
use crate::GeoPoint;

// ============================================================================
// Input records
// ============================================================================

/// One portal as it appears in a snapshot file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalRecord {
    pub id: String,
    pub name: String,
    pub position: GeoPoint,
}

impl PortalRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            position: GeoPoint::new(latitude, longitude),
        }
    }
}

/// A set of records sharing one observation timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Unix timestamp (seconds) of the source file
    pub observed_at: i64,
    pub records: Vec<PortalRecord>,
}

impl Snapshot {
    pub fn new(observed_at: i64, records: Vec<PortalRecord>) -> Self {
        Self {
            observed_at,
            records,
        }
    }
}

/// A single fact about a portal, as consumed by [`reconcile`].
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// The portal existed with these attributes at `observed_at`.
    Seen { record: PortalRecord, observed_at: i64 },
    /// The portal is gone; remove it regardless of timestamps.
    Expunged { portal_id: String },
}

impl Observation {
    pub fn portal_id(&self) -> &str {
        match self {
            Observation::Seen { record, .. } => &record.id,
            Observation::Expunged { portal_id } => portal_id,
        }
    }
}

/// Flatten snapshots into observations, preserving caller order.
pub fn observations_from_snapshots(snapshots: &[Snapshot]) -> Vec<Observation> {
    snapshots
        .iter()
        .flat_map(|s| {
            s.records.iter().map(move |record| Observation::Seen {
                record: record.clone(),
                observed_at: s.observed_at,
            })
        })
        .collect()
}

// ============================================================================
// Reconciliation
// ============================================================================

/// What a merge changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    /// Identifiers seen for the first time
    pub created: Vec<String>,
    /// Existing portals whose first/last seen range grew
    pub widened: Vec<String>,
    /// Existing portals whose name or position was refreshed
    pub corrected: Vec<String>,
    /// Existing portals left untouched
    pub unchanged: usize,
    /// Identifiers removed by expunge observations
    pub expunged: Vec<String>,
}

/// Batch-level view of one identifier after folding all its observations.
#[derive(Debug, Clone)]
struct Folded {
    first_seen: i64,
    last_seen: i64,
    /// Name and position from the latest observation
    latest: PortalRecord,
    /// Every distinct position observed in the batch, for conflict detection
    positions: Vec<GeoPoint>,
}

impl Folded {
    /// Largest distance from `position` to any position already observed.
    fn widest_spread(&self, position: &GeoPoint) -> f64 {
        self.positions
            .iter()
            .map(|p| haversine_distance(p, position))
            .fold(0.0, f64::max)
    }
}

enum Fate {
    Seen(Folded),
    Expunged,
}

/// Fold observations per identifier and apply them in one transaction.
///
/// Fails with [`CatalogError::Conflict`] when two observations of one portal
/// in the batch are further apart than the configured tolerance, and with
/// [`CatalogError::InvalidCoordinates`] for positions off the globe. Either
/// failure leaves the store untouched.
pub fn reconcile(
    store: &mut PortalStore,
    observations: &[Observation],
    config: &MergeConfig,
) -> Result<MergeReport> {
    let folded = fold_observations(observations, config)?;

    let tx = store.transaction()?;
    let mut report = MergeReport::default();

    for (id, fate) in &folded {
        match fate {
            Fate::Expunged => {
                if tx.delete_portal(id)? {
                    report.expunged.push(id.clone());
                }
            }
            Fate::Seen(seen) => match tx.portal(id)? {
                None => {
                    let mut portal = Portal::new(
                        id.clone(),
                        seen.latest.name.clone(),
                        seen.latest.position,
                        seen.last_seen,
                    );
                    portal.first_seen = seen.first_seen;
                    tx.put_portal(&portal)?;
                    report.created.push(id.clone());
                }
                Some(existing) => {
                    let (updated, widened, corrected) = merge_into(existing, seen);
                    if widened || corrected {
                        tx.put_portal(&updated)?;
                    }
                    if widened {
                        report.widened.push(id.clone());
                    }
                    if corrected {
                        report.corrected.push(id.clone());
                    }
                    if !widened && !corrected {
                        report.unchanged += 1;
                    }
                }
            },
        }
    }

    tx.commit()?;

    info!(
        "[Ingest] Merged {} observations: {} created, {} widened, {} corrected, {} expunged",
        observations.len(),
        report.created.len(),
        report.widened.len(),
        report.corrected.len(),
        report.expunged.len()
    );
    Ok(report)
}

/// Merge a batch of snapshots.
pub fn merge_snapshots(
    store: &mut PortalStore,
    snapshots: &[Snapshot],
    config: &MergeConfig,
) -> Result<MergeReport> {
    reconcile(store, &observations_from_snapshots(snapshots), config)
}

/// Remove every portal whose identifier is listed, regardless of timestamps.
pub fn expunge<S: AsRef<str>>(store: &mut PortalStore, portal_ids: &[S]) -> Result<MergeReport> {
    let observations: Vec<Observation> = portal_ids
        .iter()
        .map(|id| Observation::Expunged {
            portal_id: id.as_ref().to_string(),
        })
        .collect();
    reconcile(store, &observations, &MergeConfig::default())
}

fn fold_observations(
    observations: &[Observation],
    config: &MergeConfig,
) -> Result<BTreeMap<String, Fate>> {
    let mut folded: BTreeMap<String, Fate> = BTreeMap::new();

    for observation in observations {
        match observation {
            Observation::Expunged { portal_id } => {
                folded.insert(portal_id.clone(), Fate::Expunged);
            }
            Observation::Seen {
                record,
                observed_at,
            } => {
                if !record.position.is_valid() {
                    return Err(CatalogError::InvalidCoordinates {
                        portal_id: record.id.clone(),
                        latitude: record.position.latitude,
                        longitude: record.position.longitude,
                    });
                }

                match folded.get_mut(&record.id) {
                    Some(Fate::Seen(seen)) => {
                        // Pairwise against every earlier position, so the
                        // outcome does not depend on batch order
                        let distance_m = seen.widest_spread(&record.position);
                        if distance_m > config.position_tolerance_m {
                            return Err(CatalogError::Conflict {
                                portal_id: record.id.clone(),
                                distance_m,
                                tolerance_m: config.position_tolerance_m,
                            });
                        }
                        if !seen.positions.contains(&record.position) {
                            seen.positions.push(record.position);
                        }
                        seen.first_seen = seen.first_seen.min(*observed_at);
                        if is_newer(*observed_at, record, seen.last_seen, &seen.latest) {
                            seen.latest = record.clone();
                        }
                        seen.last_seen = seen.last_seen.max(*observed_at);
                    }
                    // A later sighting in the batch supersedes an earlier expunge
                    Some(Fate::Expunged) | None => {
                        folded.insert(
                            record.id.clone(),
                            Fate::Seen(Folded {
                                first_seen: *observed_at,
                                last_seen: *observed_at,
                                latest: record.clone(),
                                positions: vec![record.position],
                            }),
                        );
                    }
                }
            }
        }
    }

    debug!(
        "[Ingest] Folded {} observations into {} identifiers",
        observations.len(),
        folded.len()
    );
    Ok(folded)
}

/// Whether `candidate` observed at `ts` should replace `current` observed at
/// `current_ts`. Equal timestamps resolve on name, then position, so the
/// result does not depend on batch order.
fn is_newer(ts: i64, candidate: &PortalRecord, current_ts: i64, current: &PortalRecord) -> bool {
    if ts != current_ts {
        return ts > current_ts;
    }
    (
        &candidate.name,
        candidate.position.latitude,
        candidate.position.longitude,
    ) > (
        &current.name,
        current.position.latitude,
        current.position.longitude,
    )
}

/// Widen timestamps and refresh attributes of an existing portal.
///
/// Returns the updated portal and whether it was widened and/or corrected.
fn merge_into(mut existing: Portal, seen: &Folded) -> (Portal, bool, bool) {
    let first_seen = existing.first_seen.min(seen.first_seen);
    let last_seen = existing.last_seen.max(seen.last_seen);
    let widened = first_seen != existing.first_seen || last_seen != existing.last_seen;

    // Only an observation at least as recent as the stored one may correct it
    let stored = PortalRecord {
        id: existing.id.clone(),
        name: existing.name.clone(),
        position: existing.position,
    };
    let corrected = (seen.latest.name != existing.name
        || seen.latest.position != existing.position)
        && is_newer(seen.last_seen, &seen.latest, existing.last_seen, &stored);
    if corrected {
        existing.name = seen.latest.name.clone();
        existing.position = seen.latest.position;
    }
    existing.first_seen = first_seen;
    existing.last_seen = last_seen;

    (existing, widened, corrected)
}
