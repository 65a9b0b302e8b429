//! # Geocode and Prune
//!
//! Assigns each portal its containing region through the [`BoundaryIndex`],
//! keeps the operator-maintained region classification table, and deletes
//! portals in regions classified as discard.
//!
//! Lookups are independent per portal and run on rayon when the `parallel`
//! feature is enabled; results are applied to the store in one transaction.
//!
//! Bookmarks files can also be trimmed to a hand-drawn area, independent of
//! the region table.

use geo::{Intersects, MultiPolygon};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::bookmarks::BookmarksFile;
use crate::boundary::BoundaryIndex;
use crate::error::{OptionExt, Result, UnclassifiedRegionWarning};
use crate::geo_utils::to_point;
use crate::store::{PortalStore, StoreRead, StoreTransaction};
use crate::types::{Classification, Region, RegionFilter};

// ============================================================================
// Geocoding
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeocodeReport {
    /// `(portal id, region code)` for every portal that was resolved
    pub assigned: Vec<(String, String)>,
    /// Portals no region contains
    pub unresolved: Vec<String>,
    /// Region codes seen for the first time, registered as unclassified
    pub new_codes: Vec<String>,
    pub warnings: Vec<UnclassifiedRegionWarning>,
}

/// Resolve the region of every portal that has none yet.
pub fn geocode(store: &mut PortalStore, index: &BoundaryIndex) -> Result<GeocodeReport> {
    let pending = store.portals_missing_region()?;

    #[cfg(feature = "parallel")]
    let lookups: Vec<(String, Option<String>)> = {
        use rayon::prelude::*;
        pending
            .par_iter()
            .map(|p| (p.id.clone(), index.lookup(&p.position).map(str::to_string)))
            .collect()
    };
    #[cfg(not(feature = "parallel"))]
    let lookups: Vec<(String, Option<String>)> = pending
        .iter()
        .map(|p| (p.id.clone(), index.lookup(&p.position).map(str::to_string)))
        .collect();

    let tx = store.transaction()?;
    let mut report = GeocodeReport::default();

    for (portal_id, code) in lookups {
        let Some(code) = code else {
            report.warnings.push(UnclassifiedRegionWarning {
                portal_id: portal_id.clone(),
                region_code: None,
            });
            report.unresolved.push(portal_id);
            continue;
        };

        let classification = register_code(&tx, &code, &mut report.new_codes)?;
        tx.set_portal_region(&portal_id, Some(&code), Some(classification))?;
        if classification == Classification::Unclassified {
            report.warnings.push(UnclassifiedRegionWarning {
                portal_id: portal_id.clone(),
                region_code: Some(code.clone()),
            });
        }
        report.assigned.push((portal_id, code));
    }

    tx.commit()?;
    report.new_codes.sort();

    info!(
        "[Geocode] Resolved {} of {} portals, {} new region codes, {} unresolved",
        report.assigned.len(),
        pending.len(),
        report.new_codes.len(),
        report.unresolved.len()
    );
    if !report.new_codes.is_empty() {
        warn!(
            "[Geocode] New region codes need classification: {}",
            report.new_codes.join(", ")
        );
    }
    Ok(report)
}

/// Classification for a code, registering it as unclassified if unseen.
fn register_code(
    tx: &StoreTransaction<'_>,
    code: &str,
    new_codes: &mut Vec<String>,
) -> Result<Classification> {
    if tx.ensure_region(code)? {
        new_codes.push(code.to_string());
        return Ok(Classification::Unclassified);
    }
    Ok(tx
        .region(code)?
        .map_or(Classification::Unclassified, |r| r.classification))
}

// ============================================================================
// Pruning
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PruneMode {
    /// Only register region codes not seen before
    NewCodesOnly,
    /// Work out what would be pruned, then roll everything back
    DryRun,
    /// Delete portals in discarded regions and commit
    Full,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    /// Portals deleted (or that would be, for a dry run)
    pub pruned: Vec<String>,
    pub new_codes: Vec<String>,
    pub warnings: Vec<UnclassifiedRegionWarning>,
}

/// Delete every portal whose region is classified discard.
///
/// Portals with no region or an unclassified region are never pruned; each
/// yields a warning instead. Surviving portals get their inclusion flag
/// refreshed from the current classification.
pub fn prune(store: &mut PortalStore, mode: PruneMode) -> Result<PruneReport> {
    let tx = store.transaction()?;
    let mut report = PruneReport::default();

    for portal in tx.portals()? {
        let Some(code) = portal.region_code.as_deref() else {
            report.warnings.push(UnclassifiedRegionWarning {
                portal_id: portal.id.clone(),
                region_code: None,
            });
            continue;
        };

        let classification = register_code(&tx, code, &mut report.new_codes)?;
        if mode == PruneMode::NewCodesOnly {
            continue;
        }

        match classification {
            Classification::Discard => {
                tx.delete_portal(&portal.id)?;
                report.pruned.push(portal.id);
            }
            Classification::Unclassified => {
                tx.set_portal_region(&portal.id, Some(code), Some(classification))?;
                report.warnings.push(UnclassifiedRegionWarning {
                    portal_id: portal.id.clone(),
                    region_code: Some(code.to_string()),
                });
            }
            Classification::Keep => {
                if portal.inclusion != Some(Classification::Keep) {
                    tx.set_portal_region(&portal.id, Some(code), Some(classification))?;
                }
            }
        }
    }

    report.new_codes.sort();
    match mode {
        PruneMode::DryRun => tx.rollback()?,
        PruneMode::NewCodesOnly | PruneMode::Full => tx.commit()?,
    }

    info!(
        "[Geocode] Prune ({:?}): {} pruned, {} new region codes, {} warnings",
        mode,
        report.pruned.len(),
        report.new_codes.len(),
        report.warnings.len()
    );
    Ok(report)
}

// ============================================================================
// Region classification administration
// ============================================================================

/// Create or edit a region code. Unset fields keep their current value.
pub fn set_region(
    store: &mut PortalStore,
    code: &str,
    classification: Option<Classification>,
    label: Option<String>,
) -> Result<Region> {
    let tx = store.transaction()?;
    let mut region = tx.region(code)?.unwrap_or_else(|| Region::unclassified(code));
    if let Some(classification) = classification {
        region.classification = classification;
    }
    if label.is_some() {
        region.label = label;
    }
    tx.put_region(&region)?;
    tx.commit()?;

    info!(
        "[Geocode] Region '{}' set to {}",
        region.code,
        region.classification.as_str()
    );
    Ok(region)
}

/// Region codes matching the filter, ordered by code.
pub fn list_regions(store: &PortalStore, filter: &RegionFilter) -> Result<Vec<Region>> {
    store.regions(filter)
}

/// Remove a region code. Portals keep their region code and will re-register
/// it as unclassified on the next geocode or prune.
pub fn delete_region(store: &mut PortalStore, code: &str) -> Result<Region> {
    let tx = store.transaction()?;
    let region = tx.region(code)?.ok_or_unknown_region(code)?;
    tx.delete_region(code)?;
    tx.commit()?;
    Ok(region)
}

// ============================================================================
// Area trimming
// ============================================================================

/// Drop every bookmark whose portal lies outside `area`, in every folder.
///
/// Points on the area's edge are kept. Returns the removed portal ids,
/// sorted and without duplicates.
pub fn trim_bookmarks(file: &mut BookmarksFile, area: &MultiPolygon<f64>) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    for folder in file.portals.values_mut() {
        let mut outside = Vec::new();
        for (key, bookmark) in &folder.bkmrk {
            if !area.intersects(&to_point(&bookmark.position()?)) {
                outside.push(key.clone());
            }
        }
        for key in outside {
            if let Some(bookmark) = folder.bkmrk.remove(&key) {
                removed.push(bookmark.guid);
            }
        }
    }
    removed.sort();
    removed.dedup();

    if !removed.is_empty() {
        info!("[Geocode] Trimmed {} portals outside the drawn area", removed.len());
    }
    Ok(removed)
}
