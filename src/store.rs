//! # Portal Store
//!
//! SQLite-backed persistence for portals, region classifications, clusters
//! and the pairwise distance cache.
//!
//! The store is an explicit handle passed to every engine. Reads are available
//! on the handle itself; every mutation goes through a [`StoreTransaction`]
//! obtained from [`PortalStore::transaction`]. A transaction that is dropped
//! without [`StoreTransaction::commit`] rolls back, so a command that fails
//! part way leaves the store exactly as it found it.

use std::collections::HashSet;

use log::{debug, info, warn};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};

use crate::distance::{Confidence, DistanceCache, DistanceEntry, PortalPair};
use crate::error::{CatalogError, Result};
use crate::query::PortalQuery;
use crate::types::{Classification, Cluster, Portal, Region, RegionFilter};
use crate::GeoPoint;

const PORTAL_COLUMNS: &str =
    "id, name, lat, lng, first_seen, last_seen, region_code, inclusion, cluster_id";

// ============================================================================
// Read access shared by the store handle and its transactions
// ============================================================================

/// Queries available on both [`PortalStore`] and [`StoreTransaction`].
pub trait StoreRead {
    fn conn(&self) -> &Connection;

    fn portal(&self, id: &str) -> Result<Option<Portal>> {
        let mut stmt = self
            .conn()
            .prepare_cached(&format!("SELECT {PORTAL_COLUMNS} FROM portals WHERE id = ?"))?;
        Ok(stmt.query_row(params![id], row_to_portal).optional()?)
    }

    /// All portals ordered by identifier.
    fn portals(&self) -> Result<Vec<Portal>> {
        let mut stmt = self
            .conn()
            .prepare(&format!("SELECT {PORTAL_COLUMNS} FROM portals ORDER BY id"))?;
        let portals = stmt
            .query_map([], row_to_portal)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(portals)
    }

    /// Portals for the given ids, in the order given. Unknown ids are skipped.
    fn portals_by_ids(&self, ids: &[String]) -> Result<Vec<Portal>> {
        let mut portals = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(portal) = self.portal(id)? {
                portals.push(portal);
            }
        }
        Ok(portals)
    }

    /// Portals that have not been assigned a region yet, ordered by identifier.
    fn portals_missing_region(&self) -> Result<Vec<Portal>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {PORTAL_COLUMNS} FROM portals WHERE region_code IS NULL ORDER BY id"
        ))?;
        let portals = stmt
            .query_map([], row_to_portal)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(portals)
    }

    /// Portals selected, ordered and limited by a listing query.
    fn query_portals(&self, query: &PortalQuery) -> Result<Vec<Portal>> {
        let (clause, values) = query.to_sql();
        let mut stmt = self
            .conn()
            .prepare(&format!("SELECT {PORTAL_COLUMNS} FROM portals{clause}"))?;
        let portals = stmt
            .query_map(params_from_iter(values), row_to_portal)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(portals)
    }

    fn portal_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM portals", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn region(&self, code: &str) -> Result<Option<Region>> {
        let mut stmt = self
            .conn()
            .prepare_cached("SELECT code, classification, label FROM regions WHERE code = ?")?;
        Ok(stmt.query_row(params![code], row_to_region).optional()?)
    }

    /// Region codes matching the filter, ordered by code.
    fn regions(&self, filter: &RegionFilter) -> Result<Vec<Region>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT code, classification, label FROM regions ORDER BY code")?;
        let regions = stmt
            .query_map([], row_to_region)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(regions.into_iter().filter(|r| filter.matches(r)).collect())
    }

    fn cluster(&self, id: &str) -> Result<Option<Cluster>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT id, tier, residual, centroid_lat, centroid_lng, bounding_size_m,
                    leader_id, member_ids
             FROM clusters WHERE id = ?",
        )?;
        let raw = stmt.query_row(params![id], row_to_raw_cluster).optional()?;
        raw.map(RawCluster::into_cluster).transpose()
    }

    /// All clusters ordered by identifier.
    fn clusters(&self) -> Result<Vec<Cluster>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, tier, residual, centroid_lat, centroid_lng, bounding_size_m,
                    leader_id, member_ids
             FROM clusters ORDER BY id",
        )?;
        let raw = stmt
            .query_map([], row_to_raw_cluster)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(RawCluster::into_cluster).collect()
    }

    /// Load every cached pairwise distance.
    fn load_distance_cache(&self) -> Result<DistanceCache> {
        let mut stmt = self.conn().prepare(
            "SELECT portal_a, portal_b, distance, confidence, recorded_at FROM distance_cache",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    DistanceEntry {
                        distance: row.get(2)?,
                        confidence: Confidence::from_rank(row.get(3)?),
                        recorded_at: row.get(4)?,
                    },
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut cache = DistanceCache::new();
        for (a, b, entry) in rows {
            cache.insert(PortalPair::new(&a, &b), entry);
        }
        cache.mark_clean();
        Ok(cache)
    }
}

// ============================================================================
// Store handle
// ============================================================================

/// Explicit handle on the persistent catalog.
pub struct PortalStore {
    db: Connection,
    db_path: String,
}

impl StoreRead for PortalStore {
    fn conn(&self) -> &Connection {
        &self.db
    }
}

impl PortalStore {
    /// Open (creating if needed) the catalog at `db_path`.
    pub fn open(db_path: &str) -> Result<Self> {
        let db = Connection::open(db_path)?;
        Self::init_schema(&db)?;
        info!("[PortalStore] Opened {}", db_path);
        Ok(Self {
            db,
            db_path: db_path.to_string(),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    pub fn path(&self) -> &str {
        &self.db_path
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS portals (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                lat REAL NOT NULL,
                lng REAL NOT NULL,
                first_seen INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                region_code TEXT,
                inclusion TEXT,
                cluster_id TEXT,
                CHECK (first_seen <= last_seen)
            );

            -- Operator maintained classification of region codes
            CREATE TABLE IF NOT EXISTS regions (
                code TEXT PRIMARY KEY,
                classification TEXT NOT NULL,
                label TEXT
            );

            -- Donuts; member order kept as a JSON list
            CREATE TABLE IF NOT EXISTS clusters (
                id TEXT PRIMARY KEY,
                tier TEXT NOT NULL,
                residual INTEGER NOT NULL,
                centroid_lat REAL NOT NULL,
                centroid_lng REAL NOT NULL,
                bounding_size_m REAL NOT NULL,
                leader_id TEXT NOT NULL,
                member_ids TEXT NOT NULL
            );

            -- Unordered portal pairs, portal_a < portal_b
            CREATE TABLE IF NOT EXISTS distance_cache (
                portal_a TEXT NOT NULL,
                portal_b TEXT NOT NULL,
                distance REAL NOT NULL,
                confidence INTEGER NOT NULL,
                recorded_at INTEGER NOT NULL,
                PRIMARY KEY (portal_a, portal_b)
            );

            CREATE INDEX IF NOT EXISTS idx_portals_region ON portals(region_code);
            CREATE INDEX IF NOT EXISTS idx_portals_cluster ON portals(cluster_id);
        "#,
        )
    }

    /// Begin an atomic unit of work.
    pub fn transaction(&mut self) -> Result<StoreTransaction<'_>> {
        Ok(StoreTransaction {
            tx: self.db.transaction()?,
        })
    }
}

// ============================================================================
// Transactions
// ============================================================================

/// Scoped atomic unit of work. Rolls back on drop unless committed.
pub struct StoreTransaction<'a> {
    tx: Transaction<'a>,
}

impl StoreRead for StoreTransaction<'_> {
    fn conn(&self) -> &Connection {
        &self.tx
    }
}

impl StoreTransaction<'_> {
    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }

    /// Discard every change made in this transaction.
    pub fn rollback(self) -> Result<()> {
        self.tx.rollback()?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Portals
    // ------------------------------------------------------------------------

    /// Insert or fully overwrite a portal record.
    pub fn put_portal(&self, portal: &Portal) -> Result<()> {
        self.tx
            .prepare_cached(&format!(
                "INSERT OR REPLACE INTO portals ({PORTAL_COLUMNS})
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))?
            .execute(params![
                portal.id,
                portal.name,
                portal.position.latitude,
                portal.position.longitude,
                portal.first_seen,
                portal.last_seen,
                portal.region_code,
                portal.inclusion.map(|c| c.as_str()),
                portal.cluster_id,
            ])?;
        Ok(())
    }

    /// Record the geocoding result for a portal.
    pub fn set_portal_region(
        &self,
        portal_id: &str,
        region_code: Option<&str>,
        inclusion: Option<Classification>,
    ) -> Result<()> {
        self.tx
            .prepare_cached("UPDATE portals SET region_code = ?, inclusion = ? WHERE id = ?")?
            .execute(params![region_code, inclusion.map(|c| c.as_str()), portal_id])?;
        Ok(())
    }

    /// Delete a portal, detaching it from its cluster. Returns false if absent.
    pub fn delete_portal(&self, portal_id: &str) -> Result<bool> {
        let cluster_id: Option<Option<String>> = self
            .tx
            .query_row(
                "SELECT cluster_id FROM portals WHERE id = ?",
                params![portal_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(cluster_id) = cluster_id else {
            return Ok(false);
        };

        self.tx
            .execute("DELETE FROM portals WHERE id = ?", params![portal_id])?;
        if let Some(cluster_id) = cluster_id {
            self.refresh_cluster_members(&cluster_id)?;
        }
        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Regions
    // ------------------------------------------------------------------------

    /// Insert or overwrite a region classification.
    pub fn put_region(&self, region: &Region) -> Result<()> {
        self.tx
            .prepare_cached(
                "INSERT OR REPLACE INTO regions (code, classification, label) VALUES (?, ?, ?)",
            )?
            .execute(params![
                region.code,
                region.classification.as_str(),
                region.label
            ])?;
        Ok(())
    }

    /// Register a region code as unclassified if unseen. Returns true if new.
    pub fn ensure_region(&self, code: &str) -> Result<bool> {
        let inserted = self
            .tx
            .prepare_cached(
                "INSERT OR IGNORE INTO regions (code, classification, label) VALUES (?, ?, NULL)",
            )?
            .execute(params![code, Classification::Unclassified.as_str()])?;
        Ok(inserted > 0)
    }

    pub fn delete_region(&self, code: &str) -> Result<bool> {
        let deleted = self
            .tx
            .execute("DELETE FROM regions WHERE code = ?", params![code])?;
        Ok(deleted > 0)
    }

    // ------------------------------------------------------------------------
    // Clusters
    // ------------------------------------------------------------------------

    /// Replace every cluster assignment of `subset` with `clusters`.
    ///
    /// Portals in the subset lose their previous cluster. Previous clusters
    /// that still hold portals outside the subset keep only those members;
    /// ones left empty are deleted. A surviving cluster whose id is reused by
    /// one of the new clusters is dissolved and its remaining members detached.
    ///
    /// Fails with [`CatalogError::InvariantViolation`] if two new clusters
    /// share an id.
    pub fn replace_clusters(&self, subset: &[String], clusters: &[Cluster]) -> Result<()> {
        let mut new_ids: HashSet<&str> = HashSet::with_capacity(clusters.len());
        for cluster in clusters {
            if !new_ids.insert(cluster.id.as_str()) {
                return Err(CatalogError::InvariantViolation {
                    cluster_id: cluster.id.clone(),
                    rule: "cluster id produced twice in one replacement".to_string(),
                });
            }
        }

        let mut touched: HashSet<String> = HashSet::new();
        for portal_id in subset {
            let previous: Option<Option<String>> = self
                .tx
                .query_row(
                    "SELECT cluster_id FROM portals WHERE id = ?",
                    params![portal_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(Some(cluster_id)) = previous {
                touched.insert(cluster_id);
            }
            self.tx.execute(
                "UPDATE portals SET cluster_id = NULL WHERE id = ?",
                params![portal_id],
            )?;
        }

        let mut touched: Vec<String> = touched.into_iter().collect();
        touched.sort();
        for cluster_id in &touched {
            self.refresh_cluster_members(cluster_id)?;
        }

        let mut detached = 0;
        for cluster in clusters {
            detached += self.dissolve_cluster(&cluster.id)?;
        }

        for cluster in clusters {
            let member_ids = serde_json::to_string(&cluster.member_ids)?;
            self.tx
                .prepare_cached(
                    "INSERT INTO clusters
                        (id, tier, residual, centroid_lat, centroid_lng, bounding_size_m,
                         leader_id, member_ids)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )?
                .execute(params![
                    cluster.id,
                    cluster.tier,
                    cluster.residual,
                    cluster.centroid.latitude,
                    cluster.centroid.longitude,
                    cluster.bounding_size_m,
                    cluster.leader_id,
                    member_ids,
                ])?;
            for member in &cluster.member_ids {
                self.tx
                    .prepare_cached("UPDATE portals SET cluster_id = ? WHERE id = ?")?
                    .execute(params![cluster.id, member])?;
            }
        }

        if detached > 0 {
            warn!(
                "[PortalStore] Detached {} portals from clusters whose ids were reused",
                detached
            );
        }
        debug!(
            "[PortalStore] Replaced clusters for {} portals: {} previous touched, {} new",
            subset.len(),
            touched.len(),
            clusters.len()
        );
        Ok(())
    }

    /// Delete a cluster row and detach any portal still pointing at it.
    /// Returns the number of portals detached.
    fn dissolve_cluster(&self, cluster_id: &str) -> Result<usize> {
        let detached = self.tx.execute(
            "UPDATE portals SET cluster_id = NULL WHERE cluster_id = ?",
            params![cluster_id],
        )?;
        self.tx
            .execute("DELETE FROM clusters WHERE id = ?", params![cluster_id])?;
        Ok(detached)
    }

    /// Rewrite a cluster's member list from the portals still pointing at it.
    fn refresh_cluster_members(&self, cluster_id: &str) -> Result<()> {
        let Some(mut cluster) = self.cluster(cluster_id)? else {
            return Ok(());
        };

        let remaining: HashSet<String> = {
            let mut stmt = self
                .tx
                .prepare_cached("SELECT id FROM portals WHERE cluster_id = ?")?;
            let ids = stmt
                .query_map(params![cluster_id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<HashSet<_>>>()?;
            ids
        };

        if remaining.is_empty() {
            self.tx
                .execute("DELETE FROM clusters WHERE id = ?", params![cluster_id])?;
            return Ok(());
        }

        cluster.member_ids.retain(|id| remaining.contains(id));
        self.tx.execute(
            "UPDATE clusters SET member_ids = ? WHERE id = ?",
            params![serde_json::to_string(&cluster.member_ids)?, cluster_id],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Distance cache
    // ------------------------------------------------------------------------

    /// Persist cache entries. Existing rows are only replaced by strictly
    /// higher confidence measurements.
    pub fn save_distance_cache(&self, cache: &DistanceCache) -> Result<usize> {
        let mut written = 0;
        for (pair, entry) in cache.iter() {
            written += self
                .tx
                .prepare_cached(
                    "INSERT INTO distance_cache (portal_a, portal_b, distance, confidence, recorded_at)
                     VALUES (?, ?, ?, ?, ?)
                     ON CONFLICT (portal_a, portal_b) DO UPDATE SET
                        distance = excluded.distance,
                        confidence = excluded.confidence,
                        recorded_at = excluded.recorded_at
                     WHERE excluded.confidence > distance_cache.confidence",
                )?
                .execute(params![
                    pair.first(),
                    pair.second(),
                    entry.distance,
                    entry.confidence.rank(),
                    entry.recorded_at,
                ])?;
        }
        Ok(written)
    }

    /// Remove cached distances recorded before `now - max_age_secs`.
    pub fn purge_stale_distances(&self, now: i64, max_age_secs: i64) -> Result<usize> {
        let cutoff = now - max_age_secs;
        let deleted = self.tx.execute(
            "DELETE FROM distance_cache WHERE recorded_at < ?",
            params![cutoff],
        )?;
        if deleted > 0 {
            info!(
                "[PortalStore] Purged {} cached distances older than {}s",
                deleted, max_age_secs
            );
        }
        Ok(deleted)
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn row_to_portal(row: &Row<'_>) -> rusqlite::Result<Portal> {
    let inclusion: Option<String> = row.get(7)?;
    Ok(Portal {
        id: row.get(0)?,
        name: row.get(1)?,
        position: GeoPoint::new(row.get(2)?, row.get(3)?),
        first_seen: row.get(4)?,
        last_seen: row.get(5)?,
        region_code: row.get(6)?,
        inclusion: inclusion.as_deref().and_then(Classification::from_str),
        cluster_id: row.get(8)?,
    })
}

fn row_to_region(row: &Row<'_>) -> rusqlite::Result<Region> {
    let classification: String = row.get(1)?;
    Ok(Region {
        code: row.get(0)?,
        classification: Classification::from_str(&classification)
            .unwrap_or(Classification::Unclassified),
        label: row.get(2)?,
    })
}

/// Cluster row before the JSON member list is decoded.
struct RawCluster {
    id: String,
    tier: String,
    residual: bool,
    centroid: GeoPoint,
    bounding_size_m: f64,
    leader_id: String,
    member_ids_json: String,
}

impl RawCluster {
    fn into_cluster(self) -> Result<Cluster> {
        Ok(Cluster {
            member_ids: serde_json::from_str(&self.member_ids_json)?,
            id: self.id,
            tier: self.tier,
            residual: self.residual,
            centroid: self.centroid,
            bounding_size_m: self.bounding_size_m,
            leader_id: self.leader_id,
        })
    }
}

fn row_to_raw_cluster(row: &Row<'_>) -> rusqlite::Result<RawCluster> {
    Ok(RawCluster {
        id: row.get(0)?,
        tier: row.get(1)?,
        residual: row.get(2)?,
        centroid: GeoPoint::new(row.get(3)?, row.get(4)?),
        bounding_size_m: row.get(5)?,
        leader_id: row.get(6)?,
        member_ids_json: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn portal(id: &str, ts: i64) -> Portal {
        Portal::new(id, format!("Portal {id}"), GeoPoint::new(40.0, -75.0), ts)
    }

    fn cluster(id: &str, members: &[&str]) -> Cluster {
        Cluster {
            id: id.to_string(),
            tier: "walking".to_string(),
            residual: false,
            member_ids: members.iter().map(|m| m.to_string()).collect(),
            centroid: GeoPoint::new(40.0, -75.0),
            bounding_size_m: 0.0,
            leader_id: members[0].to_string(),
        }
    }

    #[test]
    fn test_portal_round_trip() {
        let mut store = PortalStore::in_memory().unwrap();
        let mut p = portal("a", 10);
        p.region_code = Some("19104".to_string());
        p.inclusion = Some(Classification::Keep);

        let tx = store.transaction().unwrap();
        tx.put_portal(&p).unwrap();
        tx.commit().unwrap();

        assert_eq!(store.portal("a").unwrap(), Some(p));
        assert_eq!(store.portal_count().unwrap(), 1);
    }

    #[test]
    fn test_dropped_transaction_rolls_back() {
        let mut store = PortalStore::in_memory().unwrap();
        {
            let tx = store.transaction().unwrap();
            tx.put_portal(&portal("a", 10)).unwrap();
            // dropped without commit
        }
        assert_eq!(store.portal_count().unwrap(), 0);
    }

    #[test]
    fn test_timestamp_check_constraint() {
        let mut store = PortalStore::in_memory().unwrap();
        let mut p = portal("a", 10);
        p.first_seen = 20;
        let tx = store.transaction().unwrap();
        assert!(tx.put_portal(&p).is_err());
    }

    #[test]
    fn test_ensure_region_only_once() {
        let mut store = PortalStore::in_memory().unwrap();
        let tx = store.transaction().unwrap();
        assert!(tx.ensure_region("62701").unwrap());
        assert!(!tx.ensure_region("62701").unwrap());
        tx.commit().unwrap();

        let region = store.region("62701").unwrap().unwrap();
        assert_eq!(region.classification, Classification::Unclassified);
    }

    #[test]
    fn test_replace_clusters_prunes_previous() {
        let mut store = PortalStore::in_memory().unwrap();
        let tx = store.transaction().unwrap();
        for id in ["a", "b", "c"] {
            tx.put_portal(&portal(id, 1)).unwrap();
        }
        tx.replace_clusters(
            &["a".to_string(), "b".to_string(), "c".to_string()],
            &[cluster("walking:a", &["a", "b", "c"])],
        )
        .unwrap();
        // Re-cluster only a and b
        tx.replace_clusters(
            &["a".to_string(), "b".to_string()],
            &[cluster("walking:b", &["b", "a"])],
        )
        .unwrap();
        tx.commit().unwrap();

        let old = store.cluster("walking:a").unwrap().unwrap();
        assert_eq!(old.member_ids, vec!["c".to_string()]);
        let new = store.cluster("walking:b").unwrap().unwrap();
        assert_eq!(new.member_ids, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(
            store.portal("a").unwrap().unwrap().cluster_id.as_deref(),
            Some("walking:b")
        );
    }

    #[test]
    fn test_reused_cluster_id_detaches_outside_members() {
        let mut store = PortalStore::in_memory().unwrap();
        let ids: Vec<String> = ["a", "b", "c", "d", "e"].iter().map(|s| s.to_string()).collect();
        let tx = store.transaction().unwrap();
        for id in &ids {
            tx.put_portal(&portal(id, 1)).unwrap();
        }
        tx.replace_clusters(&ids, &[cluster("walking:c", &["c", "b", "d", "a", "e"])])
            .unwrap();
        // Re-cluster the middle three; the leader and therefore the id repeat
        let middle = ids[1..4].to_vec();
        tx.replace_clusters(&middle, &[cluster("walking:c", &["c", "b", "d"])])
            .unwrap();
        tx.commit().unwrap();

        let clusters = store.clusters().unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(
            clusters[0].member_ids,
            vec!["c".to_string(), "b".to_string(), "d".to_string()]
        );
        // Every portal's cluster lists it as a member
        for p in store.portals().unwrap() {
            match p.cluster_id {
                Some(cid) => {
                    let c = store.cluster(&cid).unwrap().unwrap();
                    assert!(c.member_ids.contains(&p.id), "{} not in {}", p.id, cid);
                }
                None => assert!(p.id == "a" || p.id == "e"),
            }
        }
    }

    #[test]
    fn test_duplicate_new_cluster_ids_rejected() {
        let mut store = PortalStore::in_memory().unwrap();
        let tx = store.transaction().unwrap();
        for id in ["a", "b"] {
            tx.put_portal(&portal(id, 1)).unwrap();
        }
        let err = tx
            .replace_clusters(
                &["a".to_string(), "b".to_string()],
                &[cluster("walking:a", &["a"]), cluster("walking:a", &["b"])],
            )
            .unwrap_err();
        assert!(matches!(err, CatalogError::InvariantViolation { .. }));
    }

    #[test]
    fn test_delete_portal_detaches_cluster() {
        let mut store = PortalStore::in_memory().unwrap();
        let tx = store.transaction().unwrap();
        tx.put_portal(&portal("a", 1)).unwrap();
        tx.replace_clusters(&["a".to_string()], &[cluster("walking:a", &["a"])])
            .unwrap();
        assert!(tx.delete_portal("a").unwrap());
        assert!(!tx.delete_portal("a").unwrap());
        tx.commit().unwrap();

        assert!(store.clusters().unwrap().is_empty());
    }
}
