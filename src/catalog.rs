//! # Catalog
//!
//! One method per logical command over an explicit [`PortalStore`] handle.
//! Every command that mutates the store runs as a single transaction.

use std::path::Path;

use log::info;

use crate::bookmarks::BookmarksFile;
use crate::boundary::BoundaryIndex;
use crate::clustering::{self, EllipseGroup};
use crate::config::CatalogConfig;
use crate::distance::{CachingProvider, DistanceProvider};
use crate::error::{OptionExt, Result};
use crate::export::ExportSink;
use crate::geocode::{self, GeocodeReport, PruneMode, PruneReport};
use crate::drawtools::Drawing;
use crate::ingest::{self, MergeReport, Snapshot};
use crate::query::{self, PortalQuery, ShowReport};
use crate::route::{self, Route};
use crate::store::{PortalStore, StoreRead};
use crate::types::{Classification, Cluster, Portal, Region, RegionFilter};
use crate::GeoPoint;

pub struct Catalog {
    store: PortalStore,
    config: CatalogConfig,
}

impl Catalog {
    pub fn new(store: PortalStore, config: CatalogConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    /// Open (creating if needed) the catalog database at `path`.
    pub fn open(path: &str, config: CatalogConfig) -> Result<Self> {
        Self::new(PortalStore::open(path)?, config)
    }

    pub fn in_memory(config: CatalogConfig) -> Result<Self> {
        Self::new(PortalStore::in_memory()?, config)
    }

    pub fn store(&self) -> &PortalStore {
        &self.store
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------------

    pub fn ingest(&mut self, snapshots: &[Snapshot]) -> Result<MergeReport> {
        ingest::merge_snapshots(&mut self.store, snapshots, &self.config.merge)
    }

    /// Ingest IITC bookmarks files as one batch, each stamped with its mtime.
    pub fn ingest_files<P: AsRef<Path>>(&mut self, paths: &[P]) -> Result<MergeReport> {
        let snapshots = paths
            .iter()
            .map(Snapshot::from_bookmarks_file)
            .collect::<Result<Vec<_>>>()?;
        self.ingest(&snapshots)
    }

    pub fn expunge<S: AsRef<str>>(&mut self, portal_ids: &[S]) -> Result<MergeReport> {
        ingest::expunge(&mut self.store, portal_ids)
    }

    // ------------------------------------------------------------------------
    // Regions
    // ------------------------------------------------------------------------

    pub fn geocode(&mut self, index: &BoundaryIndex) -> Result<GeocodeReport> {
        geocode::geocode(&mut self.store, index)
    }

    pub fn prune(&mut self, mode: PruneMode) -> Result<PruneReport> {
        geocode::prune(&mut self.store, mode)
    }

    pub fn set_region(
        &mut self,
        code: &str,
        classification: Option<Classification>,
        label: Option<String>,
    ) -> Result<Region> {
        geocode::set_region(&mut self.store, code, classification, label)
    }

    pub fn regions(&self, filter: &RegionFilter) -> Result<Vec<Region>> {
        geocode::list_regions(&self.store, filter)
    }

    pub fn delete_region(&mut self, code: &str) -> Result<Region> {
        geocode::delete_region(&mut self.store, code)
    }

    /// Trim a bookmarks file in place to the polygons and circles of a
    /// drawtools file. The file is only rewritten when something was removed.
    pub fn trim_bookmarks_file(
        &self,
        bookmarks: impl AsRef<Path>,
        drawing: impl AsRef<Path>,
    ) -> Result<Vec<String>> {
        let area = Drawing::from_file(drawing)?.area()?;
        let mut file = BookmarksFile::from_json_str(&std::fs::read_to_string(bookmarks.as_ref())?)?;
        let removed = geocode::trim_bookmarks(&mut file, &area)?;
        if !removed.is_empty() {
            std::fs::write(bookmarks.as_ref(), file.to_json_string()?)?;
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------------
    // Listings
    // ------------------------------------------------------------------------

    pub fn show(&self, query: &PortalQuery) -> Result<ShowReport> {
        query::show(&self.store, query)
    }

    // ------------------------------------------------------------------------
    // Clusters and routes
    // ------------------------------------------------------------------------

    /// Cluster `subset` (or every portal) and persist the result.
    pub fn donuts(&mut self, subset: Option<&[String]>) -> Result<Vec<Cluster>> {
        clustering::donuts(&mut self.store, subset, &self.config.clustering)
    }

    /// Band every catalog portal by summed distance to `foci`.
    pub fn ellipse(
        &self,
        foci: &[GeoPoint],
        count: usize,
        max_groups: Option<usize>,
    ) -> Result<Vec<EllipseGroup>> {
        clustering::ellipse_groups(&self.store.portals()?, foci, count, max_groups)
    }

    /// Order the given portals into a route.
    ///
    /// Distances come from `upstream` through the persisted distance cache;
    /// anything newly learned is saved back. `now` stamps new cache entries.
    pub fn route<P: DistanceProvider>(
        &mut self,
        portal_ids: &[String],
        upstream: P,
        now: i64,
    ) -> Result<Route> {
        let portals = self.portals_in_order(portal_ids)?;
        let cache = self.store.load_distance_cache()?;

        let mut provider = CachingProvider::new(upstream, cache, &self.config.distance_cache, now);
        let route = route::optimize_route(&portals, &mut provider, &self.config.route);

        let cache = provider.into_cache();
        if cache.is_dirty() {
            let tx = self.store.transaction()?;
            let written = tx.save_distance_cache(&cache)?;
            tx.commit()?;
            info!("[Route] Saved {} cached distances", written);
        }
        Ok(route)
    }

    /// Drop cached distances older than the configured maximum age.
    pub fn purge_stale_distances(&mut self, now: i64) -> Result<usize> {
        let tx = self.store.transaction()?;
        let purged = tx.purge_stale_distances(now, self.config.distance_cache.max_age_secs)?;
        tx.commit()?;
        Ok(purged)
    }

    // ------------------------------------------------------------------------
    // Export
    // ------------------------------------------------------------------------

    /// Write every stored cluster, named by its id, members in absorption order.
    pub fn export_clusters<S: ExportSink>(&self, sink: &mut S) -> Result<usize> {
        let clusters = self.store.clusters()?;
        for cluster in &clusters {
            let members = self.store.portals_by_ids(&cluster.member_ids)?;
            sink.write_portals(&cluster.id, &members)?;
        }
        sink.finish()?;
        Ok(clusters.len())
    }

    /// Write ellipse bands named `ellipse-{count}-{number}`.
    pub fn export_ellipses<S: ExportSink>(&self, sink: &mut S, groups: &[EllipseGroup]) -> Result<()> {
        let count = groups.first().map_or(0, |g| g.portal_ids.len());
        let width = groups.len().to_string().len();
        for group in groups {
            let portals = self.store.portals_by_ids(&group.portal_ids)?;
            let name = format!("ellipse-{count}-{:0width$}", group.number);
            sink.write_portals(&name, &portals)?;
        }
        sink.finish()
    }

    /// Write each listing group as one sequence, named by its group key or
    /// `show` when ungrouped.
    pub fn export_show<S: ExportSink>(&self, sink: &mut S, report: &ShowReport) -> Result<()> {
        for group in &report.groups {
            let name = if group.key.is_empty() { "show" } else { group.key.as_str() };
            sink.write_portals(name, &group.portals)?;
        }
        sink.finish()
    }

    pub fn export_route<S: ExportSink>(&self, sink: &mut S, name: &str, route: &Route) -> Result<()> {
        let portals = self.portals_in_order(&route.portal_ids)?;
        sink.write_portals(name, &portals)?;
        sink.finish()
    }

    fn portals_in_order(&self, portal_ids: &[String]) -> Result<Vec<Portal>> {
        portal_ids
            .iter()
            .map(|id| self.store.portal(id)?.ok_or_unknown_portal(id))
            .collect()
    }
}
