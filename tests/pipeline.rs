//! Catalog pipeline integration tests.
//!
//! Exercises the full flow on an on-disk SQLite database:
//! ingest -> geocode -> prune -> donuts -> route -> export.

use geo::{polygon, MultiPolygon};
use tempfile::TempDir;

use portal_catalog::bookmarks::BookmarksFile;
use portal_catalog::{
    cluster_portals, optimize_route, BookmarksSink, BoundaryIndex, Catalog, CatalogConfig,
    CatalogError, Classification, ClusterConfig, DistanceProvider, DrawShape, Drawing,
    DrawtoolsSink, FilterOp, GeoPoint, Portal, PortalField, PortalQuery, PortalRecord, PortalStore,
    PruneMode, Result, RouteConfig, Snapshot, SortOrder, StoreRead, StraightLineProvider, Tier,
};

const T1: i64 = 1_700_000_000;
const T2: i64 = 1_700_604_800;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Helper: catalog backed by a temp file, kept alive by the returned dir.
fn temp_catalog() -> (Catalog, TempDir) {
    let tmp_dir = TempDir::new().expect("failed to create temp dir");
    let db_path = tmp_dir.path().join("catalog.db");
    let catalog = Catalog::open(db_path.to_str().unwrap(), CatalogConfig::default())
        .expect("failed to open catalog");
    (catalog, tmp_dir)
}

fn record(id: &str, lat: f64, lng: f64) -> PortalRecord {
    PortalRecord::new(id, format!("Portal {id}"), lat, lng)
}

// ============================================================================
// Merge properties
// ============================================================================

#[test]
fn test_snapshot_a_then_b() {
    init_logging();
    let (mut catalog, _dir) = temp_catalog();

    let a = Snapshot::new(
        T1,
        vec![record("p1", 40.0, -75.0), record("p2", 40.01, -75.0), record("p3", 40.02, -75.0)],
    );
    let b = Snapshot::new(
        T2,
        vec![record("p2", 40.01, -75.0), record("p3", 40.02, -75.0), record("p4", 40.03, -75.0)],
    );
    catalog.ingest(&[a]).unwrap();
    catalog.ingest(&[b]).unwrap();

    let store = catalog.store();
    assert_eq!(store.portal_count().unwrap(), 4);
    for id in ["p2", "p3"] {
        let p = store.portal(id).unwrap().unwrap();
        assert_eq!((p.first_seen, p.last_seen), (T1, T2), "portal {id}");
    }
    let p4 = store.portal("p4").unwrap().unwrap();
    assert_eq!((p4.first_seen, p4.last_seen), (T2, T2));
}

#[test]
fn test_merge_idempotent() {
    let (mut once, _d1) = temp_catalog();
    let (mut twice, _d2) = temp_catalog();
    let snapshot = Snapshot::new(T1, vec![record("p1", 40.0, -75.0), record("p2", 41.0, -75.0)]);

    once.ingest(&[snapshot.clone()]).unwrap();
    twice.ingest(&[snapshot.clone()]).unwrap();
    let report = twice.ingest(&[snapshot]).unwrap();

    assert!(report.created.is_empty());
    assert_eq!(report.unchanged, 2);
    assert_eq!(once.store().portals().unwrap(), twice.store().portals().unwrap());
}

#[test]
fn test_merge_order_independent() {
    let s1 = Snapshot::new(T1, vec![record("p1", 40.0, -75.0), record("p2", 41.0, -75.0)]);
    let s2 = Snapshot::new(T2, vec![record("p2", 41.0, -75.0), record("p3", 42.0, -75.0)]);

    let (mut forward, _d1) = temp_catalog();
    forward.ingest(&[s1.clone()]).unwrap();
    forward.ingest(&[s2.clone()]).unwrap();

    let (mut backward, _d2) = temp_catalog();
    backward.ingest(&[s2.clone()]).unwrap();
    backward.ingest(&[s1.clone()]).unwrap();

    let (mut batched, _d3) = temp_catalog();
    batched.ingest(&[s2, s1]).unwrap();

    let expected = forward.store().portals().unwrap();
    assert_eq!(backward.store().portals().unwrap(), expected);
    assert_eq!(batched.store().portals().unwrap(), expected);
}

#[test]
fn test_conflict_leaves_store_unchanged() {
    let (mut catalog, _dir) = temp_catalog();
    catalog
        .ingest(&[Snapshot::new(T1, vec![record("p1", 40.0, -75.0)])])
        .unwrap();
    let before = catalog.store().portals().unwrap();

    let result = catalog.ingest(&[
        Snapshot::new(T2, vec![record("p2", 40.5, -75.0), record("p1", 40.0, -75.0)]),
        Snapshot::new(T2, vec![record("p2", 40.6, -75.0)]),
    ]);
    match result {
        Err(CatalogError::Conflict { portal_id, .. }) => assert_eq!(portal_id, "p2"),
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(catalog.store().portals().unwrap(), before);
}

#[test]
fn test_state_survives_reopen() {
    let tmp_dir = TempDir::new().unwrap();
    let db_path = tmp_dir.path().join("catalog.db");
    let path = db_path.to_str().unwrap();
    {
        let mut catalog = Catalog::open(path, CatalogConfig::default()).unwrap();
        catalog
            .ingest(&[Snapshot::new(T1, vec![record("p1", 40.0, -75.0)])])
            .unwrap();
    }
    let store = PortalStore::open(path).unwrap();
    assert_eq!(store.portal_count().unwrap(), 1);
}

// ============================================================================
// Geocode properties
// ============================================================================

fn boundary_index() -> BoundaryIndex {
    let square = |x0: f64, y0: f64| {
        MultiPolygon::new(vec![polygon![
            (x: x0, y: y0),
            (x: x0 + 0.5, y: y0),
            (x: x0 + 0.5, y: y0 + 0.5),
            (x: x0, y: y0 + 0.5),
            (x: x0, y: y0),
        ]])
    };
    BoundaryIndex::new(
        (0..10)
            .flat_map(|i| (0..10).map(move |j| (i, j)))
            .map(|(i, j)| (format!("{:05}", 10_000 + i * 10 + j), square(-80.0 + i as f64 * 0.5, 35.0 + j as f64 * 0.5)))
            .collect(),
    )
}

#[test]
fn test_geocode_deterministic() {
    let index = boundary_index();
    let sample_points = [
        GeoPoint::new(35.25, -79.75),
        GeoPoint::new(37.1, -77.3),
        GeoPoint::new(36.0, -78.0), // corner shared by four regions
        GeoPoint::new(10.0, 10.0),
    ];
    let first: Vec<Option<String>> = sample_points
        .iter()
        .map(|p| index.lookup(p).map(str::to_string))
        .collect();
    for _ in 0..5 {
        let rebuilt = boundary_index();
        let again: Vec<Option<String>> = sample_points
            .iter()
            .map(|p| rebuilt.lookup(p).map(str::to_string))
            .collect();
        assert_eq!(again, first);
    }
    assert_eq!(first[0].as_deref(), Some("10000"));
    assert!(first[2].is_some());
    assert_eq!(first[3], None);
}

#[test]
fn test_geocode_then_prune() {
    init_logging();
    let (mut catalog, _dir) = temp_catalog();
    catalog
        .ingest(&[Snapshot::new(
            T1,
            vec![
                record("keep-me", 35.25, -79.75),
                record("drop-me", 35.75, -79.75),
                record("at-sea", 10.0, 10.0),
            ],
        )])
        .unwrap();

    let report = catalog.geocode(&boundary_index()).unwrap();
    assert_eq!(report.new_codes, vec!["10000".to_string(), "10001".to_string()]);
    assert_eq!(report.unresolved, vec!["at-sea".to_string()]);

    // Nothing classified yet: nothing pruned
    assert!(catalog.prune(PruneMode::Full).unwrap().pruned.is_empty());

    catalog.set_region("10000", Some(Classification::Keep), None).unwrap();
    catalog.set_region("10001", Some(Classification::Discard), None).unwrap();
    let report = catalog.prune(PruneMode::Full).unwrap();
    assert_eq!(report.pruned, vec!["drop-me".to_string()]);
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].portal_id, "at-sea");

    let store = catalog.store();
    assert!(store.portal("drop-me").unwrap().is_none());
    assert_eq!(
        store.portal("keep-me").unwrap().unwrap().inclusion,
        Some(Classification::Keep)
    );
}

// ============================================================================
// Clustering properties
// ============================================================================

fn grid(side: usize, spacing_m: f64, origin: GeoPoint, prefix: &str) -> Vec<Portal> {
    let dlat = spacing_m / 111_195.0;
    let dlng = dlat / origin.latitude.to_radians().cos();
    (0..side * side)
        .map(|k| {
            let (row, col) = (k / side, k % side);
            Portal::new(
                format!("{prefix}{k:03}"),
                "grid",
                GeoPoint::new(origin.latitude + row as f64 * dlat, origin.longitude + col as f64 * dlng),
                T1,
            )
        })
        .collect()
}

fn assert_cluster_invariants(portals: &[Portal], clusters: &[portal_catalog::Cluster], config: &ClusterConfig) {
    let mut members: Vec<&str> = clusters
        .iter()
        .flat_map(|c| c.member_ids.iter().map(String::as_str))
        .collect();
    members.sort_unstable();
    let mut expected: Vec<&str> = portals.iter().map(|p| p.id.as_str()).collect();
    expected.sort_unstable();
    assert_eq!(members, expected, "every portal exactly once");

    assert!(clusters.iter().filter(|c| c.residual).count() <= 1);
    for cluster in clusters.iter().filter(|c| !c.residual) {
        let tier = config.tiers.iter().find(|t| t.name == cluster.tier).unwrap();
        assert!(cluster.len() >= config.min_members, "{} too small", cluster.id);
        assert!(cluster.bounding_size_m <= tier.max_size_m, "{} too large", cluster.id);
    }
}

#[test]
fn test_twenty_five_uniform_portals() {
    let config = ClusterConfig {
        min_members: 10,
        tiers: vec![Tier::new("small", 500.0), Tier::new("large", 5000.0)],
    };
    let portals = grid(5, 200.0, GeoPoint::new(39.95, -75.16), "p");
    let clusters = cluster_portals(&portals, &config).unwrap();

    assert_cluster_invariants(&portals, &clusters, &config);
    assert!(clusters.iter().all(|c| !c.residual && c.len() >= 10));
}

#[test]
fn test_mixed_density_invariants() {
    let config = ClusterConfig::default();
    let mut portals = grid(6, 40.0, GeoPoint::new(39.95, -75.16), "a");
    portals.extend(grid(5, 300.0, GeoPoint::new(39.99, -75.10), "b"));
    portals.extend(grid(2, 100.0, GeoPoint::new(40.30, -74.50), "c"));
    let clusters = cluster_portals(&portals, &config).unwrap();
    assert_cluster_invariants(&portals, &clusters, &config);
}

#[test]
fn test_donuts_persist_and_export() {
    let (mut catalog, dir) = temp_catalog();
    let records: Vec<PortalRecord> = grid(4, 60.0, GeoPoint::new(39.95, -75.16), "p")
        .into_iter()
        .map(|p| PortalRecord::new(p.id, p.name, p.position.latitude, p.position.longitude))
        .collect();
    catalog.ingest(&[Snapshot::new(T1, records)]).unwrap();

    let clusters = catalog.donuts(None).unwrap();
    assert_eq!(catalog.store().clusters().unwrap(), clusters);

    let path = dir.path().join("donuts.json");
    let file = std::fs::File::create(&path).unwrap();
    let mut sink = DrawtoolsSink::new(file, DrawShape::Hull);
    assert_eq!(catalog.export_clusters(&mut sink).unwrap(), clusters.len());
    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("\"polygon\""));
}

#[test]
fn test_reclustering_subset_keeps_membership_consistent() {
    let tmp_dir = TempDir::new().unwrap();
    let db_path = tmp_dir.path().join("catalog.db");
    let mut config = CatalogConfig::default();
    config.clustering = ClusterConfig {
        min_members: 3,
        tiers: vec![Tier::new("walking", 5000.0)],
    };
    let mut catalog = Catalog::open(db_path.to_str().unwrap(), config).unwrap();

    // Eleven portals on a line, 100m apart
    let records: Vec<PortalRecord> = (0..11)
        .map(|i| record(&format!("p{i:02}"), 40.0, -75.0 + i as f64 * 0.00117))
        .collect();
    catalog.ingest(&[Snapshot::new(T1, records)]).unwrap();

    let whole = catalog.donuts(None).unwrap();
    let middle: Vec<String> = (2..9).map(|i| format!("p{i:02}")).collect();
    let part = catalog.donuts(Some(&middle)).unwrap();
    // Same centre, same leader, same id
    assert_eq!(whole[0].id, part[0].id);

    let store = catalog.store();
    for portal in store.portals().unwrap() {
        if let Some(cluster_id) = &portal.cluster_id {
            let cluster = store.cluster(cluster_id).unwrap().unwrap();
            assert!(
                cluster.member_ids.contains(&portal.id),
                "{} points at {} but is not a member",
                portal.id,
                cluster_id
            );
        }
    }
    for cluster in store.clusters().unwrap() {
        for member in &cluster.member_ids {
            let portal = store.portal(member).unwrap().unwrap();
            assert_eq!(portal.cluster_id.as_deref(), Some(cluster.id.as_str()));
        }
    }
}

// ============================================================================
// Route properties
// ============================================================================

/// Exact planar distances between portals, in degrees.
struct ExactProvider;

impl DistanceProvider for ExactProvider {
    fn distance(&mut self, from: &Portal, to: &Portal) -> Result<f64> {
        let dx = from.position.longitude - to.position.longitude;
        let dy = from.position.latitude - to.position.latitude;
        Ok((dx * dx + dy * dy).sqrt())
    }
}

#[test]
fn test_five_portal_optimum() {
    // Corners of an L; the optimal open path walks the L end to end
    let portals = vec![
        Portal::new("m", "", GeoPoint::new(0.0, 2.0), T1),
        Portal::new("e", "", GeoPoint::new(2.0, 2.0), T1),
        Portal::new("a", "", GeoPoint::new(0.0, 0.0), T1),
        Portal::new("f", "", GeoPoint::new(1.0, 2.0), T1),
        Portal::new("b", "", GeoPoint::new(0.0, 1.0), T1),
    ];
    let optimum: Vec<String> = ["a", "b", "m", "f", "e"].iter().map(|s| s.to_string()).collect();
    let mut reversed = optimum.clone();
    reversed.reverse();

    for config in [
        RouteConfig::default(),
        RouteConfig {
            exhaustive_limit: 0,
            ..Default::default()
        },
    ] {
        let route = optimize_route(&portals, ExactProvider, &config);
        assert!(
            route.portal_ids == optimum || route.portal_ids == reversed,
            "got {:?}",
            route.portal_ids
        );
        assert!((route.total_cost - 4.0).abs() < 1e-9);
    }
}

#[test]
fn test_two_opt_never_worse_than_construction() {
    let config = RouteConfig {
        exhaustive_limit: 0,
        ..Default::default()
    };
    // Deterministic scatter
    let portals: Vec<Portal> = (0..40)
        .map(|i| {
            let x = ((i * 37) % 41) as f64 / 41.0;
            let y = ((i * 23) % 43) as f64 / 43.0;
            Portal::new(format!("s{i:02}"), "", GeoPoint::new(y, x), T1)
        })
        .collect();
    let route = optimize_route(&portals, ExactProvider, &config);

    assert!(route.total_cost <= route.initial_cost + 1e-9);
    let mut ids = route.portal_ids.clone();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), portals.len());
}

// ============================================================================
// Listings, drawn areas and ellipses
// ============================================================================

#[test]
fn test_show_groups_by_region_after_geocode() {
    let (mut catalog, _dir) = temp_catalog();
    catalog
        .ingest(&[Snapshot::new(
            T1,
            vec![
                record("w1", 35.2, -79.8),
                record("w2", 35.4, -79.6),
                record("e1", 35.2, -79.2),
                record("sea", 5.0, 5.0),
            ],
        )])
        .unwrap();
    catalog.ingest(&[Snapshot::new(T2, vec![record("w2", 35.4, -79.6)])]).unwrap();
    catalog.geocode(&boundary_index()).unwrap();

    let query = PortalQuery::new()
        .filter_arg(FilterOp::In, "region:10000")
        .unwrap()
        .filter_arg(FilterOp::In, "region:10010")
        .unwrap()
        .group_by(PortalField::Region)
        .order_by(PortalField::LastSeen, SortOrder::Desc);
    let report = catalog.show(&query).unwrap();
    assert_eq!(report.total, 3);
    let keys: Vec<&str> = report.groups.iter().map(|g| g.key.as_str()).collect();
    // w2 was seen last, so its region comes first
    assert_eq!(keys, vec!["10000", "10010"]);
    let west: Vec<&str> = report.groups[0].portals.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(west, vec!["w2", "w1"]);

    let mut sink = BookmarksSink::new(Vec::new());
    catalog.export_show(&mut sink, &report).unwrap();
    let file = BookmarksFile::from_json_str(&String::from_utf8(sink.into_inner()).unwrap()).unwrap();
    assert_eq!(file.portal_records().unwrap().len(), 3);
}

#[test]
fn test_trim_bookmarks_file_to_drawn_circle() {
    let (mut catalog, dir) = temp_catalog();
    catalog
        .ingest(&[Snapshot::new(T1, vec![record("near", 40.0, -75.0), record("far", 40.1, -75.0)])])
        .unwrap();

    let bookmarks = dir.path().join("bookmarks.json");
    let route = catalog
        .route(&["near".to_string(), "far".to_string()], StraightLineProvider, T1)
        .unwrap();
    let mut sink = BookmarksSink::new(std::fs::File::create(&bookmarks).unwrap());
    catalog.export_route(&mut sink, "trip", &route).unwrap();
    drop(sink);

    let drawing = dir.path().join("drawing.json");
    std::fs::write(
        &drawing,
        r#"[{"type": "circle", "latLng": {"lat": 40.0, "lng": -75.0}, "radius": 500}]"#,
    )
    .unwrap();

    let removed = catalog.trim_bookmarks_file(&bookmarks, &drawing).unwrap();
    assert_eq!(removed, vec!["far".to_string()]);
    let snapshot = Snapshot::from_bookmarks_file(&bookmarks).unwrap();
    let ids: Vec<&str> = snapshot.records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["near"]);

    // A marker bounds no area
    std::fs::write(
        &drawing,
        r#"[{"type": "marker", "latLng": {"lat": 40.0, "lng": -75.0}}]"#,
    )
    .unwrap();
    assert!(matches!(
        catalog.trim_bookmarks_file(&bookmarks, &drawing),
        Err(CatalogError::Geometry { .. })
    ));
}

#[test]
fn test_ellipse_bands_from_drawn_foci() {
    let (mut catalog, _dir) = temp_catalog();
    let records: Vec<PortalRecord> = (0..7)
        .map(|i| record(&format!("r{i}"), 40.0, -75.0 + i as f64 * 0.002))
        .collect();
    catalog.ingest(&[Snapshot::new(T1, records)]).unwrap();

    let foci = Drawing::from_json_str(
        r#"[{"type": "marker", "latLng": {"lat": 40.0, "lng": -75.0}}]"#,
    )
    .unwrap()
    .points()
    .unwrap();
    let groups = catalog.ellipse(&foci, 3, None).unwrap();
    let bands: Vec<Vec<String>> = groups.iter().map(|g| g.portal_ids.clone()).collect();
    assert_eq!(
        bands,
        vec![vec!["r0", "r1", "r2"], vec!["r3", "r4", "r5"], vec!["r6"]]
    );

    let mut sink = BookmarksSink::new(Vec::new());
    catalog.export_ellipses(&mut sink, &groups).unwrap();
    let file = BookmarksFile::from_json_str(&String::from_utf8(sink.into_inner()).unwrap()).unwrap();
    let labels: Vec<&str> = file.portals.values().map(|f| f.label.as_str()).collect();
    assert!(labels.contains(&"ellipse-3-0"));
    assert!(labels.contains(&"ellipse-3-2"));
}
