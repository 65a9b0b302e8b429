//! # Donut Clustering
//!
//! Partitions a portal set into geographically compact clusters ("donuts").
//!
//! ## Algorithm
//!
//! Tiers are processed smallest to largest. Within a tier:
//! 1. Seed a cluster from the pool portal nearest the centroid of everything
//!    clustered so far (the smallest id when nothing is clustered yet).
//! 2. Absorb the pool portal nearest the cluster's centroid while the
//!    cluster's max pairwise distance stays within the tier bound. The first
//!    rejected candidate closes the cluster and stays in the pool.
//! 3. A closed cluster below the minimum member count is dissolved; its
//!    members wait for the next tier.
//!
//! Whatever is left after the largest tier becomes one residual cluster,
//! exempt from the minimum. Nearest-neighbour queries go through an R-tree
//! over a local planar projection; ties are broken by portal id so a fixed
//! input always produces the same clusters.
//!
//! [`ellipse_groups`] is a simpler grouping around hand-picked foci: portals
//! ordered by summed distance to every focus, cut into fixed-size bands.

use std::collections::HashSet;

use log::{debug, info};
use rstar::{PointDistance, RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

use crate::config::{ClusterConfig, Tier};
use crate::error::{CatalogError, OptionExt, Result};
use crate::geo_utils::{compute_center, haversine_distance, max_pairwise_distance, LocalProjection};
use crate::store::{PortalStore, StoreRead};
use crate::types::{Cluster, Portal};
use crate::GeoPoint;

/// Squared planar distances closer than this are treated as ties (m²).
const TIE_EPSILON_M2: f64 = 1e-6;

/// A pool portal in projected meters, for spatial queries.
#[derive(Debug, Clone, Copy, PartialEq)]
struct IndexedPoint {
    /// Index into the id-sorted portal slice
    idx: usize,
    x: f64,
    y: f64,
}

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.x, self.y])
    }
}

impl PointDistance for IndexedPoint {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.x - point[0];
        let dy = self.y - point[1];
        dx * dx + dy * dy
    }
}

/// Pool of unclustered portals for one tier.
struct Pool {
    tree: RTree<IndexedPoint>,
    /// Same entries, ordered by index (and therefore by id)
    remaining: std::collections::BTreeMap<usize, IndexedPoint>,
}

impl Pool {
    fn new(points: Vec<IndexedPoint>) -> Self {
        let remaining = points.iter().map(|p| (p.idx, *p)).collect();
        Self {
            tree: RTree::bulk_load(points),
            remaining,
        }
    }

    fn is_empty(&self) -> bool {
        self.remaining.is_empty()
    }

    fn first(&self) -> Option<usize> {
        self.remaining.keys().next().copied()
    }

    /// Pool entry nearest `target`, ties to the smallest index.
    fn nearest(&self, target: [f64; 2]) -> Option<usize> {
        let mut iter = self.tree.nearest_neighbor_iter_with_distance_2(&target);
        let (first, best_d2) = iter.next()?;
        let mut best = first.idx;
        for (point, d2) in iter {
            if d2 > best_d2 + TIE_EPSILON_M2 {
                break;
            }
            best = best.min(point.idx);
        }
        Some(best)
    }

    fn take(&mut self, idx: usize) {
        if let Some(point) = self.remaining.remove(&idx) {
            self.tree.remove(&point);
        }
    }

    fn drain(self) -> Vec<usize> {
        self.remaining.into_keys().collect()
    }
}

/// Running sum of clustered positions, for seeding near existing clusters.
#[derive(Default)]
struct ClusteredCentroid {
    sum: [f64; 2],
    count: usize,
}

impl ClusteredCentroid {
    fn add(&mut self, point: [f64; 2]) {
        self.sum[0] += point[0];
        self.sum[1] += point[1];
        self.count += 1;
    }

    fn get(&self) -> Option<[f64; 2]> {
        (self.count > 0).then(|| {
            let n = self.count as f64;
            [self.sum[0] / n, self.sum[1] / n]
        })
    }
}

/// Partition `portals` into clusters. Pure computation; nothing is persisted.
///
/// Duplicate ids in the input are collapsed.
pub fn cluster_portals(portals: &[Portal], config: &ClusterConfig) -> Result<Vec<Cluster>> {
    config.validate()?;

    let mut sorted: Vec<&Portal> = portals.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    sorted.dedup_by(|a, b| a.id == b.id);

    if sorted.is_empty() {
        return Ok(Vec::new());
    }

    let positions: Vec<GeoPoint> = sorted.iter().map(|p| p.position).collect();
    let projection = LocalProjection::centered_on(&positions);
    let projected: Vec<[f64; 2]> = positions.iter().map(|p| projection.project(p)).collect();

    let mut clusters = Vec::new();
    let mut clustered = ClusteredCentroid::default();
    let mut waiting: Vec<usize> = (0..sorted.len()).collect();

    for tier in &config.tiers {
        let points = waiting
            .iter()
            .map(|&idx| IndexedPoint {
                idx,
                x: projected[idx][0],
                y: projected[idx][1],
            })
            .collect();
        let mut pool = Pool::new(points);
        let mut deferred = Vec::new();

        while !pool.is_empty() {
            let seed = match clustered.get() {
                Some(center) => pool.nearest(center),
                None => pool.first(),
            };
            let Some(seed) = seed else { break };
            pool.take(seed);

            let members = grow(seed, &mut pool, &positions, &projected, tier);
            if members.len() >= config.min_members {
                for &idx in &members {
                    clustered.add(projected[idx]);
                }
                clusters.push(build_cluster(&sorted, &members, tier, false));
            } else {
                deferred.extend(members);
            }
        }

        debug!(
            "[Donuts] Tier '{}': {} clusters so far, {} portals deferred",
            tier.name,
            clusters.len(),
            deferred.len()
        );
        deferred.extend(pool.drain());
        deferred.sort_unstable();
        waiting = deferred;
        if waiting.is_empty() {
            break;
        }
    }

    if !waiting.is_empty() {
        if let Some(last) = config.tiers.last() {
            clusters.push(build_cluster(&sorted, &waiting, last, true));
        }
    }

    validate_clusters(&sorted, &clusters, config)?;

    info!(
        "[Donuts] Clustered {} portals into {} clusters ({} residual)",
        sorted.len(),
        clusters.len(),
        waiting.len()
    );
    Ok(clusters)
}

/// Grow one cluster from `seed`, taking absorbed portals out of the pool.
fn grow(
    seed: usize,
    pool: &mut Pool,
    positions: &[GeoPoint],
    projected: &[[f64; 2]],
    tier: &Tier,
) -> Vec<usize> {
    let mut members = vec![seed];
    let mut sum = projected[seed];

    while let Some(candidate) = {
        let n = members.len() as f64;
        pool.nearest([sum[0] / n, sum[1] / n])
    } {
        let fits = members
            .iter()
            .all(|&m| haversine_distance(&positions[m], &positions[candidate]) <= tier.max_size_m);
        if !fits {
            break;
        }
        pool.take(candidate);
        members.push(candidate);
        sum[0] += projected[candidate][0];
        sum[1] += projected[candidate][1];
    }

    members
}

fn build_cluster(sorted: &[&Portal], members: &[usize], tier: &Tier, residual: bool) -> Cluster {
    let positions: Vec<GeoPoint> = members.iter().map(|&i| sorted[i].position).collect();
    let centroid = compute_center(&positions);

    // Nearest to the centroid; members are id-ordered by index so ties go low
    let mut leader = members[0];
    let mut leader_dist = f64::INFINITY;
    for &idx in members {
        let d = haversine_distance(&sorted[idx].position, &centroid);
        if d < leader_dist || (d == leader_dist && sorted[idx].id < sorted[leader].id) {
            leader = idx;
            leader_dist = d;
        }
    }
    let leader_id = sorted[leader].id.clone();

    Cluster {
        id: format!("{}:{}", tier.name, leader_id),
        tier: tier.name.clone(),
        residual,
        member_ids: members.iter().map(|&i| sorted[i].id.clone()).collect(),
        centroid,
        bounding_size_m: max_pairwise_distance(&positions),
        leader_id,
    }
}

/// Check the produced clusters against their contract.
///
/// Every non-residual cluster must meet the minimum member count and its
/// tier bound, at most one residual cluster may exist, and every input
/// portal must appear in exactly one cluster.
fn validate_clusters(sorted: &[&Portal], clusters: &[Cluster], config: &ClusterConfig) -> Result<()> {
    let violation = |cluster_id: &str, rule: String| CatalogError::InvariantViolation {
        cluster_id: cluster_id.to_string(),
        rule,
    };

    let mut seen: HashSet<&str> = HashSet::with_capacity(sorted.len());
    let mut residuals = 0;
    for cluster in clusters {
        if cluster.residual {
            residuals += 1;
            if residuals > 1 {
                return Err(violation(&cluster.id, "more than one residual cluster".to_string()));
            }
        } else {
            let tier = config
                .tiers
                .iter()
                .find(|t| t.name == cluster.tier)
                .ok_or_else(|| violation(&cluster.id, format!("unknown tier '{}'", cluster.tier)))?;
            if cluster.len() < config.min_members {
                return Err(violation(
                    &cluster.id,
                    format!("{} members, minimum is {}", cluster.len(), config.min_members),
                ));
            }
            if cluster.bounding_size_m > tier.max_size_m {
                return Err(violation(
                    &cluster.id,
                    format!(
                        "bounding size {:.1}m exceeds tier '{}' maximum {:.1}m",
                        cluster.bounding_size_m, tier.name, tier.max_size_m
                    ),
                ));
            }
        }
        for member in &cluster.member_ids {
            if !seen.insert(member.as_str()) {
                return Err(violation(&cluster.id, format!("portal '{member}' assigned twice")));
            }
        }
    }

    if let Some(missing) = sorted.iter().find(|p| !seen.contains(p.id.as_str())) {
        return Err(violation("-", format!("portal '{}' not assigned", missing.id)));
    }
    if seen.len() != sorted.len() {
        return Err(violation("-", "cluster members outside the input set".to_string()));
    }
    Ok(())
}

/// Cluster a portal subset and persist the assignments, replacing any
/// previous clusters of that subset. `None` clusters the whole catalog.
pub fn donuts(
    store: &mut PortalStore,
    subset: Option<&[String]>,
    config: &ClusterConfig,
) -> Result<Vec<Cluster>> {
    let portals = match subset {
        None => store.portals()?,
        Some(ids) => {
            let mut portals = Vec::with_capacity(ids.len());
            for id in ids {
                portals.push(store.portal(id)?.ok_or_unknown_portal(id)?);
            }
            portals
        }
    };

    let clusters = cluster_portals(&portals, config)?;
    let ids: Vec<String> = portals.iter().map(|p| p.id.clone()).collect();

    let tx = store.transaction()?;
    tx.replace_clusters(&ids, &clusters)?;
    tx.commit()?;

    Ok(clusters)
}

// ============================================================================
// Ellipse groups
// ============================================================================

/// One band of portals by summed distance to the foci.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EllipseGroup {
    /// Band number, 0 closest to the foci
    pub number: usize,
    /// Members by increasing summed distance, ties by id
    pub portal_ids: Vec<String>,
    pub min_distance_m: f64,
    pub max_distance_m: f64,
}

/// Order portals by the sum of their distances to `foci` and cut the list
/// into groups of `count`, closest first. With one focus the bands are
/// rings; with two they are ellipses.
///
/// At most `max_groups` groups are returned when given. The last group may
/// hold fewer than `count` portals. Duplicate ids are counted once.
pub fn ellipse_groups(
    portals: &[Portal],
    foci: &[GeoPoint],
    count: usize,
    max_groups: Option<usize>,
) -> Result<Vec<EllipseGroup>> {
    if count == 0 {
        return Err(CatalogError::InvalidConfig {
            message: "ellipse group size must be positive".to_string(),
        });
    }
    if foci.is_empty() {
        return Err(CatalogError::Geometry {
            message: "ellipse grouping needs at least one focus".to_string(),
        });
    }

    let mut seen = HashSet::new();
    let mut ranked: Vec<(f64, &str)> = portals
        .iter()
        .filter(|p| seen.insert(p.id.as_str()))
        .map(|p| {
            let total: f64 = foci.iter().map(|f| haversine_distance(f, &p.position)).sum();
            (total, p.id.as_str())
        })
        .collect();
    ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1)));

    let groups: Vec<EllipseGroup> = ranked
        .chunks(count)
        .take(max_groups.unwrap_or(usize::MAX))
        .enumerate()
        .map(|(number, band)| EllipseGroup {
            number,
            portal_ids: band.iter().map(|(_, id)| id.to_string()).collect(),
            min_distance_m: band.first().map_or(0.0, |b| b.0),
            max_distance_m: band.last().map_or(0.0, |b| b.0),
        })
        .collect();

    for group in &groups {
        debug!(
            "[Clustering] Ellipse {}: {} portals, {:.0}m to {:.0}m",
            group.number,
            group.portal_ids.len(),
            group.min_distance_m,
            group.max_distance_m
        );
    }
    Ok(groups)
}
