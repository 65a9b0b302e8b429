//! Export of ordered portal sequences (routes, clusters) to IITC files.
//!
//! A sink collects named sequences and writes one file when finished.

use std::collections::HashSet;
use std::io::Write;

use geo::{ConvexHull, Intersects, MultiPoint};
use log::debug;

use crate::bookmarks::{BookmarksFile, DEFAULT_FOLDER_ID};
use crate::drawtools::{DrawItem, LatLng};
use crate::error::Result;
use crate::geo_utils::to_point;
use crate::types::Portal;

/// Destination for ordered portal sequences.
pub trait ExportSink {
    /// Add one named sequence, preserving its order.
    fn write_portals(&mut self, name: &str, portals: &[Portal]) -> Result<()>;

    /// Serialize everything written so far.
    fn finish(&mut self) -> Result<()>;
}

// ============================================================================
// Bookmarks
// ============================================================================

/// Writes each sequence as a bookmark folder. The first goes into the default
/// folder, later ones into `id1`, `id2`, ...
pub struct BookmarksSink<W: Write> {
    writer: W,
    file: BookmarksFile,
    folders: usize,
}

impl<W: Write> BookmarksSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            file: BookmarksFile::default(),
            folders: 0,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ExportSink for BookmarksSink<W> {
    fn write_portals(&mut self, name: &str, portals: &[Portal]) -> Result<()> {
        let folder_id = match self.folders {
            0 => DEFAULT_FOLDER_ID.to_string(),
            n => format!("id{n}"),
        };
        self.file.add_folder(&folder_id, name, portals);
        self.folders += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        serde_json::to_writer_pretty(&mut self.writer, &self.file)?;
        self.writer.flush()?;
        Ok(())
    }
}

// ============================================================================
// Drawtools
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawShape {
    /// Path through the portals in order (routes)
    Polyline,
    /// Convex hull around the portals (clusters)
    Hull,
}

/// Writes each sequence as a drawtools polyline or hull polygon. Colors are
/// spread evenly over the RGB range when the file is finished.
pub struct DrawtoolsSink<W: Write> {
    writer: W,
    shape: DrawShape,
    items: Vec<(DrawShape, Vec<LatLng>)>,
}

impl<W: Write> DrawtoolsSink<W> {
    pub fn new(writer: W, shape: DrawShape) -> Self {
        Self {
            writer,
            shape,
            items: Vec::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn items(&self) -> Vec<DrawItem> {
        let stride = 0x100_0000 / (self.items.len() as u32 + 1);
        self.items
            .iter()
            .enumerate()
            .map(|(i, (shape, lat_lngs))| {
                let color = Some(format!("#{:06x}", stride * (i as u32 + 1)));
                let lat_lngs = lat_lngs.clone();
                match shape {
                    DrawShape::Polyline => DrawItem::Polyline { color, lat_lngs },
                    DrawShape::Hull => DrawItem::Polygon { color, lat_lngs },
                }
            })
            .collect()
    }
}

impl<W: Write> ExportSink for DrawtoolsSink<W> {
    fn write_portals(&mut self, name: &str, portals: &[Portal]) -> Result<()> {
        if portals.is_empty() {
            debug!("[Export] Skipping empty sequence '{}'", name);
            return Ok(());
        }
        let lat_lngs = match self.shape {
            DrawShape::Polyline => portals.iter().map(|p| LatLng::from(p.position)).collect(),
            DrawShape::Hull => hull_of(portals)
                .convex_hull()
                .exterior()
                .points()
                .map(|pt| LatLng {
                    lat: pt.y(),
                    lng: pt.x(),
                })
                .collect(),
        };
        self.items.push((self.shape, lat_lngs));
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let items = self.items();
        serde_json::to_writer(&mut self.writer, &items)?;
        self.writer.flush()?;
        Ok(())
    }
}

fn hull_of(portals: &[Portal]) -> MultiPoint<f64> {
    portals
        .iter()
        .map(|p| to_point(&p.position))
        .collect::<Vec<_>>()
        .into()
}

// ============================================================================
// Sampling
// ============================================================================

/// Pick roughly `samples` portals that still outline the whole set: every
/// portal on the convex hull boundary, topped up with the remaining portals in
/// id order. The result is ordered by id.
pub fn sample_portals(portals: &[Portal], samples: usize) -> Vec<Portal> {
    if portals.is_empty() {
        return Vec::new();
    }
    let hull = hull_of(portals).convex_hull();
    let boundary = hull.exterior();

    let mut sorted: Vec<&Portal> = portals.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    sorted.dedup_by(|a, b| a.id == b.id);

    let on_hull: HashSet<&str> = sorted
        .iter()
        .filter(|p| boundary.intersects(&to_point(&p.position)))
        .map(|p| p.id.as_str())
        .collect();

    let mut extra = samples.saturating_sub(on_hull.len());
    sorted
        .into_iter()
        .filter(|p| {
            if on_hull.contains(p.id.as_str()) {
                return true;
            }
            if extra > 0 {
                extra -= 1;
                return true;
            }
            false
        })
        .cloned()
        .collect()
}
