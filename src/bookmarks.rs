//! IITC bookmarks files.
//!
//! Portals live under `portals -> {folder id} -> bkmrk -> {bookmark id}` with
//! the position as a `"lat,lng"` string. Folders and bookmarks carry extra
//! fields in the wild; unknown fields are ignored on read.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::UNIX_EPOCH;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};
use crate::ingest::{PortalRecord, Snapshot};
use crate::types::Portal;
use crate::GeoPoint;

/// Folder id IITC uses for its default folder.
pub const DEFAULT_FOLDER_ID: &str = "idOthers";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookmarksFile {
    #[serde(default)]
    pub maps: BTreeMap<String, Folder>,
    #[serde(default)]
    pub portals: BTreeMap<String, Folder>,
}

impl Default for BookmarksFile {
    fn default() -> Self {
        let mut maps = BTreeMap::new();
        maps.insert(DEFAULT_FOLDER_ID.to_string(), Folder::new("Others", 1));
        let mut portals = BTreeMap::new();
        portals.insert(DEFAULT_FOLDER_ID.to_string(), Folder::new("Others", 0));
        Self { maps, portals }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    pub label: String,
    /// 1 = expanded in the IITC sidebar
    #[serde(default)]
    pub state: u8,
    #[serde(default)]
    pub bkmrk: BTreeMap<String, Bookmark>,
}

impl Folder {
    pub fn new(label: impl Into<String>, state: u8) -> Self {
        Self {
            label: label.into(),
            state,
            bkmrk: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bookmark {
    pub guid: String,
    /// `"lat,lng"`
    pub latlng: String,
    pub label: String,
}

impl Bookmark {
    pub fn from_portal(portal: &Portal) -> Self {
        Self {
            guid: portal.id.clone(),
            latlng: format!("{},{}", portal.position.latitude, portal.position.longitude),
            label: portal.name.clone(),
        }
    }

    pub fn position(&self) -> Result<GeoPoint> {
        let invalid = || CatalogError::InvalidCoordinates {
            portal_id: self.guid.clone(),
            latitude: f64::NAN,
            longitude: f64::NAN,
        };
        let (lat, lng) = self.latlng.split_once(',').ok_or_else(invalid)?;
        let lat: f64 = lat.trim().parse().map_err(|_| invalid())?;
        let lng: f64 = lng.trim().parse().map_err(|_| invalid())?;
        Ok(GeoPoint::new(lat, lng))
    }

    pub fn to_record(&self) -> Result<PortalRecord> {
        Ok(PortalRecord {
            id: self.guid.clone(),
            name: self.label.clone(),
            position: self.position()?,
        })
    }
}

impl BookmarksFile {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Every portal bookmark across all folders, keyed by guid.
    pub fn portal_records(&self) -> Result<Vec<PortalRecord>> {
        let mut by_guid: BTreeMap<&str, &Bookmark> = BTreeMap::new();
        for folder in self.portals.values() {
            for bookmark in folder.bkmrk.values() {
                by_guid.insert(&bookmark.guid, bookmark);
            }
        }
        by_guid.values().map(|b| b.to_record()).collect()
    }

    /// Add a portal folder holding `portals`, keyed by guid.
    pub fn add_folder(&mut self, folder_id: &str, label: &str, portals: &[Portal]) {
        let folder = self
            .portals
            .entry(folder_id.to_string())
            .or_insert_with(|| Folder::new(label, 0));
        folder.label = label.to_string();
        for portal in portals {
            folder
                .bkmrk
                .insert(portal.id.clone(), Bookmark::from_portal(portal));
        }
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl Snapshot {
    /// Read an IITC bookmarks export. The observation timestamp is the file's
    /// modification time.
    pub fn from_bookmarks_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let modified = std::fs::metadata(path)?.modified()?;
        let observed_at = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let snapshot = Self::from_bookmarks_str(&json, observed_at)?;
        info!(
            "[Ingest] Loaded {} portals from {} (observed at {})",
            snapshot.records.len(),
            path.display(),
            observed_at
        );
        Ok(snapshot)
    }

    pub fn from_bookmarks_str(json: &str, observed_at: i64) -> Result<Self> {
        let file = BookmarksFile::from_json_str(json)?;
        Ok(Self::new(observed_at, file.portal_records()?))
    }
}
