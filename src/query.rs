//! # Portal Listing
//!
//! Filtered, ordered and grouped listings of catalog portals.
//!
//! A [`PortalQuery`] compiles to a single parameterised `SELECT` over the
//! portals table. Filters on different fields are combined with AND; repeated
//! `In` filters on one field accept any of their values, repeated `NotIn`
//! filters reject all of theirs. Results always end with an id ordering so a
//! listing is stable.

use std::collections::BTreeMap;

use log::debug;
use rusqlite::types::ToSqlOutput;
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};
use crate::store::{PortalStore, StoreRead};
use crate::types::Portal;

// ============================================================================
// Fields and values
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortalField {
    Id,
    Name,
    Latitude,
    Longitude,
    FirstSeen,
    LastSeen,
    Region,
    Inclusion,
    Cluster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Integer,
    Real,
    Text,
}

impl PortalField {
    pub const ALL: [PortalField; 9] = [
        PortalField::Id,
        PortalField::Name,
        PortalField::Latitude,
        PortalField::Longitude,
        PortalField::FirstSeen,
        PortalField::LastSeen,
        PortalField::Region,
        PortalField::Inclusion,
        PortalField::Cluster,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PortalField::Id => "id",
            PortalField::Name => "name",
            PortalField::Latitude => "latitude",
            PortalField::Longitude => "longitude",
            PortalField::FirstSeen => "first-seen",
            PortalField::LastSeen => "last-seen",
            PortalField::Region => "region",
            PortalField::Inclusion => "inclusion",
            PortalField::Cluster => "cluster",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.name() == name)
            .ok_or_else(|| CatalogError::InvalidQuery {
                message: format!("unknown field '{name}'"),
            })
    }

    fn column(&self) -> &'static str {
        match self {
            PortalField::Id => "id",
            PortalField::Name => "name",
            PortalField::Latitude => "lat",
            PortalField::Longitude => "lng",
            PortalField::FirstSeen => "first_seen",
            PortalField::LastSeen => "last_seen",
            PortalField::Region => "region_code",
            PortalField::Inclusion => "inclusion",
            PortalField::Cluster => "cluster_id",
        }
    }

    fn kind(&self) -> FieldKind {
        match self {
            PortalField::FirstSeen | PortalField::LastSeen => FieldKind::Integer,
            PortalField::Latitude | PortalField::Longitude => FieldKind::Real,
            _ => FieldKind::Text,
        }
    }

    /// Parse `raw` as a value of this field's type.
    pub fn parse_value(&self, raw: &str) -> Result<FieldValue> {
        let invalid = || CatalogError::InvalidQuery {
            message: format!("'{raw}' is not a valid {} value", self.name()),
        };
        Ok(match self.kind() {
            FieldKind::Integer => FieldValue::Integer(raw.parse().map_err(|_| invalid())?),
            FieldKind::Real => FieldValue::Real(raw.parse().map_err(|_| invalid())?),
            FieldKind::Text => FieldValue::Text(raw.to_string()),
        })
    }

    /// Display value of this field for `portal`; empty when unset.
    pub fn value_of(&self, portal: &Portal) -> String {
        match self {
            PortalField::Id => portal.id.clone(),
            PortalField::Name => portal.name.clone(),
            PortalField::Latitude => portal.position.latitude.to_string(),
            PortalField::Longitude => portal.position.longitude.to_string(),
            PortalField::FirstSeen => portal.first_seen.to_string(),
            PortalField::LastSeen => portal.last_seen.to_string(),
            PortalField::Region => portal.region_code.clone().unwrap_or_default(),
            PortalField::Inclusion => portal
                .inclusion
                .map(|c| c.as_str().to_string())
                .unwrap_or_default(),
            PortalField::Cluster => portal.cluster_id.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Real(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            FieldValue::Integer(v) => ToSqlOutput::from(*v),
            FieldValue::Real(v) => ToSqlOutput::from(*v),
            FieldValue::Text(v) => ToSqlOutput::from(v.as_str()),
        })
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Integer(v) => write!(f, "{v}"),
            FieldValue::Real(v) => write!(f, "{v}"),
            FieldValue::Text(v) => write!(f, "{v}"),
        }
    }
}

// ============================================================================
// Query
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterOp {
    Lt,
    Le,
    Gt,
    Ge,
    /// SQL LIKE: `%` matches any run of characters, `_` any single one
    Like,
    NotLike,
    In,
    NotIn,
}

impl FilterOp {
    fn sql(&self) -> &'static str {
        match self {
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
            FilterOp::Like => "LIKE",
            FilterOp::NotLike => "NOT LIKE",
            FilterOp::In => "IN",
            FilterOp::NotIn => "NOT IN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: PortalField,
    pub op: FilterOp,
    pub value: FieldValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Selection, ordering and grouping for a portal listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PortalQuery {
    pub filters: Vec<Filter>,
    pub order: Vec<(PortalField, SortOrder)>,
    pub limit: Option<usize>,
    /// Grouping does not imply ordering
    pub group_by: Vec<PortalField>,
}

impl PortalQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: PortalField, op: FilterOp, value: impl Into<FieldValue>) -> Self {
        self.filters.push(Filter {
            field,
            op,
            value: value.into(),
        });
        self
    }

    /// Add a filter from a `"FIELD:VALUE"` argument, typing the value by field.
    pub fn filter_arg(self, op: FilterOp, arg: &str) -> Result<Self> {
        let (name, raw) = arg.split_once(':').ok_or_else(|| CatalogError::InvalidQuery {
            message: format!("expected FIELD:VALUE, got '{arg}'"),
        })?;
        let field = PortalField::from_name(name)?;
        let value = field.parse_value(raw)?;
        Ok(self.filter(field, op, value))
    }

    pub fn order_by(mut self, field: PortalField, order: SortOrder) -> Self {
        self.order.push((field, order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn group_by(mut self, field: PortalField) -> Self {
        self.group_by.push(field);
        self
    }

    /// Human readable summary of the filters and limit.
    pub fn constraints(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .filters
            .iter()
            .map(|f| format!("{} {} {}", f.field.name(), f.op.sql(), f.value))
            .collect();
        if let Some(limit) = self.limit {
            out.push(format!("limit {limit}"));
        }
        out
    }

    /// `WHERE ... ORDER BY ... LIMIT ...` clause and its bound values.
    pub(crate) fn to_sql(&self) -> (String, Vec<&FieldValue>) {
        let mut conditions = Vec::new();
        let mut values = Vec::new();

        // Set membership filters gathered per field; BTreeMap keeps the SQL stable
        let mut sets: BTreeMap<(PortalField, bool), Vec<&FieldValue>> = BTreeMap::new();
        for filter in &self.filters {
            let column = filter.field.column();
            match filter.op {
                FilterOp::In | FilterOp::NotIn => sets
                    .entry((filter.field, filter.op == FilterOp::NotIn))
                    .or_default()
                    .push(&filter.value),
                // Unset fields count as not matching the pattern
                FilterOp::NotLike => {
                    conditions.push(format!("({column} IS NULL OR {column} NOT LIKE ?)"));
                    values.push(&filter.value);
                }
                op => {
                    conditions.push(format!("{column} {} ?", op.sql()));
                    values.push(&filter.value);
                }
            }
        }
        for ((field, negated), set) in sets {
            let column = field.column();
            let placeholders = vec!["?"; set.len()].join(", ");
            if negated {
                conditions.push(format!("({column} IS NULL OR {column} NOT IN ({placeholders}))"));
            } else {
                conditions.push(format!("{column} IN ({placeholders})"));
            }
            values.extend(set);
        }

        let mut sql = String::new();
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        let mut order: Vec<String> = self
            .order
            .iter()
            .map(|(field, dir)| {
                let dir = match dir {
                    SortOrder::Asc => "ASC",
                    SortOrder::Desc => "DESC",
                };
                format!("{} {dir}", field.column())
            })
            .collect();
        order.push("id ASC".to_string());
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        (sql, values)
    }
}

// ============================================================================
// Show
// ============================================================================

/// Portals sharing one combination of group-by values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalGroup {
    /// Group-by values joined with ", "; empty when not grouping
    pub key: String,
    pub portals: Vec<Portal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShowReport {
    pub total: usize,
    pub constraints: Vec<String>,
    /// Groups in order of their first portal in the listing
    pub groups: Vec<PortalGroup>,
}

/// Run `query` and group the matching portals.
pub fn show(store: &PortalStore, query: &PortalQuery) -> Result<ShowReport> {
    let portals = store.query_portals(query)?;
    let total = portals.len();

    let mut groups: Vec<PortalGroup> = Vec::new();
    for portal in portals {
        let key = query
            .group_by
            .iter()
            .map(|f| f.value_of(&portal))
            .collect::<Vec<_>>()
            .join(", ");
        match groups.iter_mut().find(|g| g.key == key) {
            Some(group) => group.portals.push(portal),
            None => groups.push(PortalGroup {
                key,
                portals: vec![portal],
            }),
        }
    }

    debug!(
        "[Query] {} portals in {} groups ({})",
        total,
        groups.len(),
        query.constraints().join(", ")
    );
    Ok(ShowReport {
        total,
        constraints: query.constraints(),
        groups,
    })
}
