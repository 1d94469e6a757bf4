//! Layout engine: 2D positions for a discovered component, plus per-profile
//! saved arrangements that override the default radial placement.

use std::collections::{HashMap, HashSet};
use std::f64::consts::PI;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::config::LayoutConfig;
use crate::db::Db;
use crate::discovery::Component;
use crate::error::{KingraphError, Result};
use crate::identity::{profile_exists, Profile};
use crate::store::RelationshipEdge;
use crate::vocab::RelationshipKind;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const ORIGIN: Point = Point { x: 0.0, y: 0.0 };

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Pan offset and zoom of the saved view.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    pub zoom: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self { x: 0.0, y: 0.0, zoom: 1.0 }
    }
}

/// One node of a saved arrangement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedNode {
    pub id: String,
    pub position: Point,
    /// Client-owned display data, stored verbatim.
    #[serde(default)]
    pub data: serde_json::Value,
}

/// A profile's saved arrangement of its family graph.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LayoutSnapshot {
    pub nodes: Vec<SavedNode>,
    #[serde(default)]
    pub viewport: Viewport,
}

impl LayoutSnapshot {
    fn validate(&self) -> Result<()> {
        if !(self.viewport.zoom.is_finite() && self.viewport.zoom > 0.0)
            || !self.viewport.x.is_finite()
            || !self.viewport.y.is_finite()
        {
            return Err(KingraphError::InvalidInput(
                "viewport needs a finite pan offset and a positive zoom".to_string(),
            ));
        }
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !node.position.is_finite() {
                return Err(KingraphError::InvalidInput(format!(
                    "node {} has a non-finite position",
                    node.id
                )));
            }
            if !ids.insert(node.id.as_str()) {
                return Err(KingraphError::InvalidInput(format!("node {} appears twice", node.id)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeData {
    pub label: String,
    pub portrait_url: Option<String>,
    pub is_seed: bool,
    /// Shares an edge with the seed.
    pub is_direct: bool,
    pub is_placeholder: bool,
    /// Display data carried over from the saved snapshot, if any.
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub saved: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionedNode {
    pub id: String,
    pub position: Point,
    pub data: NodeData,
}

/// Edge as drawn: ascending kinds are flipped so the elder is the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub kind: RelationshipKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionedGraph {
    pub seed: String,
    pub nodes: Vec<PositionedNode>,
    pub edges: Vec<DisplayEdge>,
    pub viewport: Viewport,
    pub truncated: bool,
}

/// Display orientation of a stored edge.
pub fn orient(edge: &RelationshipEdge) -> DisplayEdge {
    let (source, target) = if edge.kind.is_ascending() {
        (&edge.object_id, &edge.subject_id)
    } else {
        (&edge.subject_id, &edge.object_id)
    };
    DisplayEdge {
        id: edge.edge_id.clone(),
        source: source.clone(),
        target: target.clone(),
        kind: edge.kind,
    }
}

/// Seed first, then the remaining profiles in id order.
fn node_order(component: &Component) -> Vec<&str> {
    std::iter::once(component.seed.as_str())
        .chain(
            component
                .nodes
                .iter()
                .map(String::as_str)
                .filter(|id| *id != component.seed),
        )
        .collect()
}

/// Default arrangement: seed at the origin, everyone else on one circle.
///
/// The radius grows with the node count so larger families spread out; a
/// node's angle is proportional to its index in the seed-first ordering.
pub fn radial_positions(component: &Component, config: &LayoutConfig) -> Vec<(String, Point)> {
    let order = node_order(component);
    let count = order.len();
    let radius = config.base_radius + config.radius_step * count as f64;

    order
        .into_iter()
        .enumerate()
        .map(|(index, id)| {
            if index == 0 {
                return (id.to_string(), Point::ORIGIN);
            }
            let angle = 2.0 * PI * index as f64 / count as f64;
            (id.to_string(), Point { x: angle.cos() * radius, y: angle.sin() * radius })
        })
        .collect()
}

/// Position a discovered component, overlaying a saved snapshot by node id.
///
/// Saved nodes that were not discovered are dropped; discovered nodes the
/// snapshot does not know fall back to their radial position.
pub fn arrange(
    component: &Component,
    profiles: &[Profile],
    snapshot: Option<&LayoutSnapshot>,
    config: &LayoutConfig,
) -> PositionedGraph {
    let by_id: HashMap<&str, &Profile> = profiles.iter().map(|p| (p.profile_id.as_str(), p)).collect();
    let saved: HashMap<&str, &SavedNode> = snapshot
        .map(|s| s.nodes.iter().map(|n| (n.id.as_str(), n)).collect())
        .unwrap_or_default();
    let direct = component.direct_neighbors();

    let nodes = radial_positions(component, config)
        .into_iter()
        .map(|(id, default_position)| {
            let profile = by_id.get(id.as_str());
            let saved_node = saved.get(id.as_str());
            PositionedNode {
                position: saved_node.map(|n| n.position).unwrap_or(default_position),
                data: NodeData {
                    label: profile.map(|p| p.display_name.clone()).unwrap_or_else(|| id.clone()),
                    portrait_url: profile.and_then(|p| p.portrait_url.clone()),
                    is_seed: id == component.seed,
                    is_direct: direct.contains(id.as_str()),
                    is_placeholder: profile.map(|p| p.is_placeholder).unwrap_or(false),
                    saved: saved_node.map(|n| n.data.clone()).unwrap_or_default(),
                },
                id,
            }
        })
        .collect();

    PositionedGraph {
        seed: component.seed.clone(),
        nodes,
        edges: component.edges.iter().map(orient).collect(),
        viewport: snapshot.map(|s| s.viewport).unwrap_or_default(),
        truncated: component.truncated,
    }
}

/// Replace the profile's saved arrangement wholesale.
pub async fn save_layout(db: &Db, profile_id: &str, snapshot: &LayoutSnapshot) -> Result<()> {
    snapshot.validate()?;
    let json = serde_json::to_string(snapshot)?;
    let profile_id = profile_id.to_string();
    db.with_connection(move |conn| {
        if !profile_exists(conn, &profile_id)? {
            return Err(KingraphError::not_found("Profile", profile_id.clone()));
        }
        conn.execute(
            "INSERT INTO layout_snapshots (profile_id, snapshot_json, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(profile_id) DO UPDATE SET \
                snapshot_json = excluded.snapshot_json, \
                updated_at = excluded.updated_at",
            params![profile_id, json, Utc::now()],
        )?;
        log::debug!("Saved layout for {}", profile_id);
        Ok(())
    })
    .await
}

/// The profile's saved arrangement, if it has one.
pub async fn load_layout(db: &Db, profile_id: &str) -> Result<Option<LayoutSnapshot>> {
    let profile_id = profile_id.to_string();
    let json: Option<String> = db
        .with_connection(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT snapshot_json FROM layout_snapshots WHERE profile_id = ?1",
                    [&profile_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await?;
    json.map(|j| serde_json::from_str(&j).map_err(KingraphError::from))
        .transpose()
}
