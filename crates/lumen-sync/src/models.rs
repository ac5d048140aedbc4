//! Data models for LumenCanvas projects
//!
//! Defines the replicated entity types: Surface, Scene, Layer, and Asset.
//! These models are designed to live in Automerge maps for CRDT-based sync,
//! so every type serializes to the camelCase JSON shape the editor uses.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// The four replicated entity collections of a project document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Surfaces,
    Scenes,
    Layers,
    Assets,
}

impl EntityKind {
    /// All kinds, in document map order.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Surfaces,
        EntityKind::Scenes,
        EntityKind::Layers,
        EntityKind::Assets,
    ];

    /// The top-level map name this kind is stored under.
    pub fn map_name(&self) -> &'static str {
        match self {
            EntityKind::Surfaces => "surfaces",
            EntityKind::Scenes => "scenes",
            EntityKind::Layers => "layers",
            EntityKind::Assets => "assets",
        }
    }

    /// Stable index into per-kind tables (flags, map ids).
    pub fn index(&self) -> usize {
        match self {
            EntityKind::Surfaces => 0,
            EntityKind::Scenes => 1,
            EntityKind::Layers => 2,
            EntityKind::Assets => 3,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.map_name())
    }
}

/// A corner of a surface's warp quad, in normalized output coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WarpPoint {
    pub x: f64,
    pub y: f64,
}

/// A 2D vector used by layer transforms.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

/// Position/scale/rotation of a layer within its surface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Transform {
    pub position: Vec2,
    pub scale: Vec2,
    pub rotation: f64,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec2 { x: 0.0, y: 0.0 },
            scale: Vec2 { x: 1.0, y: 1.0 },
            rotation: 0.0,
        }
    }
}

/// How a layer composites over the layers beneath it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BlendMode {
    Normal,
    Add,
    Multiply,
    Screen,
    Overlay,
    Custom,
}

/// What kind of content a layer renders.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LayerType {
    Media,
    Shader,
    Html,
    Group,
    Plugin,
}

/// Media category of an imported asset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Image,
    Video,
    Audio,
    Shader,
    Html,
    Other,
}

/// A projection surface: a warped quad on the physical output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Surface {
    /// Unique identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// The four warp corners, clockwise from top-left
    pub quad: [WarpPoint; 4],
    /// Layer currently assigned to this surface, if any
    pub assigned_layer_id: Option<String>,
    /// Whether the surface renders
    pub visible: bool,
    /// Creation time, epoch milliseconds
    pub created_at: i64,
    /// Last update time, epoch milliseconds
    pub updated_at: i64,
}

impl Surface {
    /// Create a new surface covering the full output.
    pub fn new(name: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            quad: [
                WarpPoint { x: 0.0, y: 0.0 },
                WarpPoint { x: 1.0, y: 0.0 },
                WarpPoint { x: 1.0, y: 1.0 },
                WarpPoint { x: 0.0, y: 1.0 },
            ],
            assigned_layer_id: None,
            visible: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Assign a layer to this surface.
    pub fn assign_layer(&mut self, layer_id: Option<String>) {
        self.assigned_layer_id = layer_id;
        self.touch();
    }

    /// Move a warp corner.
    pub fn set_corner(&mut self, index: usize, point: WarpPoint) {
        if index < 4 {
            self.quad[index] = point;
            self.touch();
        }
    }

    fn touch(&mut self) {
        self.updated_at = now_ms();
    }
}

/// A named arrangement of layers with per-surface assignments
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    /// Unique identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Ordered layer ids, back to front
    pub layer_ids: Vec<String>,
    /// surface id -> layer id assignments active in this scene
    pub surface_assignments: BTreeMap<String, String>,
    /// Crossfade duration when switching to this scene
    pub crossfade_duration_ms: u64,
    /// Optional trigger hotkey (key code)
    pub hotkey: Option<u8>,
    /// Creation time, epoch milliseconds
    pub created_at: i64,
    /// Last update time, epoch milliseconds
    pub updated_at: i64,
}

impl Scene {
    pub fn new(name: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            layer_ids: Vec::new(),
            surface_assignments: BTreeMap::new(),
            crossfade_duration_ms: 500,
            hotkey: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a layer to the scene's stack if not already present.
    pub fn add_layer(&mut self, layer_id: impl Into<String>) {
        let layer_id = layer_id.into();
        if !self.layer_ids.contains(&layer_id) {
            self.layer_ids.push(layer_id);
            self.touch();
        }
    }

    /// Remove a layer from the stack and any assignment referencing it.
    pub fn remove_layer(&mut self, layer_id: &str) {
        if let Some(pos) = self.layer_ids.iter().position(|l| l == layer_id) {
            self.layer_ids.remove(pos);
            self.surface_assignments.retain(|_, l| l != layer_id);
            self.touch();
        }
    }

    fn touch(&mut self) {
        self.updated_at = now_ms();
    }
}

/// A renderable layer: media, shader, HTML, group, or plugin content
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Layer {
    /// Unique identifier
    pub id: String,
    /// Content kind
    #[serde(rename = "type")]
    pub layer_type: LayerType,
    /// Display name
    pub name: String,
    /// Backing asset for media layers
    pub asset_id: Option<String>,
    /// GLSL source for shader layers
    pub shader_code: Option<String>,
    /// Markup for HTML layers
    pub html_code: Option<String>,
    /// Opacity in [0, 1]
    pub opacity: f64,
    /// Composite mode
    pub blend_mode: BlendMode,
    /// Placement within the surface
    pub transform: Transform,
    /// Whether the layer renders
    pub visible: bool,
    /// Stacking order, higher is in front
    pub z_index: i64,
    /// Creation time, epoch milliseconds
    pub created_at: i64,
    /// Last update time, epoch milliseconds
    pub updated_at: i64,
}

impl Layer {
    pub fn new(layer_type: LayerType, name: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4().to_string(),
            layer_type,
            name: name.into(),
            asset_id: None,
            shader_code: None,
            html_code: None,
            opacity: 1.0,
            blend_mode: BlendMode::Normal,
            transform: Transform::default(),
            visible: true,
            z_index: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the backing asset (media layers).
    pub fn set_asset(&mut self, asset_id: Option<String>) {
        self.asset_id = asset_id;
        self.touch();
    }

    /// Set opacity, clamped to [0, 1].
    pub fn set_opacity(&mut self, opacity: f64) {
        self.opacity = opacity.clamp(0.0, 1.0);
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = now_ms();
    }
}

/// An imported media asset referenced by layers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    /// Unique identifier
    pub id: String,
    /// Media category
    #[serde(rename = "type")]
    pub asset_type: AssetType,
    /// Display name (usually the original filename)
    pub name: String,
    /// Where the bytes live (file path or remote URL)
    pub url: String,
    /// Optional preview image
    pub thumbnail_url: Option<String>,
    /// Size in bytes
    pub size: u64,
    /// Creation time, epoch milliseconds
    pub created_at: i64,
    /// Last update time, epoch milliseconds
    pub updated_at: i64,
}

impl Asset {
    pub fn new(asset_type: AssetType, name: impl Into<String>, url: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4().to_string(),
            asset_type,
            name: name.into(),
            url: url.into(),
            thumbnail_url: None,
            size: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Any replicated entity, tagged with its kind.
///
/// This is the shape stored in the document maps: self-describing, so a
/// reader can always tell which collection a value belongs in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Entity {
    Surface(Surface),
    Scene(Scene),
    Layer(Layer),
    Asset(Asset),
}

impl Entity {
    /// The collection this entity belongs in.
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Surface(_) => EntityKind::Surfaces,
            Entity::Scene(_) => EntityKind::Scenes,
            Entity::Layer(_) => EntityKind::Layers,
            Entity::Asset(_) => EntityKind::Assets,
        }
    }

    /// The entity's id (the key it is stored under).
    pub fn id(&self) -> &str {
        match self {
            Entity::Surface(s) => &s.id,
            Entity::Scene(s) => &s.id,
            Entity::Layer(l) => &l.id,
            Entity::Asset(a) => &a.id,
        }
    }
}

impl From<Surface> for Entity {
    fn from(s: Surface) -> Self {
        Entity::Surface(s)
    }
}

impl From<Scene> for Entity {
    fn from(s: Scene) -> Self {
        Entity::Scene(s)
    }
}

impl From<Layer> for Entity {
    fn from(l: Layer) -> Self {
        Entity::Layer(l)
    }
}

impl From<Asset> for Entity {
    fn from(a: Asset) -> Self {
        Entity::Asset(a)
    }
}

/// Current time as epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_new() {
        let surface = Surface::new("Wall Left");
        assert_eq!(surface.name, "Wall Left");
        assert!(surface.visible);
        assert!(surface.assigned_layer_id.is_none());
        assert_eq!(surface.quad[0], WarpPoint { x: 0.0, y: 0.0 });
        assert_eq!(surface.quad[2], WarpPoint { x: 1.0, y: 1.0 });
    }

    #[test]
    fn test_surface_set_corner() {
        let mut surface = Surface::new("Wall");
        surface.set_corner(1, WarpPoint { x: 0.9, y: 0.1 });
        assert_eq!(surface.quad[1], WarpPoint { x: 0.9, y: 0.1 });

        // Out-of-range corner is ignored
        surface.set_corner(7, WarpPoint { x: 0.5, y: 0.5 });
        assert_eq!(surface.quad.len(), 4);
    }

    #[test]
    fn test_scene_layers() {
        let mut scene = Scene::new("Intro");
        scene.add_layer("layer-a");
        scene.add_layer("layer-b");
        assert_eq!(scene.layer_ids, vec!["layer-a", "layer-b"]);

        // Adding duplicate should not add again
        scene.add_layer("layer-a");
        assert_eq!(scene.layer_ids.len(), 2);

        scene
            .surface_assignments
            .insert("surface-1".to_string(), "layer-a".to_string());
        scene.remove_layer("layer-a");
        assert_eq!(scene.layer_ids, vec!["layer-b"]);
        assert!(scene.surface_assignments.is_empty());
    }

    #[test]
    fn test_layer_opacity_clamped() {
        let mut layer = Layer::new(LayerType::Media, "Clip 1");
        layer.set_opacity(1.5);
        assert_eq!(layer.opacity, 1.0);
        layer.set_opacity(-0.2);
        assert_eq!(layer.opacity, 0.0);
    }

    #[test]
    fn test_entity_kind_and_id() {
        let layer = Layer::new(LayerType::Shader, "Plasma");
        let id = layer.id.clone();
        let entity: Entity = layer.into();
        assert_eq!(entity.kind(), EntityKind::Layers);
        assert_eq!(entity.id(), id);
    }

    #[test]
    fn test_entity_serialization_shape() {
        let asset = Asset::new(AssetType::Video, "loop.mp4", "file:///clips/loop.mp4");
        let entity: Entity = asset.clone().into();
        let value = serde_json::to_value(&entity).unwrap();
        assert_eq!(value["kind"], "asset");
        assert_eq!(value["type"], "video");
        assert_eq!(value["name"], "loop.mp4");
        // camelCase field names on the wire
        assert!(value.get("createdAt").is_some());
        assert!(value.get("thumbnailUrl").is_some());

        let back: Entity = serde_json::from_value(value).unwrap();
        assert_eq!(back, Entity::Asset(asset));
    }

    #[test]
    fn test_entity_roundtrip_all_kinds() {
        let entities: Vec<Entity> = vec![
            Surface::new("S").into(),
            Scene::new("Sc").into(),
            Layer::new(LayerType::Html, "H").into(),
            Asset::new(AssetType::Image, "img.png", "file:///img.png").into(),
        ];
        for entity in entities {
            let json = serde_json::to_string(&entity).unwrap();
            let back: Entity = serde_json::from_str(&json).unwrap();
            assert_eq!(entity, back);
        }
    }

    #[test]
    fn test_kind_map_names() {
        let names: Vec<&str> = EntityKind::ALL.iter().map(|k| k.map_name()).collect();
        assert_eq!(names, vec!["surfaces", "scenes", "layers", "assets"]);
        for (i, kind) in EntityKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }
}
