//! The live scene as seen by the engine.
//!
//! [`SceneHost`] is the seam to the rendering engine: everything the indexer
//! reads and the executor mutates goes through it. Geometry is in scene units;
//! a node's rendered size is its intrinsic size times its scale.

pub mod memory;

use async_trait::async_trait;
use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use easel_core::actions::LayerMove;
use easel_core::position::Rect;
use easel_core::scene::ObjectKind;

pub use memory::InMemoryScene;

/// Name of the object that marks the workspace rectangle.
pub const WORKSPACE_MARKER: &str = "clip";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HostError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("workspace not found")]
    NoWorkspace,

    #[error("image load failed: {0}")]
    Image(String),

    #[error("persist failed: {0}")]
    Persist(String),

    #[error("rejected: {0}")]
    Rejected(String),
}

/// A fill or stroke value.
///
/// Serialized as a plain color string for solid paints, `null` for none, and
/// `{"type": "gradient" | "pattern" | "complex"}` otherwise.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Paint {
    #[default]
    None,
    Solid(String),
    Gradient,
    Pattern,
    Complex,
}

impl Paint {
    pub fn solid(color: impl Into<String>) -> Self {
        let color = color.into();
        match color.trim() {
            "" | "none" | "transparent" => Self::None,
            _ => Self::Solid(color),
        }
    }

    /// Symbolic value for prompts: the color itself, or a category name.
    pub fn symbolic(&self) -> &str {
        match self {
            Self::None => "none",
            Self::Solid(c) => c,
            Self::Gradient => "gradient",
            Self::Pattern => "pattern",
            Self::Complex => "complex",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => Self::None,
            Value::String(s) => Self::solid(s.clone()),
            Value::Object(map) => match map.get("type").and_then(Value::as_str) {
                Some("gradient" | "linear" | "radial") => Self::Gradient,
                Some("pattern") => Self::Pattern,
                _ if map.contains_key("colorStops") => Self::Gradient,
                _ if map.contains_key("source") => Self::Pattern,
                _ => Self::Complex,
            },
            _ => Self::Complex,
        }
    }
}

impl Serialize for Paint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::None => serializer.serialize_none(),
            Self::Solid(c) => serializer.serialize_str(c),
            other => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("type", other.symbolic())?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Paint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Self::from_value(&value))
    }
}

fn one() -> f64 {
    1.0
}

fn yes() -> bool {
    true
}

/// An object of the rendering engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneNode {
    #[serde(default)]
    pub id: String,
    /// Engine type name, e.g. `rect`, `textbox`, `image`.
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub left: f64,
    #[serde(default)]
    pub top: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default = "one")]
    pub scale_x: f64,
    #[serde(default = "one")]
    pub scale_y: f64,
    #[serde(default)]
    pub angle: f64,
    #[serde(default = "one")]
    pub opacity: f64,
    #[serde(default)]
    pub fill: Paint,
    #[serde(default)]
    pub stroke: Paint,
    #[serde(default)]
    pub stroke_width: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corner_radius: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_weight: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_align: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default = "yes")]
    pub visible: bool,
    #[serde(default = "yes")]
    pub selectable: bool,
    #[serde(default = "yes")]
    pub evented: bool,
}

impl SceneNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            name: None,
            left: 0.0,
            top: 0.0,
            width: 0.0,
            height: 0.0,
            scale_x: 1.0,
            scale_y: 1.0,
            angle: 0.0,
            opacity: 1.0,
            fill: Paint::None,
            stroke: Paint::None,
            stroke_width: 0.0,
            corner_radius: None,
            text: None,
            font_size: None,
            font_family: None,
            font_weight: None,
            text_align: None,
            src: None,
            visible: true,
            selectable: true,
            evented: true,
        }
    }

    pub fn at(mut self, left: f64, top: f64) -> Self {
        self.left = left;
        self.top = top;
        self
    }

    pub fn sized(mut self, width: f64, height: f64) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn kind(&self) -> ObjectKind {
        ObjectKind::from_engine_type(&self.node_type)
    }

    pub fn is_workspace(&self) -> bool {
        self.name.as_deref() == Some(WORKSPACE_MARKER)
    }

    pub fn rendered_width(&self) -> f64 {
        self.width * self.scale_x
    }

    pub fn rendered_height(&self) -> f64 {
        self.height * self.scale_y
    }

    pub fn bounds(&self) -> Rect {
        Rect::new(self.left, self.top, self.rendered_width(), self.rendered_height())
    }
}

/// A partial update of a node. Unset fields are left alone.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodePatch {
    pub left: Option<f64>,
    pub top: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub scale_x: Option<f64>,
    pub scale_y: Option<f64>,
    pub angle: Option<f64>,
    pub opacity: Option<f64>,
    pub fill: Option<Paint>,
    pub stroke: Option<Paint>,
    pub stroke_width: Option<f64>,
    pub corner_radius: Option<f64>,
    pub text: Option<String>,
    pub font_size: Option<f64>,
    pub font_family: Option<String>,
    pub font_weight: Option<Value>,
    pub text_align: Option<String>,
    pub visible: Option<bool>,
    pub selectable: Option<bool>,
    pub evented: Option<bool>,
}

impl NodePatch {
    pub fn position(left: f64, top: f64) -> Self {
        Self {
            left: Some(left),
            top: Some(top),
            ..Self::default()
        }
    }

    pub fn interactive(on: bool) -> Self {
        Self {
            selectable: Some(on),
            evented: Some(on),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply(&self, node: &mut SceneNode) {
        macro_rules! set {
            ($($field:ident),*) => {
                $(if let Some(v) = &self.$field { node.$field = v.clone(); })*
            };
        }
        set!(left, top, width, height, scale_x, scale_y, angle, opacity);
        set!(fill, stroke, stroke_width);
        set!(visible, selectable, evented);
        if let Some(r) = self.corner_radius {
            node.corner_radius = Some(r);
        }
        if let Some(t) = &self.text {
            node.text = Some(t.clone());
        }
        if let Some(s) = self.font_size {
            node.font_size = Some(s);
        }
        if let Some(f) = &self.font_family {
            node.font_family = Some(f.clone());
        }
        if let Some(w) = &self.font_weight {
            node.font_weight = Some(w.clone());
        }
        if let Some(a) = &self.text_align {
            node.text_align = Some(a.clone());
        }
    }
}

/// The workspace rectangle and its fill.
#[derive(Clone, Debug, PartialEq)]
pub struct Workspace {
    pub bounds: Rect,
    pub fill: Paint,
}

/// Intrinsic size of a loaded image.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub width: f64,
    pub height: f64,
}

/// Query and mutation primitives of the rendering engine.
///
/// Implementations are driven from one task at a time; `&mut self` on every
/// mutation keeps it that way.
#[async_trait]
pub trait SceneHost: Send {
    /// Objects bottom to top, without the workspace marker.
    fn objects(&self) -> Vec<SceneNode>;

    fn node(&self, id: &str) -> Option<SceneNode>;

    fn workspace(&self) -> Option<Workspace>;

    /// Scene-wide background, used when there is no workspace object.
    fn background(&self) -> Paint;

    fn set_background(&mut self, paint: Paint);

    fn set_workspace_fill(&mut self, paint: Paint) -> Result<(), HostError>;

    /// Ids of the active selection; several for a multi-select.
    fn selection(&self) -> Vec<String>;

    fn set_selection(&mut self, ids: &[String]);

    fn add(&mut self, node: SceneNode) -> Result<(), HostError>;

    fn remove(&mut self, id: &str) -> Result<SceneNode, HostError>;

    fn update(&mut self, id: &str, patch: &NodePatch) -> Result<(), HostError>;

    /// Restack a node. The workspace marker always stays at the bottom.
    fn move_layer(&mut self, id: &str, mv: LayerMove) -> Result<(), HostError>;

    /// Notify listeners (autosave and the like) that a node changed.
    fn fire_modified(&mut self, id: &str);

    fn request_render(&mut self);

    /// Host save hook, awaited after every mutating action.
    async fn persist(&mut self) -> Result<(), HostError>;

    async fn load_image(&mut self, url: &str) -> Result<ImageInfo, HostError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn paint_from_engine_values() {
        let cases = [
            (json!(null), Paint::None),
            (json!("transparent"), Paint::None),
            (json!("#ff0000"), Paint::Solid("#ff0000".into())),
            (json!({"type": "linear", "colorStops": []}), Paint::Gradient),
            (json!({"source": "img.png", "repeat": "repeat"}), Paint::Pattern),
            (json!({"weird": true}), Paint::Complex),
        ];
        for (value, expected) in cases {
            let paint: Paint = serde_json::from_value(value.clone()).unwrap();
            assert_eq!(paint, expected, "for {value}");
        }
    }

    #[test]
    fn node_defaults_from_minimal_json() {
        let node: SceneNode =
            serde_json::from_value(json!({"id": "a", "type": "rect", "width": 10, "height": 20}))
                .unwrap();
        assert_eq!(node.scale_x, 1.0);
        assert_eq!(node.opacity, 1.0);
        assert!(node.selectable && node.evented && node.visible);
        assert_eq!(node.kind(), ObjectKind::Rectangle);
    }

    #[test]
    fn patch_only_touches_set_fields() {
        let mut node = SceneNode::new("a", "rect").at(5.0, 5.0).sized(10.0, 10.0);
        NodePatch {
            fill: Some(Paint::solid("#000")),
            scale_x: Some(2.0),
            ..NodePatch::default()
        }
        .apply(&mut node);
        assert_eq!(node.fill, Paint::Solid("#000".into()));
        assert_eq!(node.rendered_width(), 20.0);
        assert_eq!(node.left, 5.0);
    }
}
