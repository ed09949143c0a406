//! Point-in-time description of a scene, as handed to the model.

use serde::{Deserialize, Serialize};

/// Snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Text,
    Image,
    Rectangle,
    Circle,
    Triangle,
    Polygon,
    Path,
    Line,
    Group,
    Unknown,
}

impl ObjectKind {
    /// Map a rendering-engine type name onto a snapshot kind.
    pub fn from_engine_type(engine_type: &str) -> Self {
        match engine_type.to_ascii_lowercase().as_str() {
            "text" | "textbox" | "i-text" | "itext" => Self::Text,
            "image" => Self::Image,
            "rect" | "rectangle" => Self::Rectangle,
            "circle" | "ellipse" => Self::Circle,
            "triangle" => Self::Triangle,
            "polygon" | "polyline" => Self::Polygon,
            "path" => Self::Path,
            "line" => Self::Line,
            "group" | "activeselection" => Self::Group,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Rectangle => "rectangle",
            Self::Circle => "circle",
            Self::Triangle => "triangle",
            Self::Polygon => "polygon",
            Self::Path => "path",
            Self::Line => "line",
            Self::Group => "group",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_shape(self) -> bool {
        matches!(
            self,
            Self::Rectangle
                | Self::Circle
                | Self::Triangle
                | Self::Polygon
                | Self::Path
                | Self::Line
        )
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub w: i64,
    pub h: i64,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// One element of a snapshot. Rebuilt on every indexing pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneObject {
    pub id: String,
    pub kind: ObjectKind,
    pub position: Point,
    pub size: Size,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_degrees: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opacity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_width: Option<f64>,
    pub layer_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size_px: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_description: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_selected: bool,
}

impl SceneObject {
    /// Center of the element's bounding box.
    pub fn center(&self) -> (f64, f64) {
        (
            self.position.x as f64 + self.size.w as f64 / 2.0,
            self.position.y as f64 + self.size.h as f64 / 2.0,
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasInfo {
    pub width_px: i64,
    pub height_px: i64,
    pub background_color: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBudget {
    pub total: u32,
    pub used: u32,
    pub elements_tokens: u32,
    pub messages_tokens: u32,
    pub summary_tokens: u32,
}

/// Structured, size-estimated description of the scene.
///
/// `elements.len() == count` always holds; the summary is derived from
/// `elements` and `canvas` alone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneSnapshot {
    pub version: u32,
    pub timestamp_ms: i64,
    pub canvas: CanvasInfo,
    pub elements: Vec<SceneObject>,
    pub count: usize,
    pub summary: String,
    pub token_budget: TokenBudget,
}

impl SceneSnapshot {
    pub fn selected(&self) -> impl Iterator<Item = &SceneObject> {
        self.elements.iter().filter(|e| e.is_selected)
    }

    pub fn element(&self, id: &str) -> Option<&SceneObject> {
        self.elements.iter().find(|e| e.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}
