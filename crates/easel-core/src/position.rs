//! Layout presets and placement math.

use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

/// Margin ratio for ordinary placement: 5% of the smaller workspace dimension.
pub const DEFAULT_MARGIN_RATIO: f64 = 0.05;
/// Margin ratio used when placing image-search results: 10%.
pub const SEARCH_MARGIN_RATIO: f64 = 0.10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PositionPreset {
    TopLeft,
    TopCenter,
    TopRight,
    MiddleLeft,
    Center,
    MiddleRight,
    BottomLeft,
    BottomCenter,
    BottomRight,
}

impl PositionPreset {
    pub const ALL: [PositionPreset; 9] = [
        Self::Center,
        Self::TopLeft,
        Self::TopCenter,
        Self::TopRight,
        Self::MiddleLeft,
        Self::MiddleRight,
        Self::BottomLeft,
        Self::BottomCenter,
        Self::BottomRight,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TopLeft => "top-left",
            Self::TopCenter => "top-center",
            Self::TopRight => "top-right",
            Self::MiddleLeft => "middle-left",
            Self::Center => "center",
            Self::MiddleRight => "middle-right",
            Self::BottomLeft => "bottom-left",
            Self::BottomCenter => "bottom-center",
            Self::BottomRight => "bottom-right",
        }
    }

    /// Parse a preset name, accepting the usual spellings
    /// (`top left`, `top_left`, `topleft`, `upper-left`, `middle`, `top`, ...).
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized: String = raw
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c == ' ' || c == '_' { '-' } else { c })
            .collect();
        let preset = match normalized.as_str() {
            "center" | "centre" | "middle" | "centered" | "middle-center" | "center-center" => {
                Self::Center
            }
            "top-left" | "topleft" | "upper-left" | "left-top" => Self::TopLeft,
            "top-center" | "topcenter" | "top" | "top-middle" | "upper-center" => Self::TopCenter,
            "top-right" | "topright" | "upper-right" | "right-top" => Self::TopRight,
            "middle-left" | "middleleft" | "left" | "center-left" | "left-center" => {
                Self::MiddleLeft
            }
            "middle-right" | "middleright" | "right" | "center-right" | "right-center" => {
                Self::MiddleRight
            }
            "bottom-left" | "bottomleft" | "lower-left" | "left-bottom" => Self::BottomLeft,
            "bottom-center" | "bottomcenter" | "bottom" | "bottom-middle" | "lower-center" => {
                Self::BottomCenter
            }
            "bottom-right" | "bottomright" | "lower-right" | "right-bottom" => Self::BottomRight,
            _ => return None,
        };
        Some(preset)
    }
}

impl std::fmt::Display for PositionPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where to put an element: a named preset or coordinates relative to the
/// workspace's top-left corner.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PositionSpec {
    Preset(PositionPreset),
    Point { x: f64, y: f64 },
}

impl Default for PositionSpec {
    fn default() -> Self {
        Self::Preset(PositionPreset::Center)
    }
}

impl Serialize for PositionSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Preset(p) => serializer.serialize_str(p.as_str()),
            Self::Point { x, y } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("x", x)?;
                map.serialize_entry("y", y)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for PositionSpec {
    /// Unknown preset names fall back to center; malformed shapes are errors.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match &value {
            serde_json::Value::String(s) => Ok(Self::Preset(
                PositionPreset::parse(s).unwrap_or(PositionPreset::Center),
            )),
            serde_json::Value::Object(map) => {
                let x = map.get("x").and_then(serde_json::Value::as_f64);
                let y = map.get("y").and_then(serde_json::Value::as_f64);
                match (x, y) {
                    (Some(x), Some(y)) => Ok(Self::Point { x, y }),
                    _ => Err(de::Error::custom("position object needs numeric x and y")),
                }
            }
            other => Err(de::Error::custom(format!("unsupported position: {other}"))),
        }
    }
}

/// Axis-aligned rectangle in scene coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(left: f64, top: f64, width: f64, height: f64) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn right(&self) -> f64 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }

    pub fn center(&self) -> (f64, f64) {
        (self.left + self.width / 2.0, self.top + self.height / 2.0)
    }

    pub fn margin(&self, ratio: f64) -> f64 {
        self.width.min(self.height) * ratio
    }
}

/// Top-left coordinate for an element of rendered size `w`×`h` placed at
/// `spec` inside `area`.
pub fn place(spec: PositionSpec, area: &Rect, w: f64, h: f64, margin_ratio: f64) -> (f64, f64) {
    let preset = match spec {
        PositionSpec::Point { x, y } => return (area.left + x, area.top + y),
        PositionSpec::Preset(p) => p,
    };
    let m = area.margin(margin_ratio);
    let left = area.left + m;
    let h_center = area.left + area.width / 2.0 - w / 2.0;
    let right = area.right() - w - m;
    let top = area.top + m;
    let v_center = area.top + area.height / 2.0 - h / 2.0;
    let bottom = area.bottom() - h - m;

    match preset {
        PositionPreset::TopLeft => (left, top),
        PositionPreset::TopCenter => (h_center, top),
        PositionPreset::TopRight => (right, top),
        PositionPreset::MiddleLeft => (left, v_center),
        PositionPreset::Center => (h_center, v_center),
        PositionPreset::MiddleRight => (right, v_center),
        PositionPreset::BottomLeft => (left, bottom),
        PositionPreset::BottomCenter => (h_center, bottom),
        PositionPreset::BottomRight => (right, bottom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_aliases() {
        assert_eq!(PositionPreset::parse("Top Left"), Some(PositionPreset::TopLeft));
        assert_eq!(PositionPreset::parse("bottom_right"), Some(PositionPreset::BottomRight));
        assert_eq!(PositionPreset::parse("middle"), Some(PositionPreset::Center));
        assert_eq!(PositionPreset::parse("upper-right"), Some(PositionPreset::TopRight));
        assert_eq!(PositionPreset::parse("somewhere"), None);
    }

    #[test]
    fn deserialize_variants() {
        let p: PositionSpec = serde_json::from_str("\"top-right\"").unwrap();
        assert_eq!(p, PositionSpec::Preset(PositionPreset::TopRight));

        let p: PositionSpec = serde_json::from_str("\"nowhere\"").unwrap();
        assert_eq!(p, PositionSpec::Preset(PositionPreset::Center));

        let p: PositionSpec = serde_json::from_str(r#"{"x": 10, "y": 20.5}"#).unwrap();
        assert_eq!(p, PositionSpec::Point { x: 10.0, y: 20.5 });

        assert!(serde_json::from_str::<PositionSpec>(r#"{"x": 1}"#).is_err());
        assert!(serde_json::from_str::<PositionSpec>("42").is_err());
    }

    #[test]
    fn serializes_back_to_wire_shape() {
        let p = PositionSpec::Preset(PositionPreset::BottomCenter);
        assert_eq!(serde_json::to_string(&p).unwrap(), "\"bottom-center\"");
    }

    #[test]
    fn center_places_element_center_on_area_center() {
        let area = Rect::new(0.0, 0.0, 900.0, 1200.0);
        let (x, y) = place(PositionSpec::default(), &area, 100.0, 100.0, DEFAULT_MARGIN_RATIO);
        assert_eq!((x + 50.0, y + 50.0), area.center());
    }

    #[test]
    fn corners_respect_margin() {
        let area = Rect::new(100.0, 50.0, 400.0, 200.0);
        // 5% of 200
        let (x, y) = place(
            PositionSpec::Preset(PositionPreset::TopLeft),
            &area,
            20.0,
            20.0,
            DEFAULT_MARGIN_RATIO,
        );
        assert_eq!((x, y), (110.0, 60.0));

        let (x, y) = place(
            PositionSpec::Preset(PositionPreset::BottomRight),
            &area,
            20.0,
            20.0,
            SEARCH_MARGIN_RATIO,
        );
        assert_eq!((x, y), (500.0 - 20.0 - 20.0, 250.0 - 20.0 - 20.0));
    }

    #[test]
    fn explicit_point_is_workspace_relative() {
        let area = Rect::new(30.0, 40.0, 400.0, 400.0);
        let (x, y) = place(PositionSpec::Point { x: 5.0, y: 6.0 }, &area, 10.0, 10.0, 0.05);
        assert_eq!((x, y), (35.0, 46.0));
    }
}
