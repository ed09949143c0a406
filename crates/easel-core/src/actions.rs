//! Scene mutation instructions.
//!
//! The parser emits [`ActionDescriptor`]s carrying the raw JSON payload so they
//! can be persisted and displayed as-is. The executor converts each one into a
//! typed [`Action`] with [`ActionDescriptor::to_action`]; that conversion is the
//! single place payloads are validated.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::ids::ActionId;
use crate::position::PositionSpec;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Error,
}

impl ActionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for ActionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown action status: {other}")),
        }
    }
}

/// The `type` tag of an action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionKind {
    CreateShape,
    AddText,
    MoveElement,
    ModifyElement,
    ResizeElement,
    DeleteElement,
    SelectElement,
    AddImage,
    ChangeBackground,
    SearchImages,
    AskClarification,
    ChangeLayerOrder,
    DuplicateElement,
}

impl ActionKind {
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        let kind = match normalized.as_str() {
            "create_shape" | "spawn_shape" | "add_shape" => Self::CreateShape,
            "add_text" | "create_text" => Self::AddText,
            "move_element" => Self::MoveElement,
            "modify_element" | "update_element" => Self::ModifyElement,
            "resize_element" => Self::ResizeElement,
            "delete_element" | "remove_element" => Self::DeleteElement,
            "select_element" => Self::SelectElement,
            "add_image" | "add_image_to_canvas" => Self::AddImage,
            "change_background" | "change_canvas_background" => Self::ChangeBackground,
            "search_images" => Self::SearchImages,
            "ask_clarification" => Self::AskClarification,
            "change_layer_order" | "reorder_element" => Self::ChangeLayerOrder,
            "duplicate_element" => Self::DuplicateElement,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateShape => "create_shape",
            Self::AddText => "add_text",
            Self::MoveElement => "move_element",
            Self::ModifyElement => "modify_element",
            Self::ResizeElement => "resize_element",
            Self::DeleteElement => "delete_element",
            Self::SelectElement => "select_element",
            Self::AddImage => "add_image",
            Self::ChangeBackground => "change_background",
            Self::SearchImages => "search_images",
            Self::AskClarification => "ask_clarification",
            Self::ChangeLayerOrder => "change_layer_order",
            Self::DuplicateElement => "duplicate_element",
        }
    }

    pub fn is_mutating(self) -> bool {
        !matches!(self, Self::AskClarification | Self::SelectElement)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PayloadError {
    #[error("unsupported action type: {0}")]
    UnknownType(String),
    #[error("invalid {action} payload: {reason}")]
    Invalid { action: &'static str, reason: String },
}

/// An action as emitted by a parser, before validation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub id: ActionId,
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub status: ActionStatus,
}

impl ActionDescriptor {
    pub fn new(
        action_type: impl Into<String>,
        payload: Value,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: ActionId::new(),
            action_type: action_type.into(),
            description: description.into(),
            payload,
            status: ActionStatus::Pending,
        }
    }

    /// Build a descriptor from one element of a response's `actions` array.
    ///
    /// Accepts both `{"type", "payload": {...}}` and the flat form where the
    /// payload fields sit next to `type`. Returns `None` without a string `type`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let action_type = obj.get("type")?.as_str()?.trim();
        if action_type.is_empty() {
            return None;
        }
        let description = obj
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let payload = match obj.get("payload") {
            Some(p) => p.clone(),
            None => {
                let rest: Map<String, Value> = obj
                    .iter()
                    .filter(|(k, _)| {
                        !matches!(k.as_str(), "type" | "description" | "id" | "status")
                    })
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Value::Object(rest)
            }
        };
        Some(Self::new(action_type, payload, description))
    }

    pub fn kind(&self) -> Option<ActionKind> {
        ActionKind::parse(&self.action_type)
    }

    /// Structural equality: same type, payload and description, ignoring id and status.
    pub fn same_content(&self, other: &Self) -> bool {
        let same_type = match (self.kind(), other.kind()) {
            (Some(a), Some(b)) => a == b,
            _ => self.action_type == other.action_type,
        };
        same_type && self.payload == other.payload && self.description == other.description
    }

    /// Validate the payload and produce the typed action.
    pub fn to_action(&self) -> Result<Action, PayloadError> {
        let kind = self
            .kind()
            .ok_or_else(|| PayloadError::UnknownType(self.action_type.clone()))?;
        Action::from_payload(kind, &self.payload)
    }
}

/// A validated action, one payload shape per variant.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    CreateShape(CreateShape),
    AddText(AddText),
    MoveElement(MoveElement),
    ModifyElement(ModifyElement),
    ResizeElement(ResizeElement),
    DeleteElement(Target),
    SelectElement(Target),
    AddImage(AddImage),
    ChangeBackground(ChangeBackground),
    SearchImages(SearchImages),
    AskClarification(AskClarification),
    ChangeLayerOrder(ChangeLayerOrder),
    DuplicateElement(DuplicateElement),
}

impl Action {
    pub fn from_payload(kind: ActionKind, payload: &Value) -> Result<Self, PayloadError> {
        let mut fields = match payload {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(PayloadError::Invalid {
                    action: kind.as_str(),
                    reason: format!("payload must be an object, got {other}"),
                })
            }
        };
        // `{shapeType, options: {...}}` and similar nest the real fields one level down.
        if matches!(fields.get("options"), Some(Value::Object(_))) {
            if let Some(Value::Object(options)) = fields.remove("options") {
                for (k, v) in options {
                    fields.entry(k).or_insert(v);
                }
            }
        }
        if kind == ActionKind::ModifyElement && !fields.contains_key("properties") {
            let props: Map<String, Value> = fields
                .iter()
                .filter(|(k, _)| !Target::FIELDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            fields.insert("properties".into(), Value::Object(props));
        }
        let value = Value::Object(fields);

        fn decode<T: serde::de::DeserializeOwned>(
            kind: ActionKind,
            value: Value,
        ) -> Result<T, PayloadError> {
            serde_json::from_value(value).map_err(|e| PayloadError::Invalid {
                action: kind.as_str(),
                reason: e.to_string(),
            })
        }

        Ok(match kind {
            ActionKind::CreateShape => Self::CreateShape(decode(kind, value)?),
            ActionKind::AddText => Self::AddText(decode(kind, value)?),
            ActionKind::MoveElement => Self::MoveElement(decode(kind, value)?),
            ActionKind::ModifyElement => Self::ModifyElement(decode(kind, value)?),
            ActionKind::ResizeElement => Self::ResizeElement(decode(kind, value)?),
            ActionKind::DeleteElement => Self::DeleteElement(decode(kind, value)?),
            ActionKind::SelectElement => Self::SelectElement(decode(kind, value)?),
            ActionKind::AddImage => Self::AddImage(decode(kind, value)?),
            ActionKind::ChangeBackground => Self::ChangeBackground(decode(kind, value)?),
            ActionKind::SearchImages => Self::SearchImages(decode(kind, value)?),
            ActionKind::AskClarification => Self::AskClarification(decode(kind, value)?),
            ActionKind::ChangeLayerOrder => Self::ChangeLayerOrder(decode(kind, value)?),
            ActionKind::DuplicateElement => Self::DuplicateElement(decode(kind, value)?),
        })
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Self::CreateShape(_) => ActionKind::CreateShape,
            Self::AddText(_) => ActionKind::AddText,
            Self::MoveElement(_) => ActionKind::MoveElement,
            Self::ModifyElement(_) => ActionKind::ModifyElement,
            Self::ResizeElement(_) => ActionKind::ResizeElement,
            Self::DeleteElement(_) => ActionKind::DeleteElement,
            Self::SelectElement(_) => ActionKind::SelectElement,
            Self::AddImage(_) => ActionKind::AddImage,
            Self::ChangeBackground(_) => ActionKind::ChangeBackground,
            Self::SearchImages(_) => ActionKind::SearchImages,
            Self::AskClarification(_) => ActionKind::AskClarification,
            Self::ChangeLayerOrder(_) => ActionKind::ChangeLayerOrder,
            Self::DuplicateElement(_) => ActionKind::DuplicateElement,
        }
    }

    /// The element reference, for actions that target an existing element.
    pub fn target(&self) -> Option<&Target> {
        match self {
            Self::MoveElement(a) => Some(&a.target),
            Self::ModifyElement(a) => Some(&a.target),
            Self::ResizeElement(a) => Some(&a.target),
            Self::DeleteElement(t) | Self::SelectElement(t) => Some(t),
            Self::ChangeLayerOrder(a) => Some(&a.target),
            Self::DuplicateElement(a) => Some(&a.target),
            _ => None,
        }
    }
}

/// Accepts numbers and numeric strings.
fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) => s
            .trim()
            .trim_end_matches("px")
            .trim_end_matches('%')
            .parse::<f64>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("not a number: {s}"))),
        Some(other) => Err(serde::de::Error::custom(format!("not a number: {other}"))),
    }
}

/// Reference to an existing element: an explicit id or a free-text query.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(default, alias = "query", alias = "target", alias = "element")]
    pub element_query: Option<String>,
    #[serde(default, alias = "id", alias = "objectId")]
    pub element_id: Option<String>,
}

impl Target {
    const FIELDS: [&'static str; 7] = [
        "elementQuery",
        "query",
        "target",
        "element",
        "elementId",
        "id",
        "objectId",
    ];

    pub fn selected() -> Self {
        Self {
            element_query: Some("selected".into()),
            element_id: None,
        }
    }

    pub fn query(text: impl Into<String>) -> Self {
        Self {
            element_query: Some(text.into()),
            element_id: None,
        }
    }

    /// The text to resolve: the id when given, else the query, else `selected`.
    pub fn as_query(&self) -> &str {
        self.element_id
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or(self.element_query.as_deref().filter(|s| !s.trim().is_empty()))
            .unwrap_or("selected")
    }

    /// True when the reference means "whatever is selected".
    pub fn is_implicit(&self) -> bool {
        matches!(
            self.as_query().trim().to_ascii_lowercase().as_str(),
            "selected" | "it" | "this" | "selection"
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShapeKind {
    Rectangle,
    Circle,
    Triangle,
    Diamond,
    Star,
    Hexagon,
    Pentagon,
    Octagon,
    Heart,
    Line,
    Arrow,
}

impl ShapeKind {
    pub fn parse(raw: &str) -> Option<Self> {
        let kind = match raw.trim().to_ascii_lowercase().as_str() {
            "rect" | "rectangle" | "square" | "box" => Self::Rectangle,
            "circle" | "oval" | "ellipse" | "round" => Self::Circle,
            "triangle" | "tri" => Self::Triangle,
            "diamond" | "rhombus" => Self::Diamond,
            "star" => Self::Star,
            "hexagon" | "hex" => Self::Hexagon,
            "pentagon" | "pent" => Self::Pentagon,
            "octagon" | "oct" => Self::Octagon,
            "heart" => Self::Heart,
            "line" => Self::Line,
            "arrow" => Self::Arrow,
            _ => return None,
        };
        Some(kind)
    }

    pub const ALL: [ShapeKind; 11] = [
        Self::Rectangle,
        Self::Circle,
        Self::Triangle,
        Self::Diamond,
        Self::Star,
        Self::Hexagon,
        Self::Pentagon,
        Self::Octagon,
        Self::Heart,
        Self::Line,
        Self::Arrow,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rectangle => "rectangle",
            Self::Circle => "circle",
            Self::Triangle => "triangle",
            Self::Diamond => "diamond",
            Self::Star => "star",
            Self::Hexagon => "hexagon",
            Self::Pentagon => "pentagon",
            Self::Octagon => "octagon",
            Self::Heart => "heart",
            Self::Line => "line",
            Self::Arrow => "arrow",
        }
    }
}

impl Serialize for ShapeKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ShapeKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("unknown shape: {raw}")))
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateShape {
    #[serde(alias = "shapeType", alias = "shape", alias = "type")]
    pub kind: ShapeKind,
    #[serde(default, alias = "color")]
    pub fill: Option<String>,
    #[serde(default, alias = "border", alias = "borderColor")]
    pub stroke: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64", alias = "borderWidth")]
    pub stroke_width: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub width: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub height: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", alias = "size")]
    pub radius: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", alias = "rx", alias = "borderRadius")]
    pub corner_radius: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub opacity: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", alias = "rotation")]
    pub angle: Option<f64>,
    #[serde(default)]
    pub position: Option<PositionSpec>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddText {
    #[serde(default, alias = "content")]
    pub text: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub font_size: Option<f64>,
    #[serde(default, alias = "font")]
    pub font_family: Option<String>,
    #[serde(default, alias = "color")]
    pub fill: Option<String>,
    #[serde(default)]
    pub font_weight: Option<Value>,
    #[serde(default)]
    pub text_align: Option<String>,
    #[serde(default)]
    pub position: Option<PositionSpec>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveElement {
    #[serde(flatten)]
    pub target: Target,
    #[serde(alias = "to", alias = "destination")]
    pub position: PositionSpec,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyElement {
    #[serde(flatten)]
    pub target: Target,
    #[serde(default, alias = "changes", alias = "props")]
    pub properties: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeElement {
    #[serde(flatten)]
    pub target: Target,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub width: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub height: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", alias = "scaleFactor")]
    pub scale: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub increase_by: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub decrease_by: Option<f64>,
}

/// The one sizing instruction a resize carries, in precedence order.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ResizeDirective {
    Scale(f64),
    IncreaseBy(f64),
    DecreaseBy(f64),
    Dimensions { width: Option<f64>, height: Option<f64> },
}

impl ResizeElement {
    /// Scale wins over increase-by, which wins over decrease-by, which wins
    /// over explicit dimensions.
    pub fn directive(&self) -> Result<ResizeDirective, PayloadError> {
        if let Some(s) = self.scale {
            return if s > 0.0 && s.is_finite() {
                Ok(ResizeDirective::Scale(s))
            } else {
                Err(PayloadError::Invalid {
                    action: "resize_element",
                    reason: format!("scale must be positive, got {s}"),
                })
            };
        }
        if let Some(by) = self.increase_by {
            return Ok(ResizeDirective::IncreaseBy(by.abs()));
        }
        if let Some(by) = self.decrease_by {
            return Ok(ResizeDirective::DecreaseBy(by.abs()));
        }
        if self.width.is_some() || self.height.is_some() {
            return Ok(ResizeDirective::Dimensions {
                width: self.width,
                height: self.height,
            });
        }
        Err(PayloadError::Invalid {
            action: "resize_element",
            reason: "no width, height, scale, increaseBy or decreaseBy given".into(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddImage {
    #[serde(alias = "imageUrl", alias = "src")]
    pub url: String,
    #[serde(default)]
    pub position: Option<PositionSpec>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub width: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub height: Option<f64>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeBackground {
    #[serde(alias = "fill", alias = "background", alias = "backgroundColor")]
    pub color: String,
}

fn default_search_count() -> usize {
    1
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchImages {
    #[serde(alias = "searchQuery", alias = "keywords")]
    pub query: String,
    #[serde(default = "default_search_count", alias = "limit")]
    pub count: usize,
    #[serde(default)]
    pub position: Option<PositionSpec>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskClarification {
    #[serde(alias = "message")]
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerMove {
    BringForward,
    SendBackward,
    BringToFront,
    SendToBack,
}

impl LayerMove {
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        let mv = match normalized.as_str() {
            "bring_forward" | "forward" | "up" => Self::BringForward,
            "send_backward" | "backward" | "back" | "down" => Self::SendBackward,
            "bring_to_front" | "front" | "top" => Self::BringToFront,
            "send_to_back" | "bottom" => Self::SendToBack,
            _ => return None,
        };
        Some(mv)
    }
}

impl<'de> Deserialize<'de> for LayerMove {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown layer order: {raw}")))
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLayerOrder {
    #[serde(flatten)]
    pub target: Target,
    #[serde(alias = "order", alias = "direction", alias = "operation")]
    pub action: LayerMove,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateElement {
    #[serde(flatten)]
    pub target: Target,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub offset_x: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub offset_y: Option<f64>,
}
