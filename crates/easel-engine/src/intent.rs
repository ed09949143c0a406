//! Turning text into actions without the streaming path.
//!
//! [`HeuristicIntents`] reads a user instruction directly with regexes, for
//! simple commands that do not need a model round trip. [`ResponseIntents`]
//! reads a complete model response. Both implement [`IntentStrategy`], so a
//! caller can swap one for the other or run both.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Map, Value};

use easel_core::actions::{ActionDescriptor, ShapeKind};
use easel_core::position::{PositionPreset, PositionSpec};

use crate::parser::IncrementalParser;

/// Text in, actions out.
pub trait IntentStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn actions_for(&self, text: &str) -> Vec<ActionDescriptor>;
}

/// Runs the response parser over a full model response.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResponseIntents;

impl IntentStrategy for ResponseIntents {
    fn name(&self) -> &'static str {
        "response"
    }

    fn actions_for(&self, text: &str) -> Vec<ActionDescriptor> {
        let mut parser = IncrementalParser::new();
        parser.feed(text);
        parser.finish().actions
    }
}

const COLORS: [(&str, &str); 20] = [
    ("red", "#ef4444"),
    ("blue", "#3b82f6"),
    ("green", "#22c55e"),
    ("yellow", "#eab308"),
    ("orange", "#f97316"),
    ("purple", "#a855f7"),
    ("pink", "#ec4899"),
    ("black", "#000000"),
    ("white", "#ffffff"),
    ("gray", "#6b7280"),
    ("grey", "#6b7280"),
    ("cyan", "#06b6d4"),
    ("teal", "#14b8a6"),
    ("indigo", "#6366f1"),
    ("lime", "#84cc16"),
    ("amber", "#f59e0b"),
    ("emerald", "#10b981"),
    ("rose", "#f43f5e"),
    ("violet", "#8b5cf6"),
    ("sky", "#0ea5e9"),
];

const CLARIFY_MOVE: &str =
    "Where would you like me to move it? (e.g., center, top-left, bottom-right)";
const CLARIFY_OPTIONS: [&str; 5] = [
    "center",
    "top-left",
    "top-right",
    "bottom-left",
    "bottom-right",
];
/// Step used for "bigger"/"smaller" without a number.
const DEFAULT_STEP: u32 = 50;
const CREATE_VERBS: [&str; 11] = [
    "create", "add", "draw", "make", "spawn", "place", "put", "insert", "want", "need", "give",
];
/// Words after a verb that point at an existing element instead of a new one.
const REFERENCES: [&str; 6] = ["the", "it", "this", "that", "its", "them"];
/// Words a loose pattern can capture where an element reference belongs.
const NOT_TARGETS: [&str; 13] = [
    "it", "this", "that", "a", "an", "color", "colour", "fill", "border", "stroke", "outline",
    "background", "size",
];

macro_rules! re {
    ($name:ident, $pattern:literal) => {
        static $name: LazyLock<Regex> = LazyLock::new(|| Regex::new($pattern).unwrap());
    };
}

re!(HEX, r"#(?:[0-9a-fA-F]{6}|[0-9a-fA-F]{3})\b");
re!(COORDS, r"(\d+)\s*,\s*(\d+)");
re!(DIMENSIONS, r"(?i)(\d+)\s*(?:x|by)\s*(\d+)");
re!(RADIUS, r"(?i)radius\s*(?:of\s*)?(\d+)");
re!(SINGLE_SIZE, r"(?i)\b(\d+)\s*(?:px|pixels?)?(?:\s+(?:wide|tall|big|large|small))?");
re!(
    MOVE,
    r"(?i)\b(?:move|put|place)\s+(?:the\s+)?(it|this|that|\w+)\b(?:\s+(?:to|at|in|on|into))?(?:\s+the)?\s*(.*)$"
);
re!(VAGUE_MOVE, r"(?i)\b(?:relocate|reposition)\b|\bput\s+(?:it|this|that)\s+somewhere\b");
re!(
    BORDER,
    r"(?i)\b(?:make|set|change)\s+(?:the\s+)?(?:(\w+)\s+)?(?:border|stroke|outline)\s+(?:to\s+)?(#?\w+)|\b(?:border|stroke|outline)\s+(?:of\s+)?(?:the\s+)?(?:(\w+)\s+)?(?:to\s+)?(#?\w+)"
);
re!(
    FILL,
    r"(?i)\b(?:make|set|change|color|colour|fill|paint)\s+(?:the\s+)?(?:(\w+)\s+)?(?:(?:color|colour|fill)\s+)?(?:to\s+)?(#?\w+)\s*$"
);
re!(OPACITY, r"(?i)\b(?:opacity|transparency)\s+(?:to\s+)?(\d+)");
re!(
    INCREASE,
    r"(?i)\b(?:increase|enlarge|grow|expand)\s+(?:the\s+)?(?:(\w+)\s+)?(?:size\s+)?(?:by\s+)?(\d+)"
);
re!(
    DECREASE,
    r"(?i)\b(?:decrease|shrink|reduce)\s+(?:the\s+)?(?:(\w+)\s+)?(?:size\s+)?(?:by\s+)?(\d+)"
);
re!(SCALE, r"(?i)\b(?:scale|resize)\s+(?:the\s+)?(?:(\w+)\s+)?(?:to\s+|by\s+)?(\d+(?:\.\d+)?)");
re!(
    SET_SIZE,
    r"(?i)\b(?:set|make|change)\s+(?:the\s+)?(?:(\w+)\s+)?(width|height|size)\s+(?:to\s+)?(\d+)"
);
re!(BIGGER, r"(?i)\b(?:bigger|larger|enlarge)\b");
re!(SMALLER, r"(?i)\b(?:smaller|shrink|reduce)\b");
re!(DELETE, r"(?i)\b(?:delete|remove|erase|clear|get\s+rid\s+of)\s+(?:the\s+)?(\w+)");

/// Regex detection of create, move, modify, resize and delete instructions.
///
/// A creation instruction stands alone: its color, size and position words
/// describe the new shape, so the other detectors are skipped.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicIntents;

impl IntentStrategy for HeuristicIntents {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn actions_for(&self, text: &str) -> Vec<ActionDescriptor> {
        if let Some(spawn) = detect_spawn(text) {
            return vec![spawn];
        }
        [detect_move(text), detect_modify(text), detect_resize(text), detect_delete(text)]
            .into_iter()
            .flatten()
            .collect()
    }
}

/// Named color or hex code anywhere in `text`.
pub fn parse_color(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower.split(|c: char| !c.is_alphanumeric()).collect();
    COLORS
        .iter()
        .find(|(name, _)| words.contains(name))
        .map(|(_, hex)| hex.to_string())
        .or_else(|| HEX.find(text).map(|m| m.as_str().to_string()))
}

/// First shape word in `text`.
pub fn parse_shape(text: &str) -> Option<ShapeKind> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .find_map(|w| ShapeKind::parse(w).or_else(|| ShapeKind::parse(w.strip_suffix('s')?)))
}

/// A preset (two-word spellings first) or `x, y` coordinates.
pub fn parse_position(text: &str) -> Option<PositionSpec> {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|w| !w.is_empty())
        .collect();
    let pair = words
        .windows(2)
        .find_map(|w| PositionPreset::parse(&format!("{} {}", w[0], w[1])));
    let single = || words.iter().find_map(|w| PositionPreset::parse(w));
    if let Some(preset) = pair.or_else(single) {
        return Some(PositionSpec::Preset(preset));
    }
    COORDS.captures(text).and_then(|c| {
        Some(PositionSpec::Point {
            x: c[1].parse().ok()?,
            y: c[2].parse().ok()?,
        })
    })
}

/// Size words: `W x H`, `radius N`, or a single plausible pixel count.
pub fn parse_size(text: &str) -> Map<String, Value> {
    let mut size = Map::new();
    if let Some(c) = DIMENSIONS.captures(text) {
        if let (Ok(w), Ok(h)) = (c[1].parse::<u32>(), c[2].parse::<u32>()) {
            size.insert("width".into(), json!(w));
            size.insert("height".into(), json!(h));
            return size;
        }
    }
    if let Some(r) = RADIUS.captures(text).and_then(|c| c[1].parse::<u32>().ok()) {
        size.insert("radius".into(), json!(r));
        return size;
    }
    if let Some(n) = SINGLE_SIZE
        .captures(text)
        .and_then(|c| c[1].parse::<u32>().ok())
        .filter(|n| *n > 10 && *n < 2000)
    {
        size.insert("width".into(), json!(n));
        size.insert("height".into(), json!(n));
    }
    size
}

fn target_of(word: Option<regex::Match<'_>>) -> String {
    target_of_text(word.map(|m| m.as_str().to_string()), "selected".to_string())
}

fn target_of_text(subject: Option<String>, current: String) -> String {
    match subject.map(|s| s.to_lowercase()) {
        Some(s) if !NOT_TARGETS.contains(&s.as_str()) => s,
        _ => current,
    }
}

/// A shape named shortly after a creation verb, as in "add a red circle".
/// "make the circle red" refers to an existing circle and does not count.
fn spawn_shape(text: &str) -> Option<ShapeKind> {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    words.iter().enumerate().find_map(|(i, w)| {
        if !CREATE_VERBS.contains(w) {
            return None;
        }
        let rest = &words[i + 1..];
        if rest.first().is_some_and(|next| REFERENCES.contains(next)) {
            return None;
        }
        rest.iter().take(8).find_map(|w| parse_shape(w))
    })
}

fn detect_spawn(text: &str) -> Option<ActionDescriptor> {
    let shape = spawn_shape(text)?;

    let mut payload = Map::new();
    payload.insert("shapeType".into(), json!(shape.as_str()));
    if let Some(fill) = parse_color(text) {
        payload.insert("fill".into(), json!(fill));
    }
    let coords_are_size = DIMENSIONS.is_match(text);
    let position = parse_position(text)
        .filter(|p| !(coords_are_size && matches!(p, PositionSpec::Point { .. })));
    if let Some(position) = position {
        payload.insert("position".into(), json!(position));
    }
    payload.extend(parse_size(text));
    Some(ActionDescriptor::new(
        "create_shape",
        Value::Object(payload),
        format!("Create {}", shape.as_str()),
    ))
}

fn detect_move(text: &str) -> Option<ActionDescriptor> {
    let global = parse_position(text);
    let (query, position) = match MOVE.captures(text) {
        Some(c) => {
            let query = target_of(c.get(1));
            let position = c.get(2).and_then(|m| parse_position(m.as_str())).or(global);
            (query, position)
        }
        None if VAGUE_MOVE.is_match(text) => ("selected".to_string(), global),
        None => return None,
    };
    match position {
        Some(position) => Some(ActionDescriptor::new(
            "move_element",
            json!({"elementQuery": query, "position": position}),
            format!("Move to {}", json!(position)),
        )),
        None => Some(ActionDescriptor::new(
            "ask_clarification",
            json!({"question": CLARIFY_MOVE, "options": CLARIFY_OPTIONS}),
            "Need position clarification",
        )),
    }
}

fn detect_modify(text: &str) -> Option<ActionDescriptor> {
    let mut properties = Map::new();
    let mut query = "selected".to_string();

    let colored = |c: &regex::Captures<'_>, subject: usize, value: usize| {
        let color = c
            .get(value)
            .and_then(|m| parse_color(m.as_str()))
            .or_else(|| parse_color(text))?;
        let subject = c.get(subject).filter(|m| parse_color(m.as_str()).is_none());
        Some((color, subject.map(|m| m.as_str().to_string())))
    };

    if let Some(c) = BORDER.captures(text) {
        let hit = if c.get(2).is_some() { colored(&c, 1, 2) } else { colored(&c, 3, 4) };
        if let Some((color, subject)) = hit {
            properties.insert("stroke".into(), json!(color));
            query = target_of_text(subject, query);
        }
    }
    if properties.is_empty() {
        if let Some((color, subject)) = FILL.captures(text).and_then(|c| colored(&c, 1, 2)) {
            properties.insert("fill".into(), json!(color));
            query = target_of_text(subject, query);
        }
    }
    if let Some(n) = OPACITY.captures(text).and_then(|c| c[1].parse::<f64>().ok()) {
        let opacity = if n > 1.0 { n / 100.0 } else { n };
        properties.insert("opacity".into(), json!(opacity));
    }
    if properties.is_empty() {
        return None;
    }
    Some(ActionDescriptor::new(
        "modify_element",
        json!({"elementQuery": query, "properties": properties}),
        "Modify element",
    ))
}

fn detect_resize(text: &str) -> Option<ActionDescriptor> {
    let resize = |c: &regex::Captures<'_>, fields: Value| {
        let mut payload = json!({"elementQuery": target_of(c.get(1))});
        if let (Value::Object(p), Value::Object(f)) = (&mut payload, fields) {
            p.extend(f);
        }
        ActionDescriptor::new("resize_element", payload, "Resize element")
    };

    if let Some(c) = INCREASE.captures(text) {
        let by: u32 = c[2].parse().ok()?;
        return Some(resize(&c, json!({"increaseBy": by})));
    }
    if let Some(c) = DECREASE.captures(text) {
        let by: u32 = c[2].parse().ok()?;
        return Some(resize(&c, json!({"decreaseBy": by})));
    }
    if let Some(c) = SCALE.captures(text) {
        let v: f64 = c[2].parse().ok()?;
        let scale = if v > 10.0 { v / 100.0 } else { v };
        return Some(resize(&c, json!({"scale": scale})));
    }
    if let Some(c) = SET_SIZE.captures(text) {
        let n: u32 = c[3].parse().ok()?;
        let fields = match &c[2].to_lowercase()[..] {
            "width" => json!({"width": n}),
            "height" => json!({"height": n}),
            _ => json!({"width": n, "height": n}),
        };
        return Some(resize(&c, fields));
    }
    let step = if BIGGER.is_match(text) {
        json!({"elementQuery": "selected", "increaseBy": DEFAULT_STEP})
    } else if SMALLER.is_match(text) {
        json!({"elementQuery": "selected", "decreaseBy": DEFAULT_STEP})
    } else {
        return None;
    };
    Some(ActionDescriptor::new("resize_element", step, "Resize element"))
}

fn detect_delete(text: &str) -> Option<ActionDescriptor> {
    let c = DELETE.captures(text)?;
    Some(ActionDescriptor::new(
        "delete_element",
        json!({"elementQuery": target_of(c.get(1))}),
        "Delete element",
    ))
}
