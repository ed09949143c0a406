//! Scene snapshot indexing.
//!
//! [`SceneIndexer::index`] is a pure read of the host: it never mutates the
//! scene. The only state it keeps is the image reference table, so the same
//! image URL maps to the same `img_N` token for the lifetime of the indexer.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use regex::Regex;
use serde_json::json;

use easel_core::clock::Clock;
use easel_core::position::Rect;
use easel_core::scene::{
    CanvasInfo, ObjectKind, Point, SceneObject, SceneSnapshot, Size, TokenBudget, SNAPSHOT_VERSION,
};
use easel_core::tokens::{estimate_json_tokens, estimate_tokens};

use crate::scene::{SceneHost, SceneNode};

/// Workspace assumed when the scene has none.
pub const FALLBACK_WORKSPACE: (f64, f64) = (500.0, 500.0);
pub const FALLBACK_BACKGROUND: &str = "#ffffff";

/// Fixed overhead added to a snapshot's token total for its envelope.
pub const SNAPSHOT_METADATA_TOKENS: u32 = 50;

const TEXT_LIMIT: usize = 100;
/// Radius of the center zone as a fraction of the canvas diagonal.
const CENTER_ZONE_RATIO: f64 = 0.2;

static IMAGE_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)/([^/]+)\.(jpg|jpeg|png|gif|webp|svg)").unwrap());

pub struct SceneIndexer {
    clock: Arc<dyn Clock>,
    image_refs: Mutex<HashMap<String, String>>,
}

impl SceneIndexer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            image_refs: Mutex::new(HashMap::new()),
        }
    }

    /// Describe the scene. Positions are relative to the workspace's top-left corner.
    pub fn index(&self, host: &dyn SceneHost) -> SceneSnapshot {
        let (area, background) = match host.workspace() {
            Some(ws) => (ws.bounds, ws.fill.symbolic().to_string()),
            None => {
                let bg = host.background();
                let bg = if bg.is_none() {
                    FALLBACK_BACKGROUND.to_string()
                } else {
                    bg.symbolic().to_string()
                };
                (Rect::new(0.0, 0.0, FALLBACK_WORKSPACE.0, FALLBACK_WORKSPACE.1), bg)
            }
        };

        let selection = host.selection();
        let elements: Vec<SceneObject> = host
            .objects()
            .iter()
            .enumerate()
            .map(|(layer, node)| {
                let id = if node.id.is_empty() {
                    format!("el_{layer}")
                } else {
                    node.id.clone()
                };
                let selected = selection.contains(&id);
                self.object(node, id, layer, selected, &area)
            })
            .collect();

        let canvas = CanvasInfo {
            width_px: area.width.round() as i64,
            height_px: area.height.round() as i64,
            background_color: background,
        };
        let summary = summarize(&elements, &canvas);
        let token_budget = snapshot_budget(&elements, &summary);

        SceneSnapshot {
            version: SNAPSHOT_VERSION,
            timestamp_ms: self.clock.now_ms(),
            count: elements.len(),
            canvas,
            elements,
            summary,
            token_budget,
        }
    }

    /// Reference token for an image URL, assigned on first sight.
    pub fn image_ref(&self, src: &str) -> String {
        let mut refs = self.image_refs.lock();
        let next = refs.len() + 1;
        refs.entry(src.to_string())
            .or_insert_with(|| format!("img_{next}"))
            .clone()
    }

    pub fn reset_image_refs(&self) {
        self.image_refs.lock().clear();
    }

    fn object(
        &self,
        node: &SceneNode,
        id: String,
        layer: usize,
        selected: bool,
        area: &Rect,
    ) -> SceneObject {
        let kind = node.kind();
        let mut obj = SceneObject {
            id,
            kind,
            position: Point {
                x: (node.left - area.left).round() as i64,
                y: (node.top - area.top).round() as i64,
            },
            size: Size {
                w: node.rendered_width().round() as i64,
                h: node.rendered_height().round() as i64,
            },
            rotation_degrees: (node.angle != 0.0).then(|| node.angle.round() as i64),
            opacity: (node.opacity != 1.0).then(|| (node.opacity * 100.0).round() / 100.0),
            fill_color: (!node.fill.is_none()).then(|| node.fill.symbolic().to_string()),
            stroke_color: (!node.stroke.is_none()).then(|| node.stroke.symbolic().to_string()),
            stroke_width: (node.stroke_width > 0.0).then_some(node.stroke_width),
            layer_index: layer,
            name: node.name.clone().filter(|n| !n.is_empty()),
            text_content: None,
            font_family: None,
            font_size_px: None,
            image_ref: None,
            image_description: None,
            is_selected: selected,
        };

        match kind {
            ObjectKind::Text => {
                obj.text_content = node
                    .text
                    .as_deref()
                    .filter(|t| !t.is_empty())
                    .map(|t| t.chars().take(TEXT_LIMIT).collect());
                obj.font_family = node.font_family.clone();
                obj.font_size_px = node.font_size.filter(|s| *s > 0.0).map(|s| s.round() as i64);
            }
            ObjectKind::Image => {
                if let Some(src) = node.src.as_deref().filter(|s| !s.is_empty()) {
                    obj.image_ref = Some(self.image_ref(src));
                    obj.image_description = Some(describe_image(src));
                }
            }
            _ => {}
        }
        obj
    }
}

/// Short human description of an image source.
pub fn describe_image(src: &str) -> String {
    if src.is_empty() {
        return "unknown".into();
    }
    if src.starts_with("data:") {
        return "generated_by_ai".into();
    }
    if let Some(caps) = IMAGE_FILE.captures(src) {
        return caps[1].replace(['-', '_'], " ").chars().take(30).collect();
    }
    if src.contains("cloudinary") {
        "cloud_image".into()
    } else if src.contains("unsplash") {
        "unsplash_image".into()
    } else {
        "external_image".into()
    }
}

fn snapshot_budget(elements: &[SceneObject], summary: &str) -> TokenBudget {
    let elements_tokens: u32 = elements.iter().map(estimate_json_tokens).sum();
    let summary_tokens = estimate_tokens(summary);
    let used = elements_tokens + summary_tokens;
    TokenBudget {
        total: used + SNAPSHOT_METADATA_TOKENS,
        used,
        elements_tokens,
        messages_tokens: 0,
        summary_tokens,
    }
}

fn plural(n: usize, word: &str) -> String {
    if n == 1 {
        format!("{n} {word}")
    } else {
        format!("{n} {word}s")
    }
}

#[derive(Default)]
struct Zones {
    center: usize,
    top_left: usize,
    top_right: usize,
    bottom_left: usize,
    bottom_right: usize,
}

/// Natural-language description derived from the elements and canvas alone.
pub fn summarize(elements: &[SceneObject], canvas: &CanvasInfo) -> String {
    let (w, h, bg) = (canvas.width_px, canvas.height_px, &canvas.background_color);
    if elements.is_empty() {
        return format!("Empty canvas ({w}x{h}px, bg: {bg})");
    }

    let mut parts = vec![format!("Canvas: {w}x{h}px, background {bg}")];

    let selected: Vec<String> = elements
        .iter()
        .filter(|e| e.is_selected)
        .map(|e| {
            if let Some(text) = &e.text_content {
                format!("text \"{}\"", text.chars().take(20).collect::<String>())
            } else if e.image_ref.is_some() {
                format!("image ({})", e.image_description.as_deref().unwrap_or("unknown"))
            } else {
                e.kind.to_string()
            }
        })
        .collect();
    if !selected.is_empty() {
        parts.push(format!("Selected: {}", selected.join(", ")));
    }

    let texts: Vec<&SceneObject> = elements.iter().filter(|e| e.kind == ObjectKind::Text).collect();
    if !texts.is_empty() {
        let previews: Vec<String> = texts
            .iter()
            .take(3)
            .map(|e| {
                let t: String = e.text_content.as_deref().unwrap_or("").chars().take(25).collect();
                format!("\"{t}...\"")
            })
            .collect();
        parts.push(format!("{}: {}", plural(texts.len(), "text element"), previews.join(", ")));
    }

    let images: Vec<&str> = elements
        .iter()
        .filter(|e| e.kind == ObjectKind::Image)
        .map(|e| e.image_description.as_deref().unwrap_or("unknown"))
        .collect();
    if !images.is_empty() {
        parts.push(format!("{} ({})", plural(images.len(), "image"), images.join(", ")));
    }

    // first-seen order
    let mut shapes: Vec<(ObjectKind, usize)> = Vec::new();
    for e in elements.iter().filter(|e| e.kind.is_shape()) {
        match shapes.iter_mut().find(|(k, _)| *k == e.kind) {
            Some((_, n)) => *n += 1,
            None => shapes.push((e.kind, 1)),
        }
    }
    if !shapes.is_empty() {
        let desc: Vec<String> = shapes.iter().map(|(k, n)| plural(*n, k.as_str())).collect();
        parts.push(format!("Shapes: {}", desc.join(", ")));
    }

    let zones = zone_counts(elements, w as f64, h as f64);
    let layout: Vec<String> = [
        (zones.center, "centered"),
        (zones.top_left, "top-left"),
        (zones.top_right, "top-right"),
        (zones.bottom_left, "bottom-left"),
        (zones.bottom_right, "bottom-right"),
    ]
    .iter()
    .filter(|(n, _)| *n > 0)
    .map(|(n, label)| format!("{n} {label}"))
    .collect();
    if !layout.is_empty() {
        parts.push(format!("Layout: {}", layout.join(", ")));
    }

    parts.join(". ")
}

fn zone_counts(elements: &[SceneObject], width: f64, height: f64) -> Zones {
    let (cx, cy) = (width / 2.0, height / 2.0);
    let radius = width.hypot(height) * CENTER_ZONE_RATIO;
    let mut zones = Zones::default();
    for e in elements {
        let (ex, ey) = e.center();
        if (ex - cx).hypot(ey - cy) < radius {
            zones.center += 1;
        } else if ex < cx && ey < cy {
            zones.top_left += 1;
        } else if ey < cy {
            zones.top_right += 1;
        } else if ex < cx {
            zones.bottom_left += 1;
        } else {
            zones.bottom_right += 1;
        }
    }
    zones
}

/// Look an element up by id, name, kind or text, falling back to the selection.
pub fn find_element<'a>(snapshot: &'a SceneSnapshot, query: &str) -> Option<&'a SceneObject> {
    let q = query.trim().to_lowercase();
    let els = &snapshot.elements;
    els.iter()
        .find(|e| e.id.to_lowercase() == q)
        .or_else(|| els.iter().find(|e| e.name.as_deref().is_some_and(|n| n.to_lowercase() == q)))
        .or_else(|| els.iter().find(|e| e.kind.as_str() == q))
        .or_else(|| {
            els.iter().find(|e| {
                e.text_content
                    .as_deref()
                    .is_some_and(|t| t.to_lowercase().contains(&q))
            })
        })
        .or_else(|| els.iter().find(|e| e.is_selected))
}

/// Compact JSON rendering of a snapshot for short prompts.
pub fn render_minimal(snapshot: &SceneSnapshot) -> String {
    let elements: Vec<serde_json::Value> = snapshot
        .elements
        .iter()
        .map(|e| {
            let mut v = json!({
                "id": e.id,
                "kind": e.kind,
                "pos": format!("{},{}", e.position.x, e.position.y),
            });
            if let Some(text) = &e.text_content {
                v["text"] = json!(text.chars().take(30).collect::<String>());
            }
            if let Some(img) = &e.image_ref {
                v["img"] = json!(img);
            }
            if e.is_selected {
                v["sel"] = json!(true);
            }
            v
        })
        .collect();
    json!({
        "canvas": snapshot.canvas,
        "summary": snapshot.summary,
        "elementCount": snapshot.count,
        "elements": elements,
    })
    .to_string()
}
