//! Element references and positions resolved against the live scene.
//!
//! Resolution is read-only. A query that matches nothing yields `None`; the
//! executor decides whether that is fatal for the action at hand.

use std::sync::LazyLock;

use regex::Regex;

use easel_core::actions::{ShapeKind, Target};
use easel_core::position::{place, PositionSpec, Rect};
use easel_core::scene::ObjectKind;

use crate::indexer::FALLBACK_WORKSPACE;
use crate::scene::{SceneHost, SceneNode};

/// Snapshot ids synthesized for nodes without one: `el_<layer>`.
static LAYER_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^el_(\d+)$").unwrap());

const IMPLICIT: [&str; 4] = ["selected", "it", "this", "selection"];

const FILLER: [&str; 10] = [
    "the", "a", "an", "text", "that", "says", "saying", "with", "element", "object",
];

/// Which rule produced a match. Logged, and handy in tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchedBy {
    Id,
    Implicit,
    Selection,
    Kind,
    Name,
    Text,
    Fallback,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Resolved {
    pub node: SceneNode,
    pub matched_by: MatchedBy,
}

/// Resolve a free-text element reference.
///
/// Order: literal id, then `selected`/`it`/`this`, then a query that mentions
/// the selection, then kind words, then names, then text content, and finally
/// whatever is selected.
pub fn resolve(host: &dyn SceneHost, query: &str) -> Option<Resolved> {
    let objects = host.objects();
    let selection = host.selection();
    let raw = query.trim();
    let q = raw.to_lowercase();

    let found = |node: &SceneNode, matched_by| {
        Some(Resolved {
            node: node.clone(),
            matched_by,
        })
    };

    if let Some(node) = objects.iter().find(|n| n.id == raw) {
        return found(node, MatchedBy::Id);
    }
    if let Some(layer) = LAYER_ID
        .captures(&q)
        .and_then(|c| c[1].parse::<usize>().ok())
    {
        if let Some(node) = objects.get(layer).filter(|n| n.id.is_empty()) {
            return found(node, MatchedBy::Id);
        }
    }

    let selected: Vec<&SceneNode> = selection
        .iter()
        .filter_map(|id| objects.iter().find(|n| &n.id == id))
        .collect();

    if IMPLICIT.contains(&q.as_str()) {
        return selected.first().and_then(|n| found(n, MatchedBy::Implicit));
    }

    let words: Vec<&str> = q
        .split(|c: char| !c.is_alphanumeric() && c != '_' && c != '-')
        .filter(|w| !w.is_empty())
        .collect();
    let kind = words.iter().find_map(|w| kind_word(w));

    if words.iter().any(|w| IMPLICIT.contains(w)) && !selected.is_empty() {
        let pick = kind
            .and_then(|k| selected.iter().find(|n| n.kind() == k))
            .unwrap_or(&selected[0]);
        return found(pick, MatchedBy::Selection);
    }

    let phrase = words
        .iter()
        .filter(|w| !FILLER.contains(w) && kind_word(w).is_none())
        .copied()
        .collect::<Vec<_>>()
        .join(" ");

    if let Some(kind) = kind {
        let of_kind: Vec<&SceneNode> = objects.iter().filter(|n| n.kind() == kind).collect();
        let pick = of_kind
            .iter()
            .rev()
            .find(|n| !phrase.is_empty() && mentions(n, &phrase))
            .or_else(|| of_kind.iter().find(|n| selection.contains(&n.id)))
            .or_else(|| of_kind.last());
        if let Some(node) = pick {
            return found(node, MatchedBy::Kind);
        }
    }

    let named = |exact: bool| {
        objects.iter().rev().find(|n| {
            n.name.as_deref().is_some_and(|name| {
                let name = name.to_lowercase();
                if exact {
                    name == q
                } else {
                    !q.is_empty() && !name.is_empty() && (name.contains(&q) || q.contains(&name))
                }
            })
        })
    };
    if let Some(node) = named(true).or_else(|| named(false)) {
        return found(node, MatchedBy::Name);
    }

    let phrase = phrase.trim_matches(|c| c == '"' || c == '\'');
    if !phrase.is_empty() {
        if let Some(node) = objects.iter().rev().find(|n| mentions(n, phrase) || mentions(n, &q)) {
            return found(node, MatchedBy::Text);
        }
    }

    selected.first().and_then(|n| found(n, MatchedBy::Fallback))
}

/// Resolve a target to every node it covers: all selected nodes for an
/// implicit reference, otherwise at most one.
pub fn resolve_all(host: &dyn SceneHost, target: &Target) -> Vec<SceneNode> {
    if target.is_implicit() {
        let selection = host.selection();
        let nodes: Vec<SceneNode> = selection.iter().filter_map(|id| host.node(id)).collect();
        return nodes;
    }
    resolve(host, target.as_query()).map(|r| r.node).into_iter().collect()
}

fn mentions(node: &SceneNode, phrase: &str) -> bool {
    node.text
        .as_deref()
        .is_some_and(|t| t.to_lowercase().contains(phrase))
}

/// Map a word onto the snapshot kind it names.
pub fn kind_word(word: &str) -> Option<ObjectKind> {
    let kind = match word {
        "text" | "textbox" | "label" | "title" | "heading" | "caption" => ObjectKind::Text,
        "image" | "picture" | "photo" | "img" | "pic" => ObjectKind::Image,
        "group" => ObjectKind::Group,
        "path" => ObjectKind::Path,
        "polygon" => ObjectKind::Polygon,
        _ => match ShapeKind::parse(word.trim_end_matches('s'))? {
            ShapeKind::Rectangle | ShapeKind::Diamond => ObjectKind::Rectangle,
            ShapeKind::Circle => ObjectKind::Circle,
            ShapeKind::Triangle => ObjectKind::Triangle,
            ShapeKind::Line => ObjectKind::Line,
            ShapeKind::Heart => ObjectKind::Path,
            _ => ObjectKind::Polygon,
        },
    };
    Some(kind)
}

/// The workspace rectangle, or the fallback area when the scene has none.
pub fn workspace_area(host: &dyn SceneHost) -> Rect {
    host.workspace()
        .map(|ws| ws.bounds)
        .unwrap_or_else(|| Rect::new(0.0, 0.0, FALLBACK_WORKSPACE.0, FALLBACK_WORKSPACE.1))
}

/// Top-left corner for an element of rendered size `w`×`h`.
pub fn resolve_position(
    host: &dyn SceneHost,
    spec: PositionSpec,
    w: f64,
    h: f64,
    margin_ratio: f64,
) -> (f64, f64) {
    place(spec, &workspace_area(host), w, h, margin_ratio)
}
