//! Token budgeting for the model context.
//!
//! A snapshot plus conversation history either fits under
//! `max_tokens - reserve_for_response_tokens` as-is, or is pruned category by
//! category until it does. Pruning only drops or shortens; it never invents.

use serde_json::json;
use tracing::debug;

use easel_core::messages::ConversationMessage;
use easel_core::scene::{SceneObject, SceneSnapshot, TokenBudget};
use easel_core::tokens::{estimate_json_tokens, estimate_tokens};

/// Tokens set aside for the context envelope.
pub const METADATA_RESERVE: u32 = 100;
/// Per-message cost on top of its content.
pub const MESSAGE_OVERHEAD: u32 = 10;
/// Most recent messages that are always kept.
pub const RECENT_KEEP: usize = 2;
/// Messages passed through when no pruning is needed.
pub const HISTORY_WINDOW: usize = 6;
/// Messages rendered into a pruned context.
pub const PRUNED_HISTORY_WINDOW: usize = 4;

const EARLIER_PREFIX: &str = "[earlier] ";
const ELLIPSIS: &str = "...";
const MIN_EARLIER_TOKENS: u32 = 50;
const EARLIER_SLACK: u32 = 20;
const MINIMAL_TEXT: usize = 20;

#[derive(Clone, Debug, PartialEq)]
pub struct BudgetConfig {
    pub max_tokens: u32,
    pub reserve_for_response_tokens: u32,
    pub message_weight: f64,
    pub element_weight: f64,
    pub summary_weight: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_tokens: 8000,
            reserve_for_response_tokens: 1000,
            message_weight: 0.4,
            element_weight: 0.35,
            summary_weight: 0.25,
        }
    }
}

impl BudgetConfig {
    /// Tokens available to the context: `max_tokens - reserve_for_response_tokens`.
    pub fn ceiling(&self) -> u32 {
        self.max_tokens.saturating_sub(self.reserve_for_response_tokens)
    }
}

/// Per-category token budgets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Allocation {
    pub messages: u32,
    pub elements: u32,
    pub summary: u32,
    pub metadata: u32,
}

impl Allocation {
    fn content(&self) -> u32 {
        self.messages + self.elements + self.summary
    }
}

/// A snapshot and history that fit the budget.
#[derive(Clone, Debug, PartialEq)]
pub struct PrunedContext {
    pub snapshot: SceneSnapshot,
    pub messages: Vec<ConversationMessage>,
    pub total_tokens: u32,
    pub was_pruned: bool,
}

pub fn message_tokens(message: &ConversationMessage) -> u32 {
    estimate_tokens(&message.content) + MESSAGE_OVERHEAD
}

/// Estimated cost of a snapshot's elements and summary plus the given messages.
pub fn content_tokens(snapshot: &SceneSnapshot, messages: &[ConversationMessage]) -> u32 {
    let msgs: u32 = messages.iter().map(message_tokens).sum();
    let elements: u32 = snapshot.elements.iter().map(estimate_json_tokens).sum();
    msgs + elements + estimate_tokens(&snapshot.summary)
}

/// True when `tokens` plus the metadata reserve fit under the ceiling.
pub fn is_within_budget(tokens: u32, config: &BudgetConfig) -> bool {
    tokens + METADATA_RESERVE <= config.ceiling()
}

/// Cut `text` so its estimate is at most `budget`, marking the cut with `...`.
pub fn truncate_to_tokens(text: &str, budget: u32) -> String {
    if estimate_tokens(text) <= budget {
        return text.to_string();
    }
    if budget == 0 {
        return String::new();
    }
    let keep = (budget as usize * 4).saturating_sub(ELLIPSIS.len());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(ELLIPSIS);
    out
}

#[derive(Clone, Debug, Default)]
pub struct ContextBudgetManager {
    config: BudgetConfig,
}

impl ContextBudgetManager {
    pub fn new(config: BudgetConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Split the ceiling across categories by weight.
    ///
    /// An empty category gives half of its weight to each of the other two.
    pub fn allocate(&self, message_count: usize, element_count: usize) -> Allocation {
        let ceiling = self.config.ceiling();
        let metadata = METADATA_RESERVE.min(ceiling);
        let remaining = f64::from(ceiling - metadata);

        let (mut wm, mut we, mut ws) = (
            self.config.message_weight.max(0.0),
            self.config.element_weight.max(0.0),
            self.config.summary_weight.max(0.0),
        );
        if message_count == 0 {
            we += wm * 0.5;
            ws += wm * 0.5;
            wm = 0.0;
        }
        if element_count == 0 {
            wm += we * 0.5;
            ws += we * 0.5;
            we = 0.0;
        }
        let total = wm + we + ws;
        if total <= 0.0 {
            return Allocation {
                metadata,
                ..Allocation::default()
            };
        }
        let share = |w: f64| (remaining * w / total).floor() as u32;
        Allocation {
            messages: share(wm),
            elements: share(we),
            summary: share(ws),
            metadata,
        }
    }

    /// Return the context unchanged when it fits, pruned otherwise.
    pub fn fit(&self, snapshot: &SceneSnapshot, messages: &[ConversationMessage]) -> PrunedContext {
        if is_within_budget(content_tokens(snapshot, messages), &self.config) {
            let recent = &messages[messages.len().saturating_sub(HISTORY_WINDOW)..];
            return PrunedContext {
                snapshot: snapshot.clone(),
                messages: recent.to_vec(),
                total_tokens: content_tokens(snapshot, recent) + METADATA_RESERVE,
                was_pruned: false,
            };
        }
        self.prune(snapshot, messages)
    }

    pub fn prune(
        &self,
        snapshot: &SceneSnapshot,
        messages: &[ConversationMessage],
    ) -> PrunedContext {
        let mut alloc = self.allocate(messages.len(), snapshot.elements.len());

        let split = messages.len().saturating_sub(RECENT_KEEP);
        let (older, recent) = messages.split_at(split);
        let recent_tokens: u32 = recent.iter().map(message_tokens).sum();
        if recent_tokens > alloc.messages {
            rebalance(&mut alloc, recent_tokens);
        }

        let recent = fit_recent(recent, alloc.messages);
        let recent_used: u32 = recent.iter().map(message_tokens).sum();
        let mut kept = prune_older(older, alloc.messages.saturating_sub(recent_used));
        kept.extend(recent);

        let elements = prune_elements(&snapshot.elements, alloc.elements);
        let summary = truncate_to_tokens(&snapshot.summary, alloc.summary);

        let messages_tokens: u32 = kept.iter().map(message_tokens).sum();
        let elements_tokens: u32 = elements.iter().map(estimate_json_tokens).sum();
        let summary_tokens = estimate_tokens(&summary);
        let total_tokens = messages_tokens + elements_tokens + summary_tokens + alloc.metadata;

        debug!(
            ?alloc,
            total_tokens,
            elements_kept = elements.len(),
            elements_in = snapshot.elements.len(),
            messages_kept = kept.len(),
            messages_in = messages.len(),
            "context pruned"
        );

        let mut pruned = snapshot.clone();
        pruned.count = elements.len();
        pruned.elements = elements;
        pruned.summary = summary;
        pruned.token_budget = TokenBudget {
            total: self.config.max_tokens,
            used: total_tokens,
            elements_tokens,
            messages_tokens,
            summary_tokens,
        };

        PrunedContext {
            snapshot: pruned,
            messages: kept,
            total_tokens,
            was_pruned: true,
        }
    }

    /// The tail of the history that gets rendered: six messages, four once pruned.
    pub fn recent_messages<'a>(&self, ctx: &'a PrunedContext) -> &'a [ConversationMessage] {
        let window = if ctx.was_pruned {
            PRUNED_HISTORY_WINDOW
        } else {
            HISTORY_WINDOW
        };
        &ctx.messages[ctx.messages.len().saturating_sub(window)..]
    }

    /// Scene part of the context, without history.
    pub fn render_scene(&self, ctx: &PrunedContext) -> String {
        json!({
            "canvas": ctx.snapshot.canvas,
            "summary": ctx.snapshot.summary,
            "elements": ctx.snapshot.elements,
        })
        .to_string()
    }

    /// JSON context handed to the prompt builder.
    pub fn render_context(&self, ctx: &PrunedContext) -> String {
        let recent: Vec<serde_json::Value> = self
            .recent_messages(ctx)
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();
        json!({
            "canvas": ctx.snapshot.canvas,
            "summary": ctx.snapshot.summary,
            "elements": ctx.snapshot.elements,
            "recentMessages": recent,
        })
        .to_string()
    }
}

/// Give the recent messages what they need, shrinking the other categories
/// in proportion. When even the whole budget is too small, messages get all of it.
fn rebalance(alloc: &mut Allocation, recent_tokens: u32) {
    let content = alloc.content();
    if recent_tokens >= content {
        *alloc = Allocation {
            messages: content,
            elements: 0,
            summary: 0,
            metadata: alloc.metadata,
        };
        return;
    }
    let left = f64::from(content - recent_tokens);
    let others = f64::from(alloc.elements + alloc.summary);
    let (elements, summary) = if others > 0.0 {
        (
            (left * f64::from(alloc.elements) / others).floor() as u32,
            (left * f64::from(alloc.summary) / others).floor() as u32,
        )
    } else {
        (0, 0)
    };
    alloc.messages = recent_tokens;
    alloc.elements = elements;
    alloc.summary = summary;
}

/// Keep every recent message whole when they fit. Otherwise, newest first,
/// each gets at most an even share of what is left, truncated to it, and is
/// dropped when not even the overhead fits.
fn fit_recent(recent: &[ConversationMessage], budget: u32) -> Vec<ConversationMessage> {
    if recent.iter().map(message_tokens).sum::<u32>() <= budget {
        return recent.to_vec();
    }
    let mut left = budget;
    let mut kept = Vec::with_capacity(recent.len());
    for (i, m) in recent.iter().enumerate().rev() {
        let share = left / (i as u32 + 1);
        let cost = message_tokens(m);
        if cost <= share {
            kept.push(m.clone());
            left -= cost;
        } else if share > MESSAGE_OVERHEAD {
            let mut cut = m.clone();
            cut.content = truncate_to_tokens(&m.content, share - MESSAGE_OVERHEAD);
            left -= message_tokens(&cut);
            kept.push(cut);
        }
    }
    kept.reverse();
    kept
}

fn prune_older(older: &[ConversationMessage], budget: u32) -> Vec<ConversationMessage> {
    let mut used = 0;
    let mut kept = Vec::new();
    for m in older.iter().rev() {
        let cost = message_tokens(m);
        if used + cost <= budget {
            kept.push(m.clone());
            used += cost;
            continue;
        }
        let available = budget.saturating_sub(used).saturating_sub(EARLIER_SLACK);
        if available > MIN_EARLIER_TOKENS {
            let limit = available as usize * 4 - EARLIER_PREFIX.len() - ELLIPSIS.len();
            let head: String = m.content.chars().take(limit).collect();
            let mut cut = m.clone();
            cut.content = format!("{EARLIER_PREFIX}{head}{ELLIPSIS}");
            kept.push(cut);
        }
        break;
    }
    kept.reverse();
    kept
}

fn minimal(el: &SceneObject) -> SceneObject {
    SceneObject {
        id: el.id.clone(),
        kind: el.kind,
        position: el.position,
        size: el.size,
        rotation_degrees: None,
        opacity: None,
        fill_color: None,
        stroke_color: None,
        stroke_width: None,
        layer_index: el.layer_index,
        name: None,
        text_content: el
            .text_content
            .as_deref()
            .map(|t| t.chars().take(MINIMAL_TEXT).collect()),
        font_family: None,
        font_size_px: None,
        image_ref: None,
        image_description: None,
        is_selected: el.is_selected,
    }
}

/// Selected first, then top layers first. Once a selected element has been
/// dropped, nothing unselected is admitted.
fn prune_elements(elements: &[SceneObject], budget: u32) -> Vec<SceneObject> {
    let mut sorted: Vec<&SceneObject> = elements.iter().collect();
    sorted.sort_by(|a, b| {
        b.is_selected
            .cmp(&a.is_selected)
            .then(b.layer_index.cmp(&a.layer_index))
    });

    let mut used = 0;
    let mut kept = Vec::new();
    let mut dropped_selected = false;
    for el in sorted {
        if dropped_selected && !el.is_selected {
            break;
        }
        let full = estimate_json_tokens(el);
        if used + full <= budget {
            kept.push(el.clone());
            used += full;
            continue;
        }
        let small = minimal(el);
        let cost = estimate_json_tokens(&small);
        if used + cost <= budget {
            kept.push(small);
            used += cost;
        } else if el.is_selected {
            dropped_selected = true;
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use easel_core::scene::{CanvasInfo, ObjectKind, Point, Size, SNAPSHOT_VERSION};
    use proptest::prelude::*;

    fn element(id: usize, selected: bool, text_len: usize) -> SceneObject {
        SceneObject {
            id: format!("el_{id}"),
            kind: if text_len > 0 { ObjectKind::Text } else { ObjectKind::Rectangle },
            position: Point { x: id as i64 * 10, y: 5 },
            size: Size { w: 100, h: 40 },
            rotation_degrees: None,
            opacity: None,
            fill_color: Some("#3b82f6".into()),
            stroke_color: Some("#1e40af".into()),
            stroke_width: Some(2.0),
            layer_index: id,
            name: None,
            text_content: (text_len > 0).then(|| "x".repeat(text_len)),
            font_family: (text_len > 0).then(|| "Arial".to_string()),
            font_size_px: None,
            image_ref: None,
            image_description: None,
            is_selected: selected,
        }
    }

    fn snapshot(elements: Vec<SceneObject>, summary: &str) -> SceneSnapshot {
        SceneSnapshot {
            version: SNAPSHOT_VERSION,
            timestamp_ms: 0,
            canvas: CanvasInfo {
                width_px: 900,
                height_px: 1200,
                background_color: "#ffffff".into(),
            },
            count: elements.len(),
            elements,
            summary: summary.into(),
            token_budget: TokenBudget::default(),
        }
    }

    fn history(n: usize, len: usize) -> Vec<ConversationMessage> {
        (0..n)
            .map(|i| {
                let body = format!("{i}:{}", "m".repeat(len));
                if i % 2 == 0 {
                    ConversationMessage::user(body)
                } else {
                    ConversationMessage::assistant(body)
                }
            })
            .collect()
    }

    fn manager(max: u32, reserve: u32) -> ContextBudgetManager {
        ContextBudgetManager::new(BudgetConfig {
            max_tokens: max,
            reserve_for_response_tokens: reserve,
            ..BudgetConfig::default()
        })
    }

    #[test]
    fn allocation_follows_weights() {
        let a = ContextBudgetManager::default().allocate(3, 3);
        // 8000 - 1000 - 100 = 6900
        assert_eq!(a, Allocation { messages: 2760, elements: 2415, summary: 1725, metadata: 100 });
    }

    #[test]
    fn empty_category_redistributes() {
        let a = ContextBudgetManager::default().allocate(0, 3);
        assert_eq!(a.messages, 0);
        // elements 0.35 + 0.2, summary 0.25 + 0.2
        assert_eq!(a.elements, (6900.0_f64 * 0.55).floor() as u32);
        assert_eq!(a.summary, (6900.0_f64 * 0.45).floor() as u32);
    }

    #[test]
    fn small_context_passes_through_with_last_six() {
        let snap = snapshot(vec![element(0, false, 0)], "Canvas: 900x1200px");
        let msgs = history(9, 5);
        let ctx = ContextBudgetManager::default().fit(&snap, &msgs);
        assert!(!ctx.was_pruned);
        assert_eq!(ctx.snapshot, snap);
        assert_eq!(ctx.messages, msgs[3..].to_vec());
    }

    #[test]
    fn recent_two_survive_and_older_get_marked() {
        let snap = snapshot(vec![], "s");
        let msgs = history(6, 800);
        let mgr = manager(2000, 200);
        let ctx = mgr.prune(&snap, &msgs);
        assert!(ctx.was_pruned);
        // oldest dropped, next one cut down
        assert_eq!(ctx.messages.len(), 5);
        assert_eq!(ctx.messages[3..], msgs[4..]);
        assert!(ctx.messages[0].content.starts_with("[earlier] "));
        assert!(ctx.total_tokens <= mgr.config().ceiling());
    }

    #[test]
    fn oversized_recent_messages_are_truncated_to_fit() {
        let snap = snapshot(vec![element(0, false, 0)], "summary");
        let msgs = history(2, 10_000);
        let mgr = manager(1000, 100);
        let ctx = mgr.prune(&snap, &msgs);
        assert_eq!(ctx.messages.len(), 2);
        assert!(ctx.messages[1].content.ends_with("..."));
        assert!(ctx.total_tokens <= 900);
    }

    #[test]
    fn summary_truncates_with_ellipsis() {
        assert_eq!(truncate_to_tokens("abcdefghijkl", 2), "abcde...");
        assert_eq!(truncate_to_tokens("abc", 1), "abc");
        assert_eq!(truncate_to_tokens("abcdef", 0), "");
    }

    #[test]
    fn selected_elements_win() {
        let mut els: Vec<SceneObject> = (0..40).map(|i| element(i, false, 60)).collect();
        els[3].is_selected = true;
        let snap = snapshot(els, "summary");
        let ctx = manager(600, 100).prune(&snap, &[]);
        assert_eq!(ctx.snapshot.elements[0].id, "el_3");
        assert_eq!(ctx.snapshot.count, ctx.snapshot.elements.len());
        assert!(ctx.snapshot.elements.len() < 40);
        // the rest come top layer first
        assert_eq!(ctx.snapshot.elements[1].id, "el_39");
    }

    #[test]
    fn minimal_records_fill_the_tail() {
        let els: Vec<SceneObject> = (0..10).map(|i| element(i, false, 100)).collect();
        let budget = estimate_json_tokens(&els[9]) + estimate_json_tokens(&els[8]) + 40;
        let kept = prune_elements(&els, budget);
        let ids: Vec<&str> = kept.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["el_9", "el_8", "el_7"]);
        assert!(kept[2].fill_color.is_none());
        assert_eq!(kept[2].text_content.as_deref().map(str::len), Some(MINIMAL_TEXT));
    }

    #[test]
    fn tiny_ceiling_is_still_respected() {
        let snap = snapshot(vec![element(0, true, 10)], "a long summary of things");
        let mgr = manager(60, 10);
        let ctx = mgr.prune(&snap, &history(3, 50));
        assert!(ctx.total_tokens <= 50);
    }

    #[test]
    fn rendered_context_keeps_four_when_pruned() {
        let snap = snapshot(vec![], "s");
        let msgs = history(6, 1);
        let ctx = PrunedContext {
            snapshot: snap,
            messages: msgs,
            total_tokens: 0,
            was_pruned: true,
        };
        let raw = ContextBudgetManager::default().render_context(&ctx);
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["recentMessages"].as_array().unwrap().len(), 4);
        assert_eq!(v["canvas"]["widthPx"], 900);
    }

    proptest! {
        #[test]
        fn pruned_total_never_exceeds_ceiling(
            max in 0u32..4000,
            reserve in 0u32..500,
            specs in prop::collection::vec((any::<bool>(), 0usize..200), 0..40),
            msg_count in 0usize..12,
            msg_len in 0usize..3000,
            summary_len in 0usize..2000,
        ) {
            let els: Vec<SceneObject> = specs
                .iter()
                .enumerate()
                .map(|(i, (sel, len))| element(i, *sel, *len))
                .collect();
            let snap = snapshot(els, &"s".repeat(summary_len));
            let mgr = manager(max, reserve);
            let ctx = mgr.prune(&snap, &history(msg_count, msg_len));
            prop_assert!(ctx.total_tokens <= mgr.config().ceiling());
            prop_assert_eq!(
                ctx.total_tokens,
                content_tokens(&ctx.snapshot, &ctx.messages)
                    + mgr.allocate(msg_count, specs.len()).metadata
            );
        }

        #[test]
        fn no_unselected_survives_a_dropped_selected(
            specs in prop::collection::vec((any::<bool>(), 0usize..300), 1..30),
            budget in 0u32..600,
        ) {
            let els: Vec<SceneObject> = specs
                .iter()
                .enumerate()
                .map(|(i, (sel, len))| element(i, *sel, *len))
                .collect();
            let kept = prune_elements(&els, budget);
            let all_selected_kept = els
                .iter()
                .filter(|e| e.is_selected)
                .all(|e| kept.iter().any(|k| k.id == e.id));
            let any_unselected_kept = kept.iter().any(|k| !k.is_selected);
            prop_assert!(all_selected_kept || !any_unselected_kept);
        }
    }
}
