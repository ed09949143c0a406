//! System prompt assembly.

use easel_core::actions::ShapeKind;
use easel_core::messages::Role;
use easel_core::position::PositionPreset;

use crate::budget::{ContextBudgetManager, PrunedContext};

/// Response format and action catalogue.
pub const CORE_PROMPT: &str = include_str!("../prompts/system.txt");

const CLOSING: &str = "Be concise. Execute actions when clear. Ask for clarification when needed.";

/// Attached image characters shown when there is no hosted url.
const INLINE_PREVIEW: usize = 50;

/// An image the user attached to the request.
#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAttachment {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub data_url: Option<String>,
}

impl ImageAttachment {
    fn reference(&self) -> String {
        match (&self.url, &self.data_url) {
            (Some(url), _) => url.clone(),
            (None, Some(data)) => {
                let preview: String = data.chars().take(INLINE_PREVIEW).collect();
                format!("{preview}...")
            }
            (None, None) => "(no url)".to_string(),
        }
    }
}

/// Build the system prompt for one request.
///
/// Sections without content are left out entirely.
pub fn build_system_prompt(
    manager: &ContextBudgetManager,
    ctx: &PrunedContext,
    attachments: &[ImageAttachment],
) -> String {
    let mut out = String::with_capacity(CORE_PROMPT.len() + 1024);
    out.push_str(CORE_PROMPT.trim_end());
    out.push_str("\n\n");

    let positions: Vec<String> = PositionPreset::ALL
        .iter()
        .map(|p| format!("\"{}\"", p.as_str()))
        .collect();
    out.push_str(&format!(
        "POSITIONS: {}, or {{ \"x\": .., \"y\": .. }} from the top-left of the canvas\n",
        positions.join(", ")
    ));
    let shapes: Vec<String> = ShapeKind::ALL
        .iter()
        .map(|s| format!("\"{}\"", s.as_str()))
        .collect();
    out.push_str(&format!("SHAPES: {}\n", shapes.join(", ")));

    out.push_str("\nCANVAS STATE:\n");
    out.push_str(&manager.render_scene(ctx));
    out.push('\n');

    let history = render_history(manager, ctx);
    if !history.is_empty() {
        out.push_str("\nRECENT HISTORY:\n");
        out.push_str(&history);
        out.push('\n');
    }

    if !attachments.is_empty() {
        out.push_str("\nATTACHED IMAGES:\n");
        for (i, img) in attachments.iter().enumerate() {
            out.push_str(&format!("{}. {}: {}\n", i + 1, img.name, img.reference()));
        }
    }

    out.push('\n');
    out.push_str(CLOSING);
    out
}

fn render_history(manager: &ContextBudgetManager, ctx: &PrunedContext) -> String {
    manager
        .recent_messages(ctx)
        .iter()
        .map(|m| {
            let who = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            format!("{who}: {}", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use easel_core::messages::ConversationMessage;
    use easel_core::scene::{CanvasInfo, SceneSnapshot, TokenBudget, SNAPSHOT_VERSION};

    fn ctx(messages: Vec<ConversationMessage>, was_pruned: bool) -> PrunedContext {
        PrunedContext {
            snapshot: SceneSnapshot {
                version: SNAPSHOT_VERSION,
                timestamp_ms: 0,
                canvas: CanvasInfo {
                    width_px: 900,
                    height_px: 1200,
                    background_color: "#ffffff".into(),
                },
                elements: vec![],
                count: 0,
                summary: "Empty canvas".into(),
                token_budget: TokenBudget::default(),
            },
            messages,
            total_tokens: 0,
            was_pruned,
        }
    }

    #[test]
    fn carries_format_catalogue_and_canvas() {
        let prompt =
            build_system_prompt(&ContextBudgetManager::default(), &ctx(vec![], false), &[]);
        assert!(prompt.starts_with("You are a canvas design assistant."));
        assert!(prompt.contains("\"actions\": ["));
        assert!(prompt.contains("- create_shape:"));
        assert!(prompt.contains("\"bottom-right\""));
        assert!(prompt.contains("\"hexagon\""));
        assert!(prompt.contains("\"widthPx\":900"));
        assert!(!prompt.contains("RECENT HISTORY"));
        assert!(!prompt.contains("ATTACHED IMAGES"));
        assert!(prompt.ends_with(CLOSING));
    }

    #[test]
    fn history_is_windowed_and_labelled() {
        let msgs: Vec<ConversationMessage> = (0..8)
            .map(|i| {
                if i % 2 == 0 {
                    ConversationMessage::user(format!("u{i}"))
                } else {
                    ConversationMessage::assistant(format!("a{i}"))
                }
            })
            .collect();
        let mgr = ContextBudgetManager::default();

        let prompt = build_system_prompt(&mgr, &ctx(msgs.clone(), false), &[]);
        assert!(prompt.contains("RECENT HISTORY:\nUser: u2\nAssistant: a3"));
        assert!(!prompt.contains("u0"));

        let prompt = build_system_prompt(&mgr, &ctx(msgs, true), &[]);
        assert!(prompt.contains("RECENT HISTORY:\nUser: u4\n"));
        assert!(!prompt.contains("u2"));
    }

    #[test]
    fn attachments_prefer_hosted_url() {
        let images = vec![
            ImageAttachment {
                name: "logo.png".into(),
                url: Some("https://cdn.example.com/logo.png".into()),
                data_url: None,
            },
            ImageAttachment {
                name: "photo.jpg".into(),
                url: None,
                data_url: Some(format!("data:image/jpeg;base64,{}", "A".repeat(200))),
            },
        ];
        let prompt =
            build_system_prompt(&ContextBudgetManager::default(), &ctx(vec![], false), &images);
        assert!(prompt.contains("1. logo.png: https://cdn.example.com/logo.png\n"));
        let line = prompt.lines().find(|l| l.starts_with("2. photo.jpg: ")).unwrap();
        assert!(line.ends_with("..."));
        assert_eq!(line.len(), "2. photo.jpg: ".len() + INLINE_PREVIEW + 3);
    }
}
