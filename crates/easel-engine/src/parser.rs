//! Incremental extraction of `{message, actions[]}` from a streamed response.
//!
//! The stream is scanned one character at a time with state carried across
//! fragments, so how the text was split never changes what is emitted. The
//! scanner tracks string boundaries and a stack of open containers; it
//! reveals the root `message` value as it grows and emits each element of
//! the root `actions` array once its closing brace arrives.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use easel_core::actions::ActionDescriptor;

static FENCED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").unwrap());
static TRAILING_COMMA: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",\s*([}\]])").unwrap());

const MESSAGE_KEYS: [&str; 3] = ["message", "response", "content"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    #[error("no JSON document in response")]
    NoJson,

    #[error("malformed response document: {0}")]
    Malformed(String),
}

/// What one fragment revealed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParseUpdate {
    pub message_delta: String,
    pub actions: Vec<ActionDescriptor>,
}

impl ParseUpdate {
    pub fn is_empty(&self) -> bool {
        self.message_delta.is_empty() && self.actions.is_empty()
    }
}

/// Result of ending the stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Finalized {
    /// The complete message; supersedes the streamed deltas.
    pub message: String,
    /// Every action, streamed ones first.
    pub actions: Vec<ActionDescriptor>,
    /// Actions only the final parse found.
    pub late_actions: Vec<ActionDescriptor>,
    pub parse_error: Option<DocumentError>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Container {
    Object,
    Array,
}

#[derive(Debug)]
struct Frame {
    container: Container,
    /// Key this container sits under in its parent object.
    name: Option<String>,
    /// Most recent key read inside this object.
    key: Option<String>,
    expect_key: bool,
    /// Byte offset of the opening brace, for elements of the root `actions` array.
    action_start: Option<usize>,
}

impl Frame {
    fn new(container: Container, name: Option<String>) -> Self {
        Self {
            container,
            name,
            key: None,
            expect_key: container == Container::Object,
            action_start: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StringRole {
    Key,
    Message,
    Other,
}

#[derive(Clone, Copy, Debug, Default)]
enum Escape {
    #[default]
    None,
    Backslash,
    Unicode { value: u32, digits: u8 },
}

#[derive(Debug, Default)]
pub struct IncrementalParser {
    buffer: String,
    stack: Vec<Frame>,
    in_string: bool,
    role: Option<StringRole>,
    escape: Escape,
    pending_high: Option<u32>,
    key_buf: String,
    message: String,
    emitted: Vec<ActionDescriptor>,
}

impl IncrementalParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything received so far.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Message text revealed so far.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn emitted(&self) -> &[ActionDescriptor] {
        &self.emitted
    }

    pub fn feed(&mut self, fragment: &str) -> ParseUpdate {
        let base = self.buffer.len();
        self.buffer.push_str(fragment);
        let mut update = ParseUpdate::default();
        for (i, c) in fragment.char_indices() {
            self.step(base + i, c, &mut update);
        }
        update
    }

    /// Parse the whole buffer and emit whatever the stream scan missed.
    pub fn finish(self) -> Finalized {
        let mut actions = self.emitted;
        let mut late_actions = Vec::new();

        let (message, parse_error) = match parse_document(&self.buffer) {
            Ok(roots) => {
                let mut matched = vec![false; actions.len()];
                for candidate in roots.iter().flat_map(root_actions) {
                    let seen = actions
                        .iter()
                        .zip(matched.iter_mut())
                        .find(|(a, used)| !**used && a.same_content(&candidate));
                    match seen {
                        Some((_, used)) => *used = true,
                        None => late_actions.push(candidate),
                    }
                }
                let full: Option<String> = roots.iter().find_map(root_message);
                (full.unwrap_or(self.message), None)
            }
            Err(DocumentError::NoJson) => {
                let text = self.buffer.trim();
                let message = if self.message.is_empty() {
                    text.to_string()
                } else {
                    self.message
                };
                (message, Some(DocumentError::NoJson))
            }
            Err(e) => {
                debug!(error = %e, "final parse failed, keeping streamed output");
                let message = if self.message.is_empty() {
                    self.buffer.trim().to_string()
                } else {
                    self.message
                };
                (message, Some(e))
            }
        };

        actions.extend(late_actions.iter().cloned());
        Finalized {
            message,
            actions,
            late_actions,
            parse_error,
        }
    }

    fn step(&mut self, pos: usize, c: char, out: &mut ParseUpdate) {
        if self.in_string {
            self.string_char(c, out);
            return;
        }
        if self.stack.is_empty() {
            // outside any document only a new root object matters
            if c == '{' {
                self.stack.push(Frame::new(Container::Object, None));
            }
            return;
        }
        match c {
            '"' => {
                self.in_string = true;
                self.role = Some(self.string_role());
                self.key_buf.clear();
            }
            '{' | '[' => {
                let depth = self.stack.len();
                let Some(top) = self.stack.last() else { return };
                let name = match top.container {
                    Container::Object => top.key.clone(),
                    Container::Array => None,
                };
                let in_actions = depth == 2
                    && top.container == Container::Array
                    && top.name.as_deref() == Some("actions");
                let container = if c == '{' {
                    Container::Object
                } else {
                    Container::Array
                };
                let mut frame = Frame::new(container, name);
                if container == Container::Object && in_actions {
                    frame.action_start = Some(pos);
                }
                self.stack.push(frame);
            }
            '}' | ']' => {
                if let Some(start) = self.stack.pop().and_then(|f| f.action_start) {
                    self.complete_action(start, pos, out);
                }
            }
            ',' => {
                if let Some(top) = self.stack.last_mut() {
                    if top.container == Container::Object {
                        top.expect_key = true;
                        top.key = None;
                    }
                }
            }
            _ => {}
        }
    }

    fn string_role(&self) -> StringRole {
        match self.stack.last() {
            Some(top) if top.container == Container::Object && top.expect_key => StringRole::Key,
            Some(top)
                if self.stack.len() == 1
                    && top.container == Container::Object
                    && top.key.as_deref() == Some("message") =>
            {
                StringRole::Message
            }
            _ => StringRole::Other,
        }
    }

    fn string_char(&mut self, c: char, out: &mut ParseUpdate) {
        match std::mem::take(&mut self.escape) {
            Escape::None => match c {
                '\\' => self.escape = Escape::Backslash,
                '"' => self.end_string(),
                _ => self.push_char(c, out),
            },
            Escape::Backslash => match c {
                'u' => self.escape = Escape::Unicode { value: 0, digits: 0 },
                'n' => self.push_char('\n', out),
                't' => self.push_char('\t', out),
                'r' => self.push_char('\r', out),
                'b' => self.push_char('\u{8}', out),
                'f' => self.push_char('\u{c}', out),
                other => self.push_char(other, out),
            },
            Escape::Unicode { value, digits } => {
                let Some(d) = c.to_digit(16) else {
                    self.push_char(c, out);
                    return;
                };
                let value = value * 16 + d;
                if digits < 3 {
                    self.escape = Escape::Unicode {
                        value,
                        digits: digits + 1,
                    };
                } else {
                    self.push_code_unit(value, out);
                }
            }
        }
    }

    fn push_code_unit(&mut self, unit: u32, out: &mut ParseUpdate) {
        if (0xD800..=0xDBFF).contains(&unit) {
            if self.pending_high.replace(unit).is_some() {
                self.emit_char(char::REPLACEMENT_CHARACTER, out);
            }
            return;
        }
        if (0xDC00..=0xDFFF).contains(&unit) {
            let c = match self.pending_high.take() {
                Some(high) => char::from_u32(0x10000 + ((high - 0xD800) << 10) + (unit - 0xDC00)),
                None => None,
            };
            self.emit_char(c.unwrap_or(char::REPLACEMENT_CHARACTER), out);
            return;
        }
        self.push_char(char::from_u32(unit).unwrap_or(char::REPLACEMENT_CHARACTER), out);
    }

    fn push_char(&mut self, c: char, out: &mut ParseUpdate) {
        if self.pending_high.take().is_some() {
            self.emit_char(char::REPLACEMENT_CHARACTER, out);
        }
        self.emit_char(c, out);
    }

    fn emit_char(&mut self, c: char, out: &mut ParseUpdate) {
        match self.role {
            Some(StringRole::Key) => self.key_buf.push(c),
            Some(StringRole::Message) => {
                self.message.push(c);
                out.message_delta.push(c);
            }
            _ => {}
        }
    }

    fn end_string(&mut self) {
        self.in_string = false;
        self.pending_high = None;
        if self.role.take() == Some(StringRole::Key) {
            if let Some(top) = self.stack.last_mut() {
                top.key = Some(std::mem::take(&mut self.key_buf));
                top.expect_key = false;
            }
        }
    }

    fn complete_action(&mut self, start: usize, end: usize, out: &mut ParseUpdate) {
        let parsed = serde_json::from_str::<Value>(&self.buffer[start..=end]);
        match parsed {
            Ok(value) => match ActionDescriptor::from_value(&value) {
                Some(action) => {
                    self.emitted.push(action.clone());
                    out.actions.push(action);
                }
                None => debug!("skipping action object without a type"),
            },
            Err(e) => debug!(error = %e, "skipping unparseable action object"),
        }
    }
}

fn root_actions(root: &Value) -> Vec<ActionDescriptor> {
    root.get("actions")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(ActionDescriptor::from_value).collect())
        .unwrap_or_default()
}

fn root_message(root: &Value) -> Option<String> {
    MESSAGE_KEYS
        .iter()
        .find_map(|k| root.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

/// Parse a complete response into its root objects.
///
/// Tries, in order: the text as one or more concatenated JSON values, the
/// span from the first `{` to the last `}`, and a repaired copy with
/// trailing commas removed and open strings and containers closed.
pub fn parse_document(text: &str) -> Result<Vec<Value>, DocumentError> {
    let text = strip_fences(text);
    let text = text.trim();
    if text.is_empty() {
        return Err(DocumentError::NoJson);
    }
    if let Some(roots) = parse_roots(text) {
        return Ok(roots);
    }

    let Some(first) = text.find('{') else {
        return Err(DocumentError::NoJson);
    };
    if let Some(last) = text.rfind('}') {
        if last > first {
            if let Some(roots) = parse_roots(&text[first..=last]) {
                return Ok(roots);
            }
        }
    }

    let repaired = repair(&text[first..]);
    let mut stream = serde_json::Deserializer::from_str(&repaired).into_iter::<Value>();
    let mut roots = Vec::new();
    loop {
        match stream.next() {
            Some(Ok(v)) if v.is_object() => roots.push(v),
            Some(Ok(_)) => {}
            Some(Err(e)) if roots.is_empty() => return Err(DocumentError::Malformed(e.to_string())),
            Some(Err(_)) | None => break,
        }
    }
    if roots.is_empty() {
        return Err(DocumentError::Malformed("no object after repair".into()));
    }
    Ok(roots)
}

fn strip_fences(text: &str) -> String {
    if let Some(caps) = FENCED.captures(text) {
        return caps[1].to_string();
    }
    // an opening fence whose closing fence never arrived
    let trimmed = text.trim_start();
    if let Some(rest) = trimmed.strip_prefix("```") {
        return rest.split_once('\n').map_or("", |(_, body)| body).to_string();
    }
    text.to_string()
}

fn parse_roots(text: &str) -> Option<Vec<Value>> {
    let roots: Result<Vec<Value>, _> = serde_json::Deserializer::from_str(text)
        .into_iter::<Value>()
        .collect();
    match roots {
        Ok(roots) if !roots.is_empty() && roots.iter().all(Value::is_object) => Some(roots),
        _ => None,
    }
}

fn repair(text: &str) -> String {
    let mut closers = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in text.chars() {
        if in_string {
            match (escaped, c) {
                (true, _) => escaped = false,
                (false, '\\') => escaped = true,
                (false, '"') => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                closers.pop();
            }
            _ => {}
        }
    }
    let mut fixed = text.to_string();
    if escaped {
        fixed.pop();
    }
    if in_string {
        fixed.push('"');
    }
    fixed.extend(closers.iter().rev());
    TRAILING_COMMA.replace_all(&fixed, "$1").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn feed_all(parts: &[&str]) -> (Vec<ParseUpdate>, Finalized) {
        let mut p = IncrementalParser::new();
        let updates = parts.iter().map(|f| p.feed(f)).collect();
        (updates, p.finish())
    }

    #[test]
    fn action_split_across_fragments_waits_for_close() {
        let mut p = IncrementalParser::new();
        let first = p.feed(r#"{"message":"Hello"}{"actions":[{"type":"add_text","payload":{"tex"#);
        assert_eq!(first.message_delta, "Hello");
        assert!(first.actions.is_empty());

        let second = p.feed(r#"t":"hi"}}]}"#);
        assert_eq!(second.actions.len(), 1);
        assert_eq!(second.actions[0].action_type, "add_text");
        assert_eq!(second.actions[0].payload, json!({"text": "hi"}));

        let done = p.finish();
        assert_eq!(done.message, "Hello");
        assert_eq!(done.actions.len(), 1);
        assert!(done.late_actions.is_empty());
        assert!(done.parse_error.is_none());
    }

    #[test]
    fn message_grows_before_its_closing_quote() {
        let (updates, done) = feed_all(&[
            r#"{"mess"#,
            r#"age": "Hel"#,
            r#"lo \"wor"#,
            r#"ld\"\n"#,
            r#"", "actions": []}"#,
        ]);
        let deltas: Vec<&str> = updates.iter().map(|u| u.message_delta.as_str()).collect();
        assert_eq!(deltas, vec!["", "Hel", "lo \"wor", "ld\"\n", ""]);
        assert_eq!(done.message, "Hello \"world\"\n");
    }

    #[test]
    fn unicode_escape_split_across_fragments() {
        let (updates, done) = feed_all(&[r#"{"message":"caf\u00"#, r#"e9 \ud83c"#, r#"\udfa8"}"#]);
        assert_eq!(updates[0].message_delta, "caf");
        assert_eq!(updates[1].message_delta, "é ");
        assert_eq!(updates[2].message_delta, "🎨");
        assert_eq!(done.message, "café 🎨");
    }

    #[test]
    fn braces_inside_strings_are_ignored() {
        let doc = concat!(
            r#"{"message":"use { and ] freely","#,
            r#""actions":[{"type":"add_text","payload":{"text":"}{\"]"}}]}"#,
        );
        let (updates, done) = feed_all(&[doc]);
        assert_eq!(updates[0].actions.len(), 1);
        assert_eq!(updates[0].actions[0].payload, json!({"text": "}{\"]"}));
        assert_eq!(done.message, "use { and ] freely");
    }

    #[test]
    fn nested_message_keys_are_not_the_message() {
        let doc = concat!(
            r#"{"actions":[{"type":"ask_clarification","payload":{"message":"which one?"}}],"#,
            r#""message":"ok"}"#,
        );
        let (updates, _) = feed_all(&[doc]);
        assert_eq!(updates[0].message_delta, "ok");
    }

    #[test]
    fn fenced_response_with_prose() {
        let text = concat!(
            "Sure thing!\n```json\n",
            r#"{"message": "Done", "actions": ["#,
            r#"{"type": "delete_element", "payload": {"elementQuery": "circle"}}]}"#,
            "\n```\nAnything else?",
        );
        let (updates, done) = feed_all(&[text]);
        assert_eq!(updates[0].actions.len(), 1);
        assert_eq!(done.actions.len(), 1);
        assert!(done.late_actions.is_empty());
        assert_eq!(done.message, "Done");
    }

    #[test]
    fn truncated_document_is_repaired() {
        let text = concat!(
            r#"{"message":"Adding","actions":[{"type":"add_text","payload":{"text":"a"}},"#,
            r#"{"type":"add_text","payload":{"text":"b""#,
        );
        let (updates, done) = feed_all(&[text]);
        assert_eq!(updates[0].actions.len(), 1);
        assert_eq!(done.late_actions.len(), 1);
        assert_eq!(done.late_actions[0].payload, json!({"text": "b"}));
        assert_eq!(done.actions.len(), 2);
        assert_eq!(done.message, "Adding");
    }

    #[test]
    fn unterminated_message_is_closed() {
        let roots = parse_document(r#"{"message":"half a thou"#).unwrap();
        assert_eq!(roots[0]["message"], "half a thou");
    }

    #[test]
    fn trailing_commas_are_dropped() {
        let roots =
            parse_document(r#"{"message":"x","actions":[{"type":"add_text",},],}"#).unwrap();
        assert_eq!(roots[0]["actions"][0]["type"], "add_text");
    }

    #[test]
    fn plain_text_becomes_the_message() {
        let (_, done) = feed_all(&["  I can't do that on this canvas.  "]);
        assert_eq!(done.message, "I can't do that on this canvas.");
        assert!(done.actions.is_empty());
        assert_eq!(done.parse_error, Some(DocumentError::NoJson));
    }

    #[test]
    fn response_alias_in_final_parse() {
        let (_, done) = feed_all(&[r#"{"response":"hi there","actions":[]}"#]);
        assert_eq!(done.message, "hi there");
    }

    #[test]
    fn identical_actions_are_each_emitted_once() {
        let doc = concat!(
            r#"{"message":"","actions":["#,
            r#"{"type":"create_shape","payload":{"kind":"circle"}},"#,
            r#"{"type":"create_shape","payload":{"kind":"circle"}}]}"#,
        );
        let (_, done) = feed_all(&[doc]);
        assert_eq!(done.actions.len(), 2);
        assert!(done.late_actions.is_empty());
        assert_ne!(done.actions[0].id, done.actions[1].id);
    }

    #[test]
    fn unknown_types_are_still_emitted() {
        let (updates, _) = feed_all(&[r#"{"actions":[{"type":"teleport","payload":{}}]}"#]);
        assert_eq!(updates[0].actions[0].action_type, "teleport");
    }

    #[test]
    fn typeless_objects_are_skipped() {
        let (updates, done) = feed_all(&[r#"{"actions":[{"payload":{}},{"type":"add_text"}]}"#]);
        assert_eq!(updates[0].actions.len(), 1);
        assert_eq!(done.actions.len(), 1);
    }

    fn document() -> impl Strategy<Value = String> {
        let text = "[a-zA-Z0-9 {}\\[\\]\",:\\\\\n\té🎨]{0,24}";
        let action = (
            prop::sample::select(vec![
                "add_text",
                "create_shape",
                "move_element",
                "delete_element",
            ]),
            text,
        )
            .prop_map(|(t, s)| json!({"type": t, "payload": {"text": s, "n": [1, {"k": s}]}}));
        (text, prop::collection::vec(action, 0..4), any::<bool>()).prop_map(
            |(message, actions, split_roots)| {
                if split_roots {
                    format!("{}{}", json!({"message": message}), json!({"actions": actions}))
                } else {
                    json!({"message": message, "actions": actions}).to_string()
                }
            },
        )
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_the_result(
            doc in document(),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let (_, whole) = feed_all(&[doc.as_str()]);

            let bounds: Vec<usize> = doc.char_indices().map(|(i, _)| i).collect();
            let mut points: Vec<usize> =
                cuts.iter().map(|ix| bounds[ix.index(bounds.len())]).collect();
            points.sort_unstable();
            points.dedup();
            let mut pieces = Vec::new();
            let mut last = 0;
            for p in points.into_iter().chain(std::iter::once(doc.len())) {
                pieces.push(&doc[last..p]);
                last = p;
            }
            let (_, chunked) = feed_all(&pieces);

            prop_assert_eq!(&whole.message, &chunked.message);
            prop_assert_eq!(whole.actions.len(), chunked.actions.len());
            for (a, b) in whole.actions.iter().zip(&chunked.actions) {
                prop_assert!(a.same_content(b));
            }
            prop_assert!(chunked.late_actions.is_empty());
        }

        #[test]
        fn byte_by_byte_matches_single_fragment(doc in document()) {
            let mut p = IncrementalParser::new();
            let mut streamed = String::new();
            let mut buf = [0u8; 4];
            for c in doc.chars() {
                streamed.push_str(&p.feed(c.encode_utf8(&mut buf)).message_delta);
            }
            let done = p.finish();
            let (_, whole) = feed_all(&[doc.as_str()]);
            prop_assert_eq!(&streamed, &whole.message);
            prop_assert_eq!(done.actions.len(), whole.actions.len());
            let mut ids: Vec<&str> = done.actions.iter().map(|a| a.id.as_str()).collect();
            ids.sort_unstable();
            ids.dedup();
            prop_assert_eq!(ids.len(), done.actions.len());
        }
    }
}
