//! Applies validated actions to the live scene.
//!
//! Failures stay local: every action yields an [`ActionOutcome`], and a batch
//! keeps going after a failed action.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use easel_core::actions::{
    Action, ActionDescriptor, AddImage, AddText, ChangeLayerOrder, CreateShape, DuplicateElement,
    ModifyElement, MoveElement, PayloadError, ResizeDirective, ResizeElement, SearchImages,
    ShapeKind, Target,
};
use easel_core::ids::ActionId;
use easel_core::position::{PositionPreset, PositionSpec, DEFAULT_MARGIN_RATIO, SEARCH_MARGIN_RATIO};

use crate::resolver::{resolve, resolve_all, resolve_position, workspace_area};
use crate::scene::{HostError, ImageInfo, NodePatch, Paint, SceneHost, SceneNode, WORKSPACE_MARKER};

/// Smallest rendered width or height a resize may produce.
pub const MIN_ELEMENT_SIZE: f64 = 10.0;
/// Largest rendered size a resize may produce, as a share of the workspace.
pub const MAX_WORKSPACE_SHARE: f64 = 0.95;
/// Gap kept to the workspace edge when a resize pushes an element back inside.
const EDGE_GAP: f64 = 10.0;
/// Loaded images are scaled down to fit this share of the workspace.
const IMAGE_FIT_SHARE: f64 = 0.5;
const FALLBACK_IMAGE_SIZE: f64 = 200.0;
const TEXT_WIDTH_FACTOR: f64 = 0.6;
const TEXT_MAX_SHARE: f64 = 0.8;
const LINE_HEIGHT: f64 = 1.16;

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Preset margin for placement, as a share of the smaller workspace side.
    pub margin_ratio: f64,
    /// Preset margin for images placed from a search.
    pub search_margin_ratio: f64,
    pub duplicate_offset: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            margin_ratio: DEFAULT_MARGIN_RATIO,
            search_margin_ratio: SEARCH_MARGIN_RATIO,
            duplicate_offset: 20.0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("element not found: {0}")]
    TargetNotFound(String),

    #[error(transparent)]
    InvalidPayload(#[from] PayloadError),

    #[error("{0}")]
    Precondition(String),

    #[error("unsupported action: {0}")]
    Unsupported(String),

    #[error("no images found for \"{0}\"")]
    NoResults(String),

    #[error("scene error: {0}")]
    Host(#[from] HostError),
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("image search failed: {0}")]
pub struct SearchError(pub String);

/// One image returned by a search backend.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageHit {
    pub url: String,
    pub description: Option<String>,
}

/// A stock-image search backend. Backends are tried in registration order.
#[async_trait]
pub trait ImageSearch: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &str, count: usize) -> Result<Vec<ImageHit>, SearchError>;
}

/// Result of executing one action.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    pub action_id: ActionId,
    pub success: bool,
    pub message: String,
    /// Set when the action asks the user a question instead of mutating.
    pub requires_clarification: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// Ids of the nodes the action touched.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub element_ids: Vec<String>,
}

#[derive(Debug, Default)]
struct Applied {
    message: String,
    element_ids: Vec<String>,
    question: Option<(String, Vec<String>)>,
}

impl Applied {
    fn on(message: impl Into<String>, ids: Vec<String>) -> Self {
        Self {
            message: message.into(),
            element_ids: ids,
            question: None,
        }
    }
}

/// State carried across the actions of one batch.
#[derive(Clone, Debug, Default)]
pub struct Batch {
    initial_selection: Vec<String>,
}

impl Batch {
    pub fn initial_selection(&self) -> &[String] {
        &self.initial_selection
    }
}

pub struct ActionExecutor {
    config: ExecutorConfig,
    image_search: Vec<Arc<dyn ImageSearch>>,
}

impl Default for ActionExecutor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

impl ActionExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            image_search: Vec::new(),
        }
    }

    pub fn with_image_search(mut self, backend: Arc<dyn ImageSearch>) -> Self {
        self.image_search.push(backend);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute a list of actions in order.
    pub async fn execute_batch(
        &self,
        host: &mut dyn SceneHost,
        actions: &[ActionDescriptor],
    ) -> Vec<ActionOutcome> {
        let batch = self.begin(host);
        let mut outcomes = Vec::with_capacity(actions.len());
        for descriptor in actions {
            outcomes.push(self.execute_in(&batch, host, descriptor).await);
        }
        self.finish(host);
        outcomes
    }

    /// Start a batch: remember the selection and lock user interaction.
    pub fn begin(&self, host: &mut dyn SceneHost) -> Batch {
        set_interactive(host, false);
        Batch {
            initial_selection: host.selection(),
        }
    }

    /// Run one action of a batch. Actions that target the selection
    /// implicitly act on the selection the batch started with.
    pub async fn execute_in(
        &self,
        batch: &Batch,
        host: &mut dyn SceneHost,
        descriptor: &ActionDescriptor,
    ) -> ActionOutcome {
        let implicit = descriptor
            .to_action()
            .ok()
            .and_then(|a| a.target().map(Target::is_implicit))
            .unwrap_or(false);
        if implicit && !batch.initial_selection.is_empty() {
            host.set_selection(&batch.initial_selection);
        }
        self.execute(host, descriptor).await
    }

    /// End a batch: restore interactivity on every node, even after failures.
    pub fn finish(&self, host: &mut dyn SceneHost) {
        set_interactive(host, true);
        host.request_render();
    }

    /// Execute a single action. Never panics on bad input; failures come
    /// back as unsuccessful outcomes.
    #[instrument(
        skip_all,
        fields(action_id = %descriptor.id, action_type = %descriptor.action_type)
    )]
    pub async fn execute(
        &self,
        host: &mut dyn SceneHost,
        descriptor: &ActionDescriptor,
    ) -> ActionOutcome {
        let result = match descriptor.to_action() {
            Ok(action) => self.apply(host, &action).await.map(|applied| (action, applied)),
            Err(PayloadError::UnknownType(t)) => Err(ExecError::Unsupported(t)),
            Err(e) => Err(ExecError::InvalidPayload(e)),
        };

        match result {
            Ok((action, applied)) => {
                host.request_render();
                if action.kind().is_mutating() {
                    if let Err(e) = host.persist().await {
                        warn!(error = %e, "scene save hook failed");
                    }
                }
                debug!(message = %applied.message, "action applied");
                let (requires_clarification, options) = match applied.question {
                    Some((_, options)) => (true, options),
                    None => (false, Vec::new()),
                };
                ActionOutcome {
                    action_id: descriptor.id.clone(),
                    success: true,
                    message: applied.message,
                    requires_clarification,
                    options,
                    element_ids: applied.element_ids,
                }
            }
            Err(e) => {
                debug!(error = %e, "action failed");
                ActionOutcome {
                    action_id: descriptor.id.clone(),
                    success: false,
                    message: e.to_string(),
                    requires_clarification: false,
                    options: Vec::new(),
                    element_ids: Vec::new(),
                }
            }
        }
    }

    async fn apply(&self, host: &mut dyn SceneHost, action: &Action) -> Result<Applied, ExecError> {
        match action {
            Action::CreateShape(a) => self.create_shape(host, a),
            Action::AddText(a) => self.add_text(host, a),
            Action::MoveElement(a) => self.move_element(host, a),
            Action::ModifyElement(a) => modify_element(host, a),
            Action::ResizeElement(a) => resize_element(host, a),
            Action::DeleteElement(t) => delete_element(host, t),
            Action::SelectElement(t) => {
                let node = target(host, t)?;
                host.set_selection(std::slice::from_ref(&node.id));
                Ok(Applied::on("Selected element", vec![node.id]))
            }
            Action::AddImage(a) => self.add_image(host, a).await,
            Action::ChangeBackground(a) => {
                let paint = Paint::solid(a.color.clone());
                if host.workspace().is_some() {
                    host.set_workspace_fill(paint)?;
                    host.fire_modified(WORKSPACE_MARKER);
                } else {
                    host.set_background(paint);
                }
                Ok(Applied::on(format!("Changed background to {}", a.color), Vec::new()))
            }
            Action::SearchImages(a) => self.search_images(host, a).await,
            Action::AskClarification(a) => Ok(Applied {
                message: a.question.clone(),
                element_ids: Vec::new(),
                question: Some((a.question.clone(), a.options.clone())),
            }),
            Action::ChangeLayerOrder(a) => change_layer_order(host, a),
            Action::DuplicateElement(a) => self.duplicate(host, a),
        }
    }

    fn create_shape(
        &self,
        host: &mut dyn SceneHost,
        a: &CreateShape,
    ) -> Result<Applied, ExecError> {
        let id = fresh_id(host, a.kind.as_str());
        let mut node = shape_node(&id, a);
        if let Some(fill) = &a.fill {
            node.fill = Paint::solid(fill.clone());
        }
        if let Some(stroke) = &a.stroke {
            node.stroke = Paint::solid(stroke.clone());
        }
        if let Some(w) = a.stroke_width {
            node.stroke_width = w;
        }
        if let Some(o) = a.opacity {
            node.opacity = o.clamp(0.0, 1.0);
        }
        if let Some(angle) = a.angle {
            node.angle = angle;
        }
        if a.kind == ShapeKind::Rectangle {
            node.corner_radius = a.corner_radius;
        }
        node.name = a.name.clone();

        let spec = a.position.unwrap_or_default();
        let (left, top) = resolve_position(
            host,
            spec,
            node.rendered_width(),
            node.rendered_height(),
            self.config.margin_ratio,
        );
        node.left = left;
        node.top = top;
        host.add(node)?;
        host.set_selection(std::slice::from_ref(&id));
        Ok(Applied::on(format!("Created {}", a.kind.as_str()), vec![id]))
    }

    fn add_text(&self, host: &mut dyn SceneHost, a: &AddText) -> Result<Applied, ExecError> {
        let text = a.text.clone().filter(|t| !t.is_empty()).unwrap_or_else(|| "Text".into());
        let font_size = a.font_size.filter(|s| *s > 0.0).unwrap_or(32.0);
        let area = workspace_area(host);

        let natural = text.chars().count() as f64 * font_size * TEXT_WIDTH_FACTOR;
        let width = natural.min(area.width * TEXT_MAX_SHARE).max(font_size);
        let lines = (natural / width).ceil().max(1.0);
        let height = lines * font_size * LINE_HEIGHT;

        let id = fresh_id(host, "text");
        let mut node = SceneNode::new(&id, "textbox").sized(width, height);
        node.text = Some(text.clone());
        node.font_size = Some(font_size);
        node.font_family = Some(a.font_family.clone().unwrap_or_else(|| "Arial".into()));
        node.fill = Paint::solid(a.fill.clone().unwrap_or_else(|| "#000000".into()));
        node.font_weight = a.font_weight.clone();
        node.text_align = Some(a.text_align.clone().unwrap_or_else(|| "center".into()));

        let (left, top) = resolve_position(
            host,
            a.position.unwrap_or_default(),
            width,
            height,
            self.config.margin_ratio,
        );
        node.left = left;
        node.top = top;
        host.add(node)?;
        host.set_selection(std::slice::from_ref(&id));
        Ok(Applied::on(format!("Added text \"{text}\""), vec![id]))
    }

    fn move_element(
        &self,
        host: &mut dyn SceneHost,
        a: &MoveElement,
    ) -> Result<Applied, ExecError> {
        let node = target(host, &a.target)?;
        let (left, top) = resolve_position(
            host,
            a.position,
            node.rendered_width(),
            node.rendered_height(),
            self.config.margin_ratio,
        );
        host.update(&node.id, &NodePatch::position(left, top))?;
        host.fire_modified(&node.id);
        host.set_selection(std::slice::from_ref(&node.id));
        Ok(Applied::on("Moved element", vec![node.id]))
    }

    async fn add_image(
        &self,
        host: &mut dyn SceneHost,
        a: &AddImage,
    ) -> Result<Applied, ExecError> {
        if a.url.trim().is_empty() {
            return Err(ExecError::Precondition("No image URL".into()));
        }
        let info = host.load_image(&a.url).await?;
        let (w0, h0) = intrinsic(info);
        let scale = match (a.width, a.height) {
            (Some(w), _) if w > 0.0 => w / w0,
            (_, Some(h)) if h > 0.0 => h / h0,
            _ => fit_scale(host, w0, h0),
        };
        let placement = Placement {
            spec: a.position.unwrap_or_default(),
            margin_ratio: self.config.margin_ratio,
            name: a.name.clone(),
        };
        let id = place_image(host, &a.url, (w0, h0), scale, placement)?;
        host.set_selection(std::slice::from_ref(&id));
        Ok(Applied::on("Added image", vec![id]))
    }

    async fn search_images(
        &self,
        host: &mut dyn SceneHost,
        a: &SearchImages,
    ) -> Result<Applied, ExecError> {
        let query = a.query.trim();
        if query.is_empty() {
            return Err(ExecError::Precondition("No search query".into()));
        }
        let count = a.count.clamp(1, PositionPreset::ALL.len());

        let mut hits = Vec::new();
        for backend in &self.image_search {
            match backend.search(query, count).await {
                Ok(found) if !found.is_empty() => {
                    debug!(backend = backend.name(), hits = found.len(), "image search hit");
                    hits = found;
                    break;
                }
                Ok(_) => debug!(backend = backend.name(), "image search empty"),
                Err(e) => warn!(backend = backend.name(), error = %e, "image search failed"),
            }
        }
        if hits.is_empty() {
            return Err(ExecError::NoResults(query.to_string()));
        }

        let first = a.position.unwrap_or_default();
        let slots = std::iter::once(first).chain(
            PositionPreset::ALL
                .into_iter()
                .map(PositionSpec::Preset)
                .filter(move |p| *p != first),
        );
        let mut ids = Vec::new();
        for (hit, slot) in hits.into_iter().take(count).zip(slots) {
            let info = match host.load_image(&hit.url).await {
                Ok(info) => info,
                Err(e) => {
                    warn!(url = %hit.url, error = %e, "search result failed to load");
                    continue;
                }
            };
            let (w0, h0) = intrinsic(info);
            let scale = fit_scale(host, w0, h0);
            let placement = Placement {
                spec: slot,
                margin_ratio: self.config.search_margin_ratio,
                name: hit.description,
            };
            ids.push(place_image(host, &hit.url, (w0, h0), scale, placement)?);
        }
        if ids.is_empty() {
            return Err(ExecError::Precondition("Failed to load image".into()));
        }
        host.set_selection(&ids);
        Ok(Applied::on(format!("Added \"{query}\" image"), ids))
    }

    fn duplicate(
        &self,
        host: &mut dyn SceneHost,
        a: &DuplicateElement,
    ) -> Result<Applied, ExecError> {
        let source = target(host, &a.target)?;
        let id = fresh_id(host, &format!("{}_copy", source.kind().as_str()));
        let mut copy = source.clone();
        copy.id = id.clone();
        copy.left += a.offset_x.unwrap_or(self.config.duplicate_offset);
        copy.top += a.offset_y.unwrap_or(self.config.duplicate_offset);
        host.add(copy)?;
        host.set_selection(std::slice::from_ref(&id));
        Ok(Applied::on("Duplicated element", vec![id]))
    }
}

fn target(host: &dyn SceneHost, t: &Target) -> Result<SceneNode, ExecError> {
    let query = t.as_query();
    match resolve(host, query) {
        Some(resolved) => {
            debug!(
                query,
                id = %resolved.node.id,
                matched_by = ?resolved.matched_by,
                "target resolved"
            );
            Ok(resolved.node)
        }
        None if t.is_implicit() => Err(ExecError::TargetNotFound(format!(
            "no element is selected (query \"{query}\")"
        ))),
        None => Err(ExecError::TargetNotFound(query.to_string())),
    }
}

fn modify_element(host: &mut dyn SceneHost, a: &ModifyElement) -> Result<Applied, ExecError> {
    let node = target(host, &a.target)?;
    let (patch, ignored) = normalize_properties(&a.properties);
    if patch.is_empty() {
        return Err(ExecError::Precondition(format!(
            "no supported properties in {:?}",
            ignored
        )));
    }
    if !ignored.is_empty() {
        debug!(?ignored, "ignoring unsupported properties");
    }
    host.update(&node.id, &patch)?;
    host.fire_modified(&node.id);
    host.set_selection(std::slice::from_ref(&node.id));
    Ok(Applied::on("Modified element", vec![node.id]))
}

/// Translate loosely named properties into a patch. Returns the patch and
/// the names it could not use.
pub fn normalize_properties(props: &Map<String, Value>) -> (NodePatch, Vec<String>) {
    let mut patch = NodePatch::default();
    let mut ignored = Vec::new();
    for (key, value) in props {
        let handled = match key.as_str() {
            "fill" | "color" | "backgroundColor" => {
                value.as_str().map(|c| patch.fill = Some(Paint::solid(c)))
            }
            "stroke" | "border" | "borderColor" | "strokeColor" => {
                value.as_str().map(|c| patch.stroke = Some(Paint::solid(c)))
            }
            "strokeWidth" | "borderWidth" => {
                number(value).map(|n| patch.stroke_width = Some(n.max(0.0)))
            }
            "angle" | "rotation" => number(value).map(|n| patch.angle = Some(n)),
            "opacity" => number(value).map(|n| patch.opacity = Some(n.clamp(0.0, 1.0))),
            "rx" | "cornerRadius" | "borderRadius" => {
                number(value).map(|n| patch.corner_radius = Some(n.max(0.0)))
            }
            "text" => value.as_str().map(|t| patch.text = Some(t.to_string())),
            "fontSize" => number(value).filter(|n| *n > 0.0).map(|n| patch.font_size = Some(n)),
            "fontFamily" => value.as_str().map(|f| patch.font_family = Some(f.to_string())),
            "fontWeight" => Some(patch.font_weight = Some(value.clone())),
            "textAlign" => value.as_str().map(|a| patch.text_align = Some(a.to_string())),
            "visible" => value.as_bool().map(|v| patch.visible = Some(v)),
            _ => None,
        };
        if handled.is_none() {
            ignored.push(key.clone());
        }
    }
    (patch, ignored)
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches("px").parse().ok(),
        _ => None,
    }
}

fn resize_element(host: &mut dyn SceneHost, a: &ResizeElement) -> Result<Applied, ExecError> {
    let directive = a.directive()?;
    let node = target(host, &a.target)?;
    let area = workspace_area(host);

    let base_w = if node.width > 0.0 { node.width } else { 100.0 };
    let base_h = if node.height > 0.0 { node.height } else { 100.0 };
    let cur_w = base_w * node.scale_x;
    let cur_h = base_h * node.scale_y;

    let (w, h) = match directive {
        ResizeDirective::Scale(s) => (cur_w * s, cur_h * s),
        ResizeDirective::IncreaseBy(by) => (cur_w + by, cur_h + by),
        ResizeDirective::DecreaseBy(by) => (cur_w - by, cur_h - by),
        ResizeDirective::Dimensions { width, height } => {
            (width.unwrap_or(cur_w), height.unwrap_or(cur_h))
        }
    };
    let w = clamp_size(w, area.width);
    let h = clamp_size(h, area.height);

    let mut left = node.left;
    let mut top = node.top;
    if left + w > area.right() {
        left = area.right() - w - EDGE_GAP;
    }
    if top + h > area.bottom() {
        top = area.bottom() - h - EDGE_GAP;
    }
    left = left.max(area.left);
    top = top.max(area.top);

    let patch = NodePatch {
        width: Some(base_w),
        height: Some(base_h),
        scale_x: Some(w / base_w),
        scale_y: Some(h / base_h),
        left: Some(left),
        top: Some(top),
        ..NodePatch::default()
    };
    host.update(&node.id, &patch)?;
    host.fire_modified(&node.id);
    host.set_selection(std::slice::from_ref(&node.id));
    Ok(Applied::on("Resized element", vec![node.id]))
}

/// At least the minimum size, never more than the workspace share.
fn clamp_size(size: f64, workspace: f64) -> f64 {
    size.max(MIN_ELEMENT_SIZE).min(workspace * MAX_WORKSPACE_SHARE)
}

fn delete_element(host: &mut dyn SceneHost, t: &Target) -> Result<Applied, ExecError> {
    let nodes = if t.is_implicit() {
        resolve_all(host, t)
    } else {
        vec![target(host, t)?]
    };
    if nodes.is_empty() {
        return Err(ExecError::TargetNotFound("No element selected".into()));
    }
    let mut ids = Vec::with_capacity(nodes.len());
    for node in nodes {
        host.remove(&node.id)?;
        ids.push(node.id);
    }
    host.set_selection(&[]);
    let message = if ids.len() == 1 {
        "Deleted element".to_string()
    } else {
        format!("Deleted {} element(s)", ids.len())
    };
    Ok(Applied::on(message, ids))
}

fn change_layer_order(
    host: &mut dyn SceneHost,
    a: &ChangeLayerOrder,
) -> Result<Applied, ExecError> {
    let node = target(host, &a.target)?;
    host.move_layer(&node.id, a.action)?;
    host.fire_modified(&node.id);
    Ok(Applied::on("Changed layer order", vec![node.id]))
}

struct Placement {
    spec: PositionSpec,
    margin_ratio: f64,
    name: Option<String>,
}

fn place_image(
    host: &mut dyn SceneHost,
    url: &str,
    (w0, h0): (f64, f64),
    scale: f64,
    placement: Placement,
) -> Result<String, ExecError> {
    let id = fresh_id(host, "image");
    let mut node = SceneNode::new(&id, "image").sized(w0, h0);
    node.scale_x = scale;
    node.scale_y = scale;
    node.src = Some(url.to_string());
    node.name = placement.name;
    let (left, top) = resolve_position(
        host,
        placement.spec,
        w0 * scale,
        h0 * scale,
        placement.margin_ratio,
    );
    node.left = left;
    node.top = top;
    host.add(node)?;
    Ok(id)
}

fn set_interactive(host: &mut dyn SceneHost, on: bool) {
    let patch = NodePatch::interactive(on);
    for node in host.objects() {
        if let Err(e) = host.update(&node.id, &patch) {
            warn!(id = %node.id, error = %e, "could not toggle interactivity");
        }
    }
}

fn intrinsic(info: ImageInfo) -> (f64, f64) {
    let w = if info.width > 0.0 { info.width } else { FALLBACK_IMAGE_SIZE };
    let h = if info.height > 0.0 { info.height } else { FALLBACK_IMAGE_SIZE };
    (w, h)
}

fn fit_scale(host: &dyn SceneHost, w0: f64, h0: f64) -> f64 {
    let area = workspace_area(host);
    (area.width * IMAGE_FIT_SHARE / w0)
        .min(area.height * IMAGE_FIT_SHARE / h0)
        .min(1.0)
}

/// First unused id of the form `<prefix>_<n>`.
fn fresh_id(host: &dyn SceneHost, prefix: &str) -> String {
    let mut n = host.objects().len() + 1;
    loop {
        let id = format!("{prefix}_{n}");
        if host.node(&id).is_none() {
            return id;
        }
        n += 1;
    }
}

/// A node for the given shape with its default size and colors.
fn shape_node(id: &str, a: &CreateShape) -> SceneNode {
    let (engine_type, fill, stroke) = match a.kind {
        ShapeKind::Rectangle => ("rect", "#3b82f6", "#1e40af"),
        ShapeKind::Circle => ("circle", "#ef4444", "#b91c1c"),
        ShapeKind::Triangle => ("triangle", "#22c55e", "#15803d"),
        ShapeKind::Diamond => ("rect", "#a855f7", "#7e22ce"),
        ShapeKind::Star => ("polygon", "#eab308", "#ca8a04"),
        ShapeKind::Hexagon | ShapeKind::Pentagon | ShapeKind::Octagon | ShapeKind::Arrow => {
            ("polygon", "#06b6d4", "#0891b2")
        }
        ShapeKind::Heart => ("path", "#06b6d4", "#0891b2"),
        ShapeKind::Line => ("line", "", "#000000"),
    };

    let (w, h) = match a.kind {
        ShapeKind::Circle => {
            let r = a.radius.or(a.width.map(|w| w / 2.0)).unwrap_or(50.0);
            (r * 2.0, r * 2.0)
        }
        ShapeKind::Diamond => {
            let side = a.width.or(a.height).unwrap_or(100.0);
            (side, side)
        }
        ShapeKind::Star
        | ShapeKind::Hexagon
        | ShapeKind::Pentagon
        | ShapeKind::Octagon
        | ShapeKind::Heart => {
            let r = a.radius.unwrap_or(50.0);
            (a.width.unwrap_or(r * 2.0), a.height.unwrap_or(r * 2.0))
        }
        ShapeKind::Line => (a.width.unwrap_or(100.0), a.height.unwrap_or(0.0)),
        ShapeKind::Rectangle | ShapeKind::Triangle | ShapeKind::Arrow => {
            (a.width.unwrap_or(100.0), a.height.unwrap_or(100.0))
        }
    };

    let mut node = SceneNode::new(id, engine_type).sized(w, h);
    node.fill = Paint::solid(fill);
    node.stroke = Paint::solid(stroke);
    node.stroke_width = if a.kind == ShapeKind::Line { 2.0 } else { 0.0 };
    if a.kind == ShapeKind::Diamond {
        node.angle = 45.0;
    }
    node
}
