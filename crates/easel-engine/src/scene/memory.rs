use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use easel_core::actions::LayerMove;
use easel_core::position::Rect;

use super::{
    HostError, ImageInfo, NodePatch, Paint, SceneHost, SceneNode, Workspace, WORKSPACE_MARKER,
};

/// Size reported for images nobody registered a size for.
pub const DEFAULT_IMAGE_SIZE: ImageInfo = ImageInfo {
    width: 800.0,
    height: 600.0,
};

/// A scene held entirely in memory.
///
/// Loads from and saves to the same JSON document shape, so it doubles as the
/// file format of the command line tool.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InMemoryScene {
    /// All nodes bottom to top, the workspace marker included.
    #[serde(default)]
    objects: Vec<SceneNode>,
    #[serde(default)]
    selection: Vec<String>,
    #[serde(default)]
    background: Paint,
    /// Known image sizes by URL.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    images: HashMap<String, ImageInfo>,
    #[serde(skip)]
    modified: Vec<String>,
    #[serde(skip)]
    renders: usize,
    #[serde(skip)]
    saves: usize,
}

impl InMemoryScene {
    pub fn new() -> Self {
        Self::default()
    }

    /// A scene with a white workspace of the given size at the origin.
    pub fn with_workspace(width: f64, height: f64) -> Self {
        let mut workspace = SceneNode::new("workspace", "rect").sized(width, height);
        workspace.name = Some(WORKSPACE_MARKER.to_string());
        workspace.fill = Paint::solid("#ffffff");
        workspace.selectable = false;
        workspace.evented = false;
        Self {
            objects: vec![workspace],
            ..Self::default()
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Add a node and return `self`, for building fixtures.
    pub fn with(mut self, node: SceneNode) -> Self {
        self.objects.push(node);
        self
    }

    pub fn register_image(&mut self, url: impl Into<String>, info: ImageInfo) {
        self.images.insert(url.into(), info);
    }

    /// Ids passed to `fire_modified`, in order.
    pub fn modified(&self) -> &[String] {
        &self.modified
    }

    pub fn render_count(&self) -> usize {
        self.renders
    }

    pub fn save_count(&self) -> usize {
        self.saves
    }

    /// Every node, bottom to top, workspace marker included.
    pub fn all_nodes(&self) -> &[SceneNode] {
        &self.objects
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.objects.iter().position(|n| n.id == id)
    }

    fn floor(&self) -> usize {
        usize::from(self.objects.first().is_some_and(SceneNode::is_workspace))
    }
}

#[async_trait]
impl SceneHost for InMemoryScene {
    fn objects(&self) -> Vec<SceneNode> {
        self.objects.iter().filter(|n| !n.is_workspace()).cloned().collect()
    }

    fn node(&self, id: &str) -> Option<SceneNode> {
        self.objects.iter().find(|n| n.id == id).cloned()
    }

    fn workspace(&self) -> Option<Workspace> {
        self.objects.iter().find(|n| n.is_workspace()).map(|n| Workspace {
            bounds: Rect::new(n.left, n.top, n.rendered_width(), n.rendered_height()),
            fill: n.fill.clone(),
        })
    }

    fn background(&self) -> Paint {
        self.background.clone()
    }

    fn set_background(&mut self, paint: Paint) {
        self.background = paint;
    }

    fn set_workspace_fill(&mut self, paint: Paint) -> Result<(), HostError> {
        let ws = self
            .objects
            .iter_mut()
            .find(|n| n.is_workspace())
            .ok_or(HostError::NoWorkspace)?;
        ws.fill = paint;
        Ok(())
    }

    fn selection(&self) -> Vec<String> {
        self.selection.clone()
    }

    fn set_selection(&mut self, ids: &[String]) {
        self.selection = ids
            .iter()
            .filter(|id| self.objects.iter().any(|n| &n.id == *id && !n.is_workspace()))
            .cloned()
            .collect();
    }

    fn add(&mut self, node: SceneNode) -> Result<(), HostError> {
        if node.id.is_empty() || self.index_of(&node.id).is_some() {
            return Err(HostError::Rejected(format!("duplicate or empty id '{}'", node.id)));
        }
        self.objects.push(node);
        Ok(())
    }

    fn remove(&mut self, id: &str) -> Result<SceneNode, HostError> {
        let idx = self.index_of(id).ok_or_else(|| HostError::NotFound(id.to_string()))?;
        if self.objects[idx].is_workspace() {
            return Err(HostError::Rejected("the workspace cannot be removed".into()));
        }
        self.selection.retain(|s| s != id);
        Ok(self.objects.remove(idx))
    }

    fn update(&mut self, id: &str, patch: &NodePatch) -> Result<(), HostError> {
        let node = self
            .objects
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| HostError::NotFound(id.to_string()))?;
        patch.apply(node);
        Ok(())
    }

    fn move_layer(&mut self, id: &str, mv: LayerMove) -> Result<(), HostError> {
        let idx = self.index_of(id).ok_or_else(|| HostError::NotFound(id.to_string()))?;
        let floor = self.floor();
        if idx < floor {
            return Err(HostError::Rejected("the workspace stays at the back".into()));
        }
        let last = self.objects.len() - 1;
        let target = match mv {
            LayerMove::BringForward => (idx + 1).min(last),
            LayerMove::SendBackward => idx.saturating_sub(1).max(floor),
            LayerMove::BringToFront => last,
            LayerMove::SendToBack => floor,
        };
        let node = self.objects.remove(idx);
        self.objects.insert(target, node);
        Ok(())
    }

    fn fire_modified(&mut self, id: &str) {
        self.modified.push(id.to_string());
    }

    fn request_render(&mut self) {
        self.renders += 1;
    }

    async fn persist(&mut self) -> Result<(), HostError> {
        self.saves += 1;
        Ok(())
    }

    async fn load_image(&mut self, url: &str) -> Result<ImageInfo, HostError> {
        if url.trim().is_empty() {
            return Err(HostError::Image("empty url".into()));
        }
        Ok(self.images.get(url).copied().unwrap_or(DEFAULT_IMAGE_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene() -> InMemoryScene {
        InMemoryScene::with_workspace(400.0, 300.0)
            .with(SceneNode::new("a", "rect"))
            .with(SceneNode::new("b", "circle"))
            .with(SceneNode::new("c", "textbox"))
    }

    fn order(scene: &InMemoryScene) -> Vec<String> {
        scene.objects().into_iter().map(|n| n.id).collect()
    }

    #[test]
    fn workspace_is_hidden_from_objects() {
        let s = scene();
        assert_eq!(order(&s), vec!["a", "b", "c"]);
        assert_eq!(s.workspace().unwrap().bounds, Rect::new(0.0, 0.0, 400.0, 300.0));
    }

    #[test]
    fn send_to_back_stays_above_workspace() {
        let mut s = scene();
        s.move_layer("c", LayerMove::SendToBack).unwrap();
        assert_eq!(order(&s), vec!["c", "a", "b"]);
        assert!(s.all_nodes()[0].is_workspace());

        s.move_layer("c", LayerMove::SendBackward).unwrap();
        assert!(s.all_nodes()[0].is_workspace());
        s.move_layer("a", LayerMove::BringToFront).unwrap();
        assert_eq!(order(&s), vec!["c", "b", "a"]);
    }

    #[test]
    fn selection_ignores_unknown_ids() {
        let mut s = scene();
        s.set_selection(&["b".into(), "zzz".into(), "workspace".into()]);
        assert_eq!(s.selection(), vec!["b".to_string()]);
        s.remove("b").unwrap();
        assert!(s.selection().is_empty());
    }

    #[test]
    fn json_round_trip_keeps_layout() {
        let s = scene();
        let back = InMemoryScene::from_json(&s.to_json().unwrap()).unwrap();
        assert_eq!(order(&back), order(&s));
        assert!(back.workspace().is_some());
    }

    #[tokio::test]
    async fn image_sizes_come_from_registry() {
        let mut s = scene();
        s.register_image("https://x/cat.png", ImageInfo { width: 10.0, height: 20.0 });
        assert_eq!(s.load_image("https://x/cat.png").await.unwrap().width, 10.0);
        assert_eq!(s.load_image("https://x/dog.png").await.unwrap(), DEFAULT_IMAGE_SIZE);
        assert!(s.load_image(" ").await.is_err());
    }
}
