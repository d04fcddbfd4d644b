//! The top-level per-frame coordinator. Owns every render layer and render
//! source, builds the render tree for a frame, applies staged layer-group
//! changes on the render thread and routes queries against the current tile
//! set.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};

use bytemuck_derive::{Pod, Zeroable};

use crate::{
    coords::OverscaledTileId,
    render::{
        graphics::GraphicsContext,
        layer_group::LayerGroupPtr,
        paint_parameters::{PaintParameters, TransformParameters},
        render_layer::RenderLayer,
        render_pass::RenderPass,
        source::RenderSource,
    },
    scheduler::{bind_once, SchedulerHandle, TaskTag},
    style::{Immutable, LayerImpl, PropertyEvaluationParameters, TransitionParameters},
    util::SimpleIdentity,
};

/// A staged mutation of the render-thread layer-group registry. Visibility
/// decisions are made while the render tree is built; the registry itself is
/// only touched in [`RenderOrchestrator::process_changes`], so the drawing
/// pass never observes it mid-mutation.
pub enum ChangeRequest {
    AddLayerGroup(LayerGroupPtr),
    RemoveLayerGroup(LayerGroupPtr),
    UpdateLayerGroupIndex(LayerGroupPtr, i32),
}

/// Fan-out target for events the orchestrator observes from the lower-level
/// managers.
pub trait RendererObserver {
    fn on_tile_changed(&self, _source: &str, _tile_id: &OverscaledTileId) {}
    fn on_style_image_missing(&self, _image: &str) {}
    fn on_glyphs_error(&self, _font_stack: &str, _error: &str) {}
    fn on_remove_unused_style_images(&self, _images: &[String]) {}
}

/// The style snapshot an update works from.
pub struct UpdateParameters {
    pub zoom: f64,
    pub now: Instant,
    pub transition_duration: Duration,
    pub layers: Vec<Immutable<LayerImpl>>,
    pub sources: Vec<Rc<dyn RenderSource>>,
}

/// The immutable output of [`RenderOrchestrator::create_render_tree`]: the
/// layers to draw this frame, in draw order.
pub struct RenderTree {
    pub layer_ids: Vec<String>,
    pub opaque_pass_cutoff: u32,
}

/// Per-frame global uniform data, bound once before any layer draws.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct GlobalUniforms {
    proj_matrix: [[f32; 4]; 4],
    zoom: f32,
    pixel_ratio: f32,
    _pad: [f32; 2],
}

pub struct RenderOrchestrator {
    context: Rc<dyn GraphicsContext>,
    render_layers: HashMap<String, RenderLayer>,
    /// Style order of the layer ids, bottom to top.
    layer_order: Vec<String>,
    render_sources: HashMap<String, Rc<dyn RenderSource>>,
    /// Registry of active layer groups keyed by (z-order, identity). A
    /// layer's index can change without rebuilding the collection.
    layer_groups_by_index: BTreeMap<(i32, SimpleIdentity), LayerGroupPtr>,
    staged_changes: Vec<ChangeRequest>,
    observer: Option<Rc<dyn RendererObserver>>,
    feature_states: HashMap<String, HashMap<u64, HashMap<String, String>>>,
    pending_image_callbacks: HashMap<String, Vec<Box<dyn FnMut() + Send>>>,
    frame_count: u64,
}

impl RenderOrchestrator {
    pub fn new(context: Rc<dyn GraphicsContext>) -> Self {
        Self {
            context,
            render_layers: HashMap::new(),
            layer_order: Vec::new(),
            render_sources: HashMap::new(),
            layer_groups_by_index: BTreeMap::new(),
            staged_changes: Vec::new(),
            observer: None,
            feature_states: HashMap::new(),
            pending_image_callbacks: HashMap::new(),
            frame_count: 0,
        }
    }

    pub fn set_observer(&mut self, observer: Rc<dyn RendererObserver>) {
        self.observer = Some(observer);
    }

    pub fn render_layer(&self, id: &str) -> Option<&RenderLayer> {
        self.render_layers.get(id)
    }

    pub fn layer_group_count(&self) -> usize {
        self.layer_groups_by_index.len()
    }

    /// Applies a style diff incrementally. Layers that persist with the same
    /// id and type are reused; a type change destroys and recreates the
    /// render layer.
    #[tracing::instrument(skip_all)]
    pub fn update(&mut self, parameters: &UpdateParameters) {
        let transition = TransitionParameters {
            now: parameters.now,
            duration: parameters.transition_duration,
        };
        let mut changes = Vec::new();

        let incoming: HashSet<&str> = parameters.layers.iter().map(|l| l.id.as_str()).collect();
        let removed: Vec<String> = self
            .render_layers
            .keys()
            .filter(|id| !incoming.contains(id.as_str()))
            .cloned()
            .collect();
        for id in removed {
            if let Some(mut layer) = self.render_layers.remove(&id) {
                layer.layer_removed(&mut changes);
            }
            self.layer_order.retain(|existing| *existing != id);
        }

        self.layer_order = parameters.layers.iter().map(|l| l.id.clone()).collect();
        for (index, layer_impl) in parameters.layers.iter().enumerate() {
            let index = index as i32;
            match self.render_layers.get_mut(&layer_impl.id) {
                Some(layer) if layer.layer_type() == layer_impl.layer_type => {
                    if !Arc::ptr_eq(layer_impl, layer.base_impl()) {
                        layer.layer_changed(&transition, Arc::clone(layer_impl));
                    }
                    if layer.layer_index() != index {
                        layer.layer_index_changed(index, &mut changes);
                    }
                }
                Some(_) => {
                    // Type changed; the old drawables are useless.
                    let mut old = self.render_layers.remove(&layer_impl.id).unwrap();
                    old.layer_removed(&mut changes);
                    self.render_layers.insert(
                        layer_impl.id.clone(),
                        RenderLayer::new(Arc::clone(layer_impl), index),
                    );
                }
                None => {
                    self.render_layers.insert(
                        layer_impl.id.clone(),
                        RenderLayer::new(Arc::clone(layer_impl), index),
                    );
                }
            }
        }

        self.render_sources = parameters
            .sources
            .iter()
            .map(|source| (source.name().to_string(), Rc::clone(source)))
            .collect();

        let evaluation = PropertyEvaluationParameters {
            zoom: parameters.zoom,
            now: parameters.now,
        };
        for id in &self.layer_order {
            let Some(layer) = self.render_layers.get_mut(id) else {
                continue;
            };
            layer.evaluate(&evaluation);
            if let Some(source) = layer.source_id().and_then(|s| self.render_sources.get(s)) {
                if source.is_enabled() {
                    layer.prepare(source.as_ref());
                }
            }
            if layer.needs_rendering() && layer.supports_zoom(parameters.zoom as f32) {
                layer.update(self.context.as_ref(), &mut changes);
            }
        }

        self.add_changes(changes);
    }

    /// Builds the ordered, filtered list of layers for the frame. Also
    /// stages (de)activation of each layer's group; orchestrator state
    /// beyond that staging is untouched.
    pub fn create_render_tree(&mut self, zoom: f64) -> RenderTree {
        let mut changes = Vec::new();
        let mut layer_ids = Vec::new();
        let mut opaque_pass_cutoff = 0u32;
        let mut below_is_opaque = true;

        for id in &self.layer_order.clone() {
            let Some(layer) = self.render_layers.get_mut(id) else {
                continue;
            };
            let renderable = layer.needs_rendering() && layer.supports_zoom(zoom as f32);
            layer.mark_renderable(renderable, &mut changes);
            if !renderable {
                below_is_opaque = false;
                continue;
            }
            // Layers under an unbroken run of opaque background draws can
            // skip the depth test.
            if below_is_opaque
                && layer.layer_type() == crate::style::LayerType::Background
                && layer.evaluated().paint.opacity >= 1.0
            {
                opaque_pass_cutoff = layer_ids.len() as u32 + 1;
            } else {
                below_is_opaque = false;
            }
            layer_ids.push(id.clone());
        }

        self.add_changes(changes);
        RenderTree {
            layer_ids,
            opaque_pass_cutoff,
        }
    }

    pub fn add_changes(&mut self, changes: Vec<ChangeRequest>) {
        self.staged_changes.extend(changes);
    }

    /// Applies every staged change. Must run on the render thread, after all
    /// of the frame's updates have been collected.
    pub fn process_changes(&mut self) {
        for change in std::mem::take(&mut self.staged_changes) {
            match change {
                ChangeRequest::AddLayerGroup(group) => {
                    let key = {
                        let group = group.borrow();
                        (group.layer_index(), group.id())
                    };
                    self.layer_groups_by_index.insert(key, group);
                }
                ChangeRequest::RemoveLayerGroup(group) => {
                    let id = group.borrow().id();
                    self.layer_groups_by_index.retain(|(_, key_id), _| *key_id != id);
                }
                ChangeRequest::UpdateLayerGroupIndex(group, new_index) => {
                    let id = group.borrow().id();
                    let was_registered = {
                        let before = self.layer_groups_by_index.len();
                        self.layer_groups_by_index.retain(|(_, key_id), _| *key_id != id);
                        self.layer_groups_by_index.len() != before
                    };
                    group.borrow_mut().update_layer_index(new_index);
                    if was_registered {
                        self.layer_groups_by_index.insert((new_index, id), group);
                    }
                }
            }
        }
    }

    /// Draws one frame: binds the global uniforms, walks the layer groups in
    /// index order for each pass, then unbinds.
    #[tracing::instrument(skip_all)]
    pub fn render_frame(
        &mut self,
        tree: &RenderTree,
        transform: TransformParameters,
        pixel_ratio: f32,
    ) {
        self.process_changes();

        let mut parameters = PaintParameters::new(
            Rc::clone(&self.context),
            transform,
            pixel_ratio,
            tree.layer_ids.len(),
            self.frame_count,
        );
        parameters.opaque_pass_cutoff = tree.opaque_pass_cutoff;

        let proj = transform.proj_matrix;
        let globals = GlobalUniforms {
            proj_matrix: [
                [proj.x.x as f32, proj.x.y as f32, proj.x.z as f32, proj.x.w as f32],
                [proj.y.x as f32, proj.y.y as f32, proj.y.z as f32, proj.y.w as f32],
                [proj.z.x as f32, proj.z.y as f32, proj.z.z as f32, proj.z.w as f32],
                [proj.w.x as f32, proj.w.y as f32, proj.w.z as f32, proj.w.w as f32],
            ],
            zoom: transform.state.zoom as f32,
            pixel_ratio,
            _pad: [0.0; 2],
        };
        self.context.bind_global_uniforms(bytemuck::bytes_of(&globals));

        let groups: Vec<LayerGroupPtr> = self.layer_groups_by_index.values().cloned().collect();

        // Opaque front-to-back, translucent back-to-front.
        parameters.pass = RenderPass::Opaque;
        for (position, group) in groups.iter().enumerate().rev() {
            parameters.current_layer = position as u32;
            group.borrow_mut().render(&mut parameters);
        }
        parameters.pass = RenderPass::Translucent;
        for (position, group) in groups.iter().enumerate() {
            parameters.current_layer = position as u32;
            group.borrow_mut().render(&mut parameters);
        }

        self.context.unbind_global_uniforms();
        self.frame_count += 1;
    }

    /// Features at a point given in tile units, walked top-down through the
    /// drawn layers. Safe to call between frames; it only reads the current
    /// `render_tiles` snapshots.
    pub fn query_rendered_features(&self, x: f64, y: f64) -> Vec<(String, u64)> {
        let mut results = Vec::new();
        for id in self.layer_order.iter().rev() {
            let Some(layer) = self.render_layers.get(id) else {
                continue;
            };
            if !layer.needs_rendering() {
                continue;
            }
            for tile in layer.render_tiles() {
                if let Some(bucket) = tile.bucket_for_layer(id) {
                    for feature in bucket.query(x, y) {
                        results.push((id.clone(), feature.feature_id));
                    }
                }
            }
        }
        results
    }

    /// Every indexed feature the named source currently exposes.
    pub fn query_source_features(&self, source_id: &str) -> Vec<u64> {
        let Some(source) = self.render_sources.get(source_id) else {
            return Vec::new();
        };
        let mut results = Vec::new();
        for tile in source.render_tiles() {
            for id in &self.layer_order {
                if let Some(bucket) = tile.bucket_for_layer(id) {
                    results.extend(bucket.features().iter().map(|f| f.feature_id));
                }
            }
        }
        results
    }

    pub fn set_feature_state(
        &mut self,
        source_id: &str,
        feature_id: u64,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.feature_states
            .entry(source_id.to_string())
            .or_default()
            .entry(feature_id)
            .or_default()
            .insert(key.into(), value.into());
    }

    pub fn get_feature_state(&self, source_id: &str, feature_id: u64, key: &str) -> Option<&str> {
        self.feature_states
            .get(source_id)?
            .get(&feature_id)?
            .get(key)
            .map(String::as_str)
    }

    /// Removes one key, or the feature's whole state when `key` is `None`.
    pub fn remove_feature_state(&mut self, source_id: &str, feature_id: u64, key: Option<&str>) {
        let Some(features) = self.feature_states.get_mut(source_id) else {
            return;
        };
        match key {
            Some(key) => {
                if let Some(state) = features.get_mut(&feature_id) {
                    state.remove(key);
                }
            }
            None => {
                features.remove(&feature_id);
            }
        }
    }

    /// A source's tile changed; re-dispatch to the renderer observer.
    pub fn on_tile_changed(&self, source: &str, tile_id: &OverscaledTileId) {
        if let Some(observer) = &self.observer {
            observer.on_tile_changed(source, tile_id);
        }
    }

    /// A layer referenced a style image that is not loaded yet. `done` is
    /// scheduled back onto the caller exactly once when the image arrives,
    /// no matter how often the image manager announces it.
    pub fn on_style_image_missing<F>(
        &mut self,
        image: &str,
        reply_to: SchedulerHandle,
        tag: TaskTag,
        done: F,
    ) where
        F: FnOnce() + Send + 'static,
    {
        self.pending_image_callbacks
            .entry(image.to_string())
            .or_default()
            .push(Box::new(bind_once(reply_to, tag, done)));
        if let Some(observer) = &self.observer {
            observer.on_style_image_missing(image);
        }
    }

    /// The image manager announces an image; fires any pending callbacks.
    pub fn on_style_image_available(&mut self, image: &str) {
        if let Some(mut callbacks) = self.pending_image_callbacks.remove(image) {
            for callback in &mut callbacks {
                callback();
            }
        }
    }

    pub fn on_glyphs_error(&self, font_stack: &str, error: &str) {
        log::error!("glyph load failure for '{font_stack}': {error}");
        if let Some(observer) = &self.observer {
            observer.on_glyphs_error(font_stack, error);
        }
    }

    pub fn on_remove_unused_style_images(&self, images: &[String]) {
        if let Some(observer) = &self.observer {
            observer.on_remove_unused_style_images(images);
        }
    }
}
