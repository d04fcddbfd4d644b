//! The per-style-layer renderer: evaluates paint properties each frame,
//! maps visible tiles to render passes and keeps the layer's drawables in
//! step with its tile buckets.

use std::{
    cell::RefCell,
    collections::{BTreeSet, HashMap},
    rc::Rc,
};

use crate::{
    coords::OverscaledTileId,
    render::{
        drawable::{Drawable, DrawableUniforms, Segment},
        graphics::{GraphicsContext, MIN_REQUIRED_VERTEX_BINDINGS},
        layer_group::{LayerGroup, LayerGroupBase, LayerGroupPtr, TileLayerGroup},
        orchestrator::ChangeRequest,
        render_pass::{RenderPass, RenderPasses},
        source::{Bucket, BucketData, GeometryData, RenderSource, RenderTile},
    },
    style::{
        EvaluatedProperties, Immutable, LayerImpl, LayerType, PaintValues,
        PropertyEvaluationParameters, TransitionParameters, Visibility,
    },
    util::SimpleIdentity,
};

/// Counters for drawable churn, reported by the orchestrator.
#[derive(Copy, Clone, Debug, Default)]
pub struct LayerStats {
    pub drawables_added: usize,
    pub drawables_removed: usize,
}

struct PaintTransition {
    from: PaintValues,
    start: std::time::Instant,
    duration: std::time::Duration,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct TileBucketEntry {
    generation: u64,
    bucket_id: SimpleIdentity,
}

pub struct RenderLayer {
    base_impl: Immutable<LayerImpl>,
    evaluated: EvaluatedProperties,
    layer_index: i32,
    passes: RenderPasses,
    layer_group: Option<LayerGroupPtr>,
    render_tiles: Vec<Rc<RenderTile>>,
    /// One generation-tagged map from visible tile to the identity of the
    /// bucket its drawables were built from. Entries from the previous
    /// generation carry their bucket identity forward; entries that are no
    /// longer visible age out on the next `prepare`.
    tile_buckets: HashMap<OverscaledTileId, TileBucketEntry>,
    generation: u64,
    transition: Option<PaintTransition>,
    is_renderable: bool,
    has_render_failures: bool,
    pub stats: LayerStats,
}

impl RenderLayer {
    pub fn new(base_impl: Immutable<LayerImpl>, layer_index: i32) -> Self {
        let evaluated = EvaluatedProperties::evaluate(&base_impl, base_impl.paint);
        Self {
            base_impl,
            evaluated,
            layer_index,
            passes: RenderPasses::empty(),
            layer_group: None,
            render_tiles: Vec::new(),
            tile_buckets: HashMap::new(),
            generation: 0,
            transition: None,
            is_renderable: false,
            has_render_failures: false,
            stats: LayerStats::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.base_impl.id
    }

    pub fn base_impl(&self) -> &Immutable<LayerImpl> {
        &self.base_impl
    }

    pub fn layer_type(&self) -> LayerType {
        self.base_impl.layer_type
    }

    pub fn source_id(&self) -> Option<&str> {
        self.base_impl.source.as_deref()
    }

    pub fn layer_index(&self) -> i32 {
        self.layer_index
    }

    pub fn evaluated(&self) -> &EvaluatedProperties {
        &self.evaluated
    }

    pub fn layer_group(&self) -> Option<&LayerGroupPtr> {
        self.layer_group.as_ref()
    }

    pub fn render_tiles(&self) -> &[Rc<RenderTile>] {
        &self.render_tiles
    }

    pub fn has_render_pass(&self, pass: RenderPass) -> bool {
        self.passes.contains(pass.flag())
    }

    pub fn needs_rendering(&self) -> bool {
        !self.passes.is_empty() && self.base_impl.visibility != Visibility::None
    }

    pub fn supports_zoom(&self, zoom: f32) -> bool {
        self.base_impl.min_zoom <= zoom && self.base_impl.max_zoom >= zoom
    }

    /// Starts interpolating from the currently evaluated paint values to the
    /// descriptor's values.
    pub fn transition(&mut self, parameters: &TransitionParameters) {
        if parameters.duration.is_zero() {
            self.transition = None;
            return;
        }
        self.transition = Some(PaintTransition {
            from: self.evaluated.paint,
            start: parameters.now,
            duration: parameters.duration,
        });
    }

    /// Replaces the style descriptor. Existing drawables stay; they are
    /// replaced naturally once fresh buckets arrive.
    pub fn layer_changed(
        &mut self,
        parameters: &TransitionParameters,
        new_impl: Immutable<LayerImpl>,
    ) {
        self.base_impl = new_impl;
        self.transition(parameters);
    }

    /// Computes paint values for the current zoom, producing the immutable
    /// evaluated snapshot.
    pub fn evaluate(&mut self, parameters: &PropertyEvaluationParameters) {
        let target = self.base_impl.paint;
        let paint = match &self.transition {
            Some(transition) => {
                let elapsed = parameters
                    .now
                    .saturating_duration_since(transition.start)
                    .as_secs_f32();
                let t = (elapsed / transition.duration.as_secs_f32()).clamp(0.0, 1.0);
                if t >= 1.0 {
                    self.transition = None;
                    target
                } else {
                    lerp_paint(&transition.from, &target, t)
                }
            }
            None => target,
        };
        self.evaluated = EvaluatedProperties::evaluate(&self.base_impl, paint);
        if self.base_impl.layer_type == LayerType::Background {
            // Background layers have no tiles to derive passes from.
            self.passes = self.evaluated.passes;
        }
    }

    /// Pulls the current visible-tile snapshot and derives the render passes
    /// this layer needs by OR-ing each tile bucket's pass bitmask.
    pub fn prepare(&mut self, source: &dyn RenderSource) {
        debug_assert!(source.is_enabled());
        self.render_tiles = source.render_tiles();
        self.render_tiles.sort_by_key(|tile| tile.id);

        self.passes = RenderPasses::empty();
        for tile in &self.render_tiles {
            if let Some(bucket) = tile.bucket_for_layer(&self.base_impl.id) {
                self.passes |= bucket.passes;
            }
        }

        self.generation += 1;
        let generation = self.generation;
        for tile in &self.render_tiles {
            self.tile_buckets
                .entry(tile.id)
                .and_modify(|entry| entry.generation = generation)
                .or_insert(TileBucketEntry {
                    generation,
                    bucket_id: SimpleIdentity::EMPTY,
                });
        }
        self.tile_buckets
            .retain(|_, entry| entry.generation == generation);
    }

    pub fn has_render_tile(&self, tile_id: &OverscaledTileId) -> bool {
        self.tile_buckets.contains_key(tile_id)
    }

    pub fn render_tile_bucket_id(&self, tile_id: &OverscaledTileId) -> SimpleIdentity {
        self.tile_buckets
            .get(tile_id)
            .map_or(SimpleIdentity::EMPTY, |entry| entry.bucket_id)
    }

    /// Records which bucket the tile's drawables were built from. Returns
    /// whether the identity changed.
    pub fn set_render_tile_bucket_id(
        &mut self,
        tile_id: &OverscaledTileId,
        bucket_id: SimpleIdentity,
    ) -> bool {
        match self.tile_buckets.get_mut(tile_id) {
            Some(entry) if entry.bucket_id != bucket_id => {
                entry.bucket_id = bucket_id;
                true
            }
            _ => false,
        }
    }

    /// Visits every drawable registered for `(pass, tile_id)`, applying
    /// `update`. Drawables built from a bucket other than the tile's current
    /// one are stale and skipped; if nothing but stale drawables remain they
    /// are removed, so the caller can add fresh ones without leaving ghost
    /// geometry behind. Returns whether any drawable was updated.
    pub fn update_tile(
        &mut self,
        pass: RenderPass,
        tile_id: &OverscaledTileId,
        mut update: impl FnMut(&mut Drawable),
    ) -> bool {
        let Some(group) = self.layer_group.clone() else {
            return false;
        };
        let mut group = group.borrow_mut();
        let Some(tile_group) = group.downcast_mut::<TileLayerGroup>() else {
            return false;
        };

        let current_bucket = self.render_tile_bucket_id(tile_id);
        let mut updated = 0usize;
        let mut skipped = 0usize;
        tile_group.visit_drawables(pass, tile_id, |drawable| {
            if drawable.bucket_id == current_bucket && !current_bucket.is_empty() {
                update(drawable);
                updated += 1;
            } else {
                skipped += 1;
            }
        });

        if updated == 0 && skipped > 0 {
            let removed = tile_group.remove_drawables(pass, tile_id);
            self.stats.drawables_removed += removed.len();
        }
        updated > 0
    }

    pub fn remove_tile(&mut self, pass: RenderPass, tile_id: &OverscaledTileId) -> usize {
        let Some(group) = self.layer_group.clone() else {
            return 0;
        };
        let mut group = group.borrow_mut();
        let Some(tile_group) = group.downcast_mut::<TileLayerGroup>() else {
            return 0;
        };
        let n = tile_group.remove_drawables(pass, tile_id).len();
        self.stats.drawables_removed += n;
        n
    }

    pub fn remove_all_drawables(&mut self) -> usize {
        match &self.layer_group {
            Some(group) => {
                let count = group.borrow_mut().clear_drawables().len();
                self.stats.drawables_removed += count;
                count
            }
            None => 0,
        }
    }

    /// Creates or refreshes the layer group and its drawables against the
    /// current tile buckets. Must run on the render thread.
    #[tracing::instrument(skip_all, fields(layer = %self.base_impl.id))]
    pub fn update(&mut self, context: &dyn GraphicsContext, changes: &mut Vec<ChangeRequest>) {
        if self.base_impl.layer_type == LayerType::Background {
            self.update_background(context, changes);
            return;
        }
        if self.layer_group.is_none() {
            let group: LayerGroupPtr = Rc::new(RefCell::new(TileLayerGroup::new(
                self.layer_index,
                self.render_tiles.len(),
                self.base_impl.id.clone(),
            )));
            self.set_layer_group(Some(group), changes);
        }

        let stencil_tiles: BTreeSet<_> = self
            .render_tiles
            .iter()
            .map(|tile| tile.id.to_unwrapped())
            .collect();

        let tiles = self.render_tiles.clone();
        for tile in &tiles {
            let Some(bucket) = tile.bucket_for_layer(&self.base_impl.id) else {
                continue;
            };
            let paint = self.evaluated.paint;

            for pass in [RenderPass::Opaque, RenderPass::Translucent] {
                if !bucket.passes.contains(pass.flag()) {
                    continue;
                }
                let refreshed = self.update_tile(pass, &tile.id, |drawable| {
                    drawable.uniforms.color = paint.color.0;
                    drawable.uniforms.opacity = paint.opacity;
                });
                if refreshed {
                    continue;
                }
                if let Some(drawable) = self.build_drawable(context, pass, tile.id, bucket) {
                    self.add_drawable(pass, tile.id, drawable);
                }
            }
            self.set_render_tile_bucket_id(&tile.id, bucket.id);
        }

        if let Some(group) = &self.layer_group {
            let mut group = group.borrow_mut();
            if let Some(tile_group) = group.downcast_mut::<TileLayerGroup>() {
                tile_group.set_stencil_tiles(stencil_tiles);
                // Tiles that left the visible set take their drawables along.
                let visible: BTreeSet<_> = tiles.iter().map(|tile| tile.id).collect();
                let removed = tile_group.remove_drawables_if(|drawable| {
                    drawable
                        .tile_id
                        .map_or(false, |tile_id| !visible.contains(&tile_id))
                });
                self.stats.drawables_removed += removed.len();
            }
        }
    }

    /// Backgrounds have no tiles; they draw one full-coverage quad through a
    /// plain [`LayerGroup`], rebuilt only when the render pass flips.
    fn update_background(&mut self, context: &dyn GraphicsContext, changes: &mut Vec<ChangeRequest>) {
        if self.layer_group.is_none() {
            let group: LayerGroupPtr = Rc::new(RefCell::new(LayerGroup::new(
                self.layer_index,
                1,
                self.base_impl.id.clone(),
            )));
            self.set_layer_group(Some(group), changes);
        }

        let paint = self.evaluated.paint;
        let pass = if self.evaluated.passes.contains(RenderPasses::OPAQUE) {
            RenderPass::Opaque
        } else {
            RenderPass::Translucent
        };

        let Some(group) = &self.layer_group else {
            return;
        };
        let mut group = group.borrow_mut();
        let Some(plain) = group.downcast_mut::<LayerGroup>() else {
            return;
        };

        let mut refreshed = false;
        plain.visit_drawables(|drawable| {
            if drawable.pass == pass {
                drawable.uniforms.color = paint.color.0;
                drawable.uniforms.opacity = paint.opacity;
                refreshed = true;
            }
        });
        if refreshed {
            return;
        }

        self.stats.drawables_removed += plain.clear_drawables().len();

        let mut drawable = Drawable::new(
            self.base_impl.id.clone(),
            context.get_shader("background"),
            pass,
        );
        drawable.uniforms = DrawableUniforms {
            color: paint.color.0,
            opacity: paint.opacity,
            ..DrawableUniforms::default()
        };
        let quad = GeometryData::tile_quad();
        drawable.vertex_data = quad.vertices;
        drawable.index_data = quad.indices;
        drawable.segments = vec![Segment {
            index_offset: 0,
            index_count: 6,
        }];
        plain.add_drawable(drawable);
        self.stats.drawables_added += 1;
    }

    fn add_drawable(&mut self, pass: RenderPass, tile_id: OverscaledTileId, drawable: Drawable) {
        if let Some(group) = &self.layer_group {
            let mut group = group.borrow_mut();
            if let Some(tile_group) = group.downcast_mut::<TileLayerGroup>() {
                tile_group.add_drawable(pass, tile_id, drawable);
                self.stats.drawables_added += 1;
            }
        }
    }

    fn build_drawable(
        &self,
        context: &dyn GraphicsContext,
        pass: RenderPass,
        tile_id: OverscaledTileId,
        bucket: &Bucket,
    ) -> Option<Drawable> {
        let quad;
        let (shader_name, geometry, texture) = match &bucket.data {
            BucketData::Fill(geometry) => ("fill", geometry, None),
            BucketData::Line(geometry) => ("line", geometry, None),
            BucketData::Symbol(geometry) => ("symbol", geometry, None),
            BucketData::FillExtrusion(geometry) => ("fill-extrusion", geometry, None),
            BucketData::Raster {
                width,
                height,
                pixels,
            } => {
                // Rasters draw the static tile quad with the image bound.
                quad = GeometryData::tile_quad();
                (
                    "raster",
                    &quad,
                    Some(context.create_texture_2d(*width, *height, pixels)),
                )
            }
        };

        let mut drawable = Drawable::new(
            self.base_impl.id.clone(),
            context.get_shader(shader_name),
            pass,
        );
        drawable.tile_id = Some(tile_id);
        drawable.bucket_id = bucket.id;
        drawable.is_3d = matches!(bucket.data, BucketData::FillExtrusion(_));
        drawable.texture = texture;
        drawable.uniforms = DrawableUniforms {
            color: self.evaluated.paint.color.0,
            opacity: self.evaluated.paint.opacity,
            ..DrawableUniforms::default()
        };
        if geometry.indices.is_empty() {
            return None;
        }
        drawable.vertex_data = geometry.vertices.clone();
        drawable.index_data = geometry.indices.clone();
        drawable.segments = vec![Segment {
            index_offset: 0,
            // 16-bit indices
            index_count: (geometry.indices.len() / 2) as u32,
        }];
        Some(drawable)
    }

    /// Compares the number of vertex-attribute bindings the layer's
    /// data-driven paint properties need against the device limits. Reports
    /// at most once per layer, then goes quiet.
    pub fn check_renderability(&mut self, context: &dyn GraphicsContext, active_binding_count: u32) {
        if self.has_render_failures {
            return;
        }
        if active_binding_count > context.max_vertex_attribute_bindings() {
            log::error!(
                "The layer '{}' uses more data-driven properties than the current device \
                 supports, and will have rendering errors. To ensure compatibility with this \
                 device, use {} fewer data-driven properties in this layer.",
                self.base_impl.id,
                active_binding_count - MIN_REQUIRED_VERTEX_BINDINGS
            );
            self.has_render_failures = true;
        } else if active_binding_count > MIN_REQUIRED_VERTEX_BINDINGS {
            log::warn!(
                "The layer '{}' uses more data-driven properties than some devices may support. \
                 Though it will render correctly on this device, it may have rendering errors on \
                 other devices. To ensure compatibility with all devices, use {} fewer \
                 data-driven properties in this layer.",
                self.base_impl.id,
                active_binding_count - MIN_REQUIRED_VERTEX_BINDINGS
            );
            self.has_render_failures = true;
        }
    }

    pub fn has_render_failures(&self) -> bool {
        self.has_render_failures
    }

    pub fn layer_index_changed(&mut self, new_index: i32, changes: &mut Vec<ChangeRequest>) {
        self.layer_index = new_index;
        if let Some(group) = &self.layer_group {
            if group.borrow().layer_index() != new_index {
                changes.push(ChangeRequest::UpdateLayerGroupIndex(
                    Rc::clone(group),
                    new_index,
                ));
            }
        }
    }

    /// The render tree has decided whether this layer is in the renderable
    /// set for the frame.
    pub fn mark_renderable(&mut self, will_render: bool, changes: &mut Vec<ChangeRequest>) {
        self.is_renderable = will_render;
        Self::activate_layer_group(self.layer_group.as_ref(), will_render, changes);
    }

    pub fn layer_removed(&mut self, changes: &mut Vec<ChangeRequest>) {
        self.remove_all_drawables();
        Self::activate_layer_group(self.layer_group.as_ref(), false, changes);
    }

    pub fn set_layer_group(
        &mut self,
        layer_group: Option<LayerGroupPtr>,
        changes: &mut Vec<ChangeRequest>,
    ) {
        Self::activate_layer_group(self.layer_group.as_ref(), false, changes);
        self.layer_group = layer_group;
        Self::activate_layer_group(self.layer_group.as_ref(), self.is_renderable, changes);
    }

    fn activate_layer_group(
        layer_group: Option<&LayerGroupPtr>,
        activate: bool,
        changes: &mut Vec<ChangeRequest>,
    ) {
        if let Some(group) = layer_group {
            if activate {
                changes.push(ChangeRequest::AddLayerGroup(Rc::clone(group)));
            } else {
                changes.push(ChangeRequest::RemoveLayerGroup(Rc::clone(group)));
            }
        }
    }
}

fn lerp_paint(from: &PaintValues, to: &PaintValues, t: f32) -> PaintValues {
    let mut color = [0.0f32; 4];
    for (i, channel) in color.iter_mut().enumerate() {
        *channel = from.color.0[i] + (to.color.0[i] - from.color.0[i]) * t;
    }
    PaintValues {
        color: crate::style::Color(color),
        opacity: from.opacity + (to.opacity - from.opacity) * t,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        rc::Rc,
        sync::Arc,
        time::{Duration, Instant},
    };

    use super::RenderLayer;
    use crate::{
        coords::{CanonicalTileId, OverscaledTileId},
        render::{
            graphics::NopContext,
            layer_group::TileLayerGroup,
            paint_parameters::test_support::paint_parameters,
            render_pass::{RenderPass, RenderPasses},
            source::{Bucket, BucketData, GeometryData, MemoryRenderSource, RenderSource, RenderTile},
        },
        style::{LayerImpl, LayerType, PropertyEvaluationParameters, TransitionParameters},
        util::SimpleIdentity,
    };

    fn fill_layer(id: &str) -> RenderLayer {
        RenderLayer::new(Arc::new(LayerImpl::new(id, LayerType::Fill)), 0)
    }

    fn opaque_bucket() -> Arc<Bucket> {
        let mut geometry = GeometryData::default();
        geometry.vertices = vec![0u8; 16];
        geometry.indices = vec![0u8; 12];
        Arc::new(Bucket::new(BucketData::Fill(geometry), RenderPasses::OPAQUE))
    }

    fn source_with_tile(layer_id: &str, tile_id: OverscaledTileId, bucket: Arc<Bucket>) -> MemoryRenderSource {
        let source = MemoryRenderSource::new("composite");
        let mut tile = RenderTile::new(tile_id);
        tile.set_bucket(layer_id, bucket);
        source.set_tiles(vec![Rc::new(tile)]);
        source
    }

    #[test]
    fn a_single_root_tile_makes_the_layer_renderable() {
        let tile_id = OverscaledTileId::from_canonical(CanonicalTileId::new(0, 0, 0));
        let mut layer = fill_layer("water");
        let source = source_with_tile("water", tile_id, opaque_bucket());

        layer.evaluate(&PropertyEvaluationParameters {
            zoom: 0.0,
            now: Instant::now(),
        });
        layer.prepare(&source);

        assert!(layer.has_render_pass(RenderPass::Opaque));
        assert!(layer.needs_rendering());
    }

    #[test]
    fn stale_drawables_are_removed_when_the_bucket_changed() {
        let tile_id = OverscaledTileId::from_canonical(CanonicalTileId::new(1, 0, 0));
        let context = NopContext::new();
        let mut layer = fill_layer("water");

        let old_bucket = opaque_bucket();
        let source = source_with_tile("water", tile_id, old_bucket.clone());
        layer.prepare(&source);
        let mut changes = Vec::new();
        layer.update(&context, &mut changes);
        assert_eq!(layer.stats.drawables_added, 1);
        assert_eq!(layer.render_tile_bucket_id(&tile_id), old_bucket.id);

        // The tile reloads: same tile, different bucket identity.
        let new_bucket = opaque_bucket();
        let source = source_with_tile("water", tile_id, new_bucket.clone());
        layer.prepare(&source);
        assert_eq!(
            layer.render_tile_bucket_id(&tile_id),
            old_bucket.id,
            "bucket identity carries forward across prepare"
        );

        let updated = layer.update_tile(RenderPass::Opaque, &tile_id, |_| {});
        assert!(updated, "old drawables still match the carried-forward id");

        layer.set_render_tile_bucket_id(&tile_id, new_bucket.id);
        let updated = layer.update_tile(RenderPass::Opaque, &tile_id, |_| {});
        assert!(!updated);
        assert_eq!(layer.stats.drawables_removed, 1, "stale drawables dropped");

        let group = layer.layer_group().unwrap().borrow();
        assert!(group.is_empty());
    }

    #[test]
    fn update_replaces_drawables_after_a_reload() {
        let tile_id = OverscaledTileId::from_canonical(CanonicalTileId::new(1, 0, 0));
        let context = NopContext::new();
        let mut layer = fill_layer("water");
        let mut changes = Vec::new();

        let source = source_with_tile("water", tile_id, opaque_bucket());
        layer.prepare(&source);
        layer.update(&context, &mut changes);

        let new_bucket = opaque_bucket();
        let source = source_with_tile("water", tile_id, new_bucket.clone());
        layer.prepare(&source);
        layer.set_render_tile_bucket_id(&tile_id, new_bucket.id);
        layer.update(&context, &mut changes);

        assert_eq!(layer.stats.drawables_added, 2);
        assert_eq!(layer.stats.drawables_removed, 1);
        let group = layer.layer_group().unwrap().borrow();
        assert_eq!(group.drawable_count(), 1);
    }

    #[test]
    fn tiles_leaving_the_visible_set_drop_their_drawables() {
        let context = NopContext::new();
        let mut layer = fill_layer("water");
        let mut changes = Vec::new();
        let tile_a = OverscaledTileId::from_canonical(CanonicalTileId::new(1, 0, 0));
        let tile_b = OverscaledTileId::from_canonical(CanonicalTileId::new(1, 1, 0));

        let source = MemoryRenderSource::new("composite");
        let mut a = RenderTile::new(tile_a);
        a.set_bucket("water", opaque_bucket());
        let mut b = RenderTile::new(tile_b);
        b.set_bucket("water", opaque_bucket());
        source.set_tiles(vec![Rc::new(a.clone()), Rc::new(b)]);
        layer.prepare(&source);
        layer.update(&context, &mut changes);
        assert_eq!(layer.layer_group().unwrap().borrow().drawable_count(), 2);

        source.set_tiles(vec![Rc::new(a)]);
        layer.prepare(&source);
        assert!(!layer.has_render_tile(&tile_b));
        layer.update(&context, &mut changes);
        assert_eq!(layer.layer_group().unwrap().borrow().drawable_count(), 1);
    }

    #[test]
    fn raster_buckets_draw_the_tile_quad() {
        let tile_id = OverscaledTileId::from_canonical(CanonicalTileId::new(0, 0, 0));
        let context = Rc::new(NopContext::new());
        let mut impl_ = LayerImpl::new("satellite", LayerType::Raster);
        impl_.source = Some("satellite".to_string());
        let mut layer = RenderLayer::new(Arc::new(impl_), 0);

        let bucket = Arc::new(Bucket::new(
            BucketData::Raster {
                width: 2,
                height: 2,
                pixels: vec![0u8; 16],
            },
            RenderPasses::OPAQUE,
        ));
        let source = source_with_tile("satellite", tile_id, bucket);
        layer.prepare(&source);
        let mut changes = Vec::new();
        layer.update(context.as_ref(), &mut changes);
        assert_eq!(layer.stats.drawables_added, 1);

        let mut parameters = paint_parameters(context.clone(), RenderPass::Opaque);
        layer
            .layer_group()
            .unwrap()
            .borrow_mut()
            .render(&mut parameters);
        assert_eq!(context.draw_calls.get(), 1, "the quad is drawn");
    }

    #[test]
    fn background_layers_draw_one_unclipped_quad() {
        let context = Rc::new(NopContext::new());
        let mut layer =
            RenderLayer::new(Arc::new(LayerImpl::new("background", LayerType::Background)), 0);
        let evaluation = PropertyEvaluationParameters {
            zoom: 0.0,
            now: Instant::now(),
        };
        layer.evaluate(&evaluation);
        assert!(layer.needs_rendering());

        let mut changes = Vec::new();
        layer.update(context.as_ref(), &mut changes);
        layer.update(context.as_ref(), &mut changes);
        assert_eq!(layer.stats.drawables_added, 1, "second update refreshes in place");

        let mut parameters = paint_parameters(context.clone(), RenderPass::Opaque);
        layer
            .layer_group()
            .unwrap()
            .borrow_mut()
            .render(&mut parameters);
        assert_eq!(context.draw_calls.get(), 1);
        assert_eq!(context.stamped_masks.get(), 0, "no tile clipping for backgrounds");
    }

    #[test]
    fn a_background_pass_flip_rebuilds_the_drawable() {
        let context = Rc::new(NopContext::new());
        let mut layer =
            RenderLayer::new(Arc::new(LayerImpl::new("background", LayerType::Background)), 0);
        let evaluation = PropertyEvaluationParameters {
            zoom: 0.0,
            now: Instant::now(),
        };
        let mut changes = Vec::new();
        layer.evaluate(&evaluation);
        layer.update(context.as_ref(), &mut changes);
        assert!(layer.has_render_pass(RenderPass::Opaque));

        let mut faded = LayerImpl::new("background", LayerType::Background);
        faded.paint.opacity = 0.5;
        layer.layer_changed(
            &TransitionParameters {
                now: Instant::now(),
                duration: Duration::ZERO,
            },
            Arc::new(faded),
        );
        layer.evaluate(&evaluation);
        layer.update(context.as_ref(), &mut changes);

        assert!(layer.has_render_pass(RenderPass::Translucent));
        assert_eq!(layer.stats.drawables_added, 2);
        assert_eq!(layer.stats.drawables_removed, 1);
    }

    #[test]
    fn renderability_problems_are_reported_once_per_layer() {
        let context = NopContext::with_vertex_bindings(16);
        let mut layer = fill_layer("busy");

        layer.check_renderability(&context, 12);
        assert!(layer.has_render_failures());

        // Exceeding the hard limit afterwards stays quiet too.
        layer.check_renderability(&context, 32);
        assert!(layer.has_render_failures());
    }

    #[test]
    fn zoom_support_is_a_range_check() {
        let mut impl_ = LayerImpl::new("roads", LayerType::Line);
        impl_.min_zoom = 4.0;
        impl_.max_zoom = 10.0;
        let layer = RenderLayer::new(Arc::new(impl_), 0);

        assert!(!layer.supports_zoom(3.9));
        assert!(layer.supports_zoom(4.0));
        assert!(layer.supports_zoom(10.0));
        assert!(!layer.supports_zoom(10.1));
    }

    #[test]
    fn disabled_sources_are_a_caller_error() {
        // prepare() requires an enabled source; the gate lives in the
        // orchestrator. Exercise the gate predicate only.
        let mut source = MemoryRenderSource::new("composite");
        source.set_enabled(false);
        assert!(!source.is_enabled());
    }

    #[test]
    fn update_tile_without_a_group_reports_nothing_updated() {
        let tile_id = OverscaledTileId::from_canonical(CanonicalTileId::new(0, 0, 0));
        let mut layer = fill_layer("water");
        assert!(!layer.update_tile(RenderPass::Opaque, &tile_id, |_| {}));
    }

    #[test]
    fn layer_group_changes_are_staged_not_applied() {
        let mut layer = fill_layer("water");
        let mut changes = Vec::new();
        let group: crate::render::layer_group::LayerGroupPtr = Rc::new(std::cell::RefCell::new(
            TileLayerGroup::new(0, 0, "water"),
        ));
        layer.mark_renderable(true, &mut changes);
        layer.set_layer_group(Some(group), &mut changes);
        assert!(!changes.is_empty());
    }

    #[test]
    fn empty_bucket_ids_never_match_existing_drawables() {
        assert!(SimpleIdentity::EMPTY.is_empty());
    }
}
