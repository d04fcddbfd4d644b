//! A layer-like group of drawables, not a group of layers.

use std::{cell::RefCell, collections::BTreeMap, collections::BTreeSet, rc::Rc};

use downcast_rs::{impl_downcast, Downcast};

use crate::{
    coords::{OverscaledTileId, UnwrappedTileId},
    render::{drawable::Drawable, paint_parameters::PaintParameters, render_pass::RenderPass},
    util::SimpleIdentity,
};

/// Shared handle to a layer group. Layer groups live on the render thread
/// only, so `Rc` rather than `Arc`.
pub type LayerGroupPtr = Rc<RefCell<dyn LayerGroupBase>>;

/// The contract every drawable collection fulfils, whether keyed by tile or
/// not. Concrete groups are recovered by downcasting where a caller needs
/// tile-scoped operations.
pub trait LayerGroupBase: Downcast {
    fn id(&self) -> SimpleIdentity;
    fn name(&self) -> &str;
    fn enabled(&self) -> bool;
    fn set_enabled(&mut self, value: bool);
    fn layer_index(&self) -> i32;
    fn update_layer_index(&mut self, value: i32);

    fn drawable_count(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.drawable_count() == 0
    }

    /// Clears the drawable collection, returning the removed drawables so
    /// the caller can hand them to a deferred release.
    fn clear_drawables(&mut self) -> Vec<Drawable>;

    /// Called once per pass; draws every enabled drawable registered for
    /// `parameters.pass`.
    fn render(&mut self, parameters: &mut PaintParameters);
}

impl_downcast!(LayerGroupBase);

/// A layer group for non-tile-based drawables (background layers,
/// off-screen passes).
pub struct LayerGroup {
    id: SimpleIdentity,
    name: String,
    enabled: bool,
    layer_index: i32,
    drawables: Vec<Drawable>,
}

impl LayerGroup {
    pub fn new(layer_index: i32, initial_capacity: usize, name: impl Into<String>) -> Self {
        Self {
            id: SimpleIdentity::unique(),
            name: name.into(),
            enabled: true,
            layer_index,
            drawables: Vec::with_capacity(initial_capacity),
        }
    }

    pub fn add_drawable(&mut self, drawable: Drawable) {
        self.drawables.push(drawable);
    }

    pub fn remove_drawables(&mut self, pass: RenderPass) -> Vec<Drawable> {
        let (removed, kept) = std::mem::take(&mut self.drawables)
            .into_iter()
            .partition(|d| d.pass == pass);
        self.drawables = kept;
        removed
    }

    pub fn visit_drawables(&mut self, mut f: impl FnMut(&mut Drawable)) -> usize {
        for drawable in &mut self.drawables {
            f(drawable);
        }
        self.drawables.len()
    }
}

impl LayerGroupBase for LayerGroup {
    fn id(&self) -> SimpleIdentity {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, value: bool) {
        self.enabled = value;
    }

    fn layer_index(&self) -> i32 {
        self.layer_index
    }

    fn update_layer_index(&mut self, value: i32) {
        self.layer_index = value;
    }

    fn drawable_count(&self) -> usize {
        self.drawables.len()
    }

    fn clear_drawables(&mut self) -> Vec<Drawable> {
        std::mem::take(&mut self.drawables)
    }

    fn render(&mut self, parameters: &mut PaintParameters) {
        if !self.enabled {
            return;
        }
        for drawable in &mut self.drawables {
            if drawable.pass == parameters.pass {
                drawable.draw(parameters);
            }
        }
    }
}

/// A layer group for tile-based drawables, indexed by
/// `(RenderPass, OverscaledTileId)` for per-tile removal.
pub struct TileLayerGroup {
    id: SimpleIdentity,
    name: String,
    enabled: bool,
    layer_index: i32,
    drawables_by_tile: BTreeMap<(RenderPass, OverscaledTileId), Vec<Drawable>>,
    /// When stencil clipping is enabled for the layer, the set of tile IDs
    /// that must be stamped into the stencil buffer before drawing.
    stencil_tiles: BTreeSet<UnwrappedTileId>,
}

impl TileLayerGroup {
    pub fn new(layer_index: i32, _initial_capacity: usize, name: impl Into<String>) -> Self {
        Self {
            id: SimpleIdentity::unique(),
            name: name.into(),
            enabled: true,
            layer_index,
            drawables_by_tile: BTreeMap::new(),
            stencil_tiles: BTreeSet::new(),
        }
    }

    pub fn add_drawable(&mut self, pass: RenderPass, tile_id: OverscaledTileId, drawable: Drawable) {
        debug_assert_eq!(drawable.pass, pass);
        self.drawables_by_tile
            .entry((pass, tile_id))
            .or_default()
            .push(drawable);
    }

    pub fn drawable_count_for(&self, pass: RenderPass, tile_id: &OverscaledTileId) -> usize {
        self.drawables_by_tile
            .get(&(pass, *tile_id))
            .map_or(0, Vec::len)
    }

    /// Removes the drawables registered for exactly this pass and tile,
    /// returning them for deferred release.
    pub fn remove_drawables(&mut self, pass: RenderPass, tile_id: &OverscaledTileId) -> Vec<Drawable> {
        self.drawables_by_tile
            .remove(&(pass, *tile_id))
            .unwrap_or_default()
    }

    pub fn remove_drawables_if(&mut self, mut f: impl FnMut(&Drawable) -> bool) -> Vec<Drawable> {
        let mut removed = Vec::new();
        self.drawables_by_tile.retain(|_, drawables| {
            let mut kept = Vec::new();
            for drawable in drawables.drain(..) {
                if f(&drawable) {
                    removed.push(drawable);
                } else {
                    kept.push(drawable);
                }
            }
            *drawables = kept;
            !drawables.is_empty()
        });
        removed
    }

    /// Calls `f` for each drawable registered for the given pass and tile;
    /// returns how many were visited.
    pub fn visit_drawables(
        &mut self,
        pass: RenderPass,
        tile_id: &OverscaledTileId,
        mut f: impl FnMut(&mut Drawable),
    ) -> usize {
        match self.drawables_by_tile.get_mut(&(pass, *tile_id)) {
            Some(drawables) => {
                for drawable in drawables.iter_mut() {
                    f(drawable);
                }
                drawables.len()
            }
            None => 0,
        }
    }

    pub fn visit_all_drawables(&mut self, mut f: impl FnMut(&mut Drawable)) -> usize {
        let mut count = 0;
        for drawables in self.drawables_by_tile.values_mut() {
            for drawable in drawables.iter_mut() {
                f(drawable);
                count += 1;
            }
        }
        count
    }

    pub fn set_stencil_tiles(&mut self, tiles: BTreeSet<UnwrappedTileId>) {
        self.stencil_tiles = tiles;
    }
}

impl LayerGroupBase for TileLayerGroup {
    fn id(&self) -> SimpleIdentity {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, value: bool) {
        self.enabled = value;
    }

    fn layer_index(&self) -> i32 {
        self.layer_index
    }

    fn update_layer_index(&mut self, value: i32) {
        self.layer_index = value;
    }

    fn drawable_count(&self) -> usize {
        self.drawables_by_tile.values().map(Vec::len).sum()
    }

    fn clear_drawables(&mut self) -> Vec<Drawable> {
        std::mem::take(&mut self.drawables_by_tile)
            .into_values()
            .flatten()
            .collect()
    }

    fn render(&mut self, parameters: &mut PaintParameters) {
        if !self.enabled {
            return;
        }
        let wants_clipping = !self.stencil_tiles.is_empty()
            && self
                .drawables_by_tile
                .keys()
                .any(|(pass, _)| *pass == parameters.pass);
        if wants_clipping {
            parameters.render_tile_clipping_masks(&self.stencil_tiles);
        }
        for ((pass, _), drawables) in self.drawables_by_tile.iter_mut() {
            if *pass != parameters.pass {
                continue;
            }
            for drawable in drawables.iter_mut() {
                drawable.draw(parameters);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::{LayerGroupBase, TileLayerGroup};
    use crate::{
        coords::{CanonicalTileId, OverscaledTileId},
        render::{
            drawable::{Drawable, Segment},
            graphics::{NopContext, ShaderHandle},
            paint_parameters::test_support::paint_parameters,
            render_pass::RenderPass,
        },
        util::SimpleIdentity,
    };

    fn tile(x: u32, y: u32) -> OverscaledTileId {
        OverscaledTileId::from_canonical(CanonicalTileId::new(2, x, y))
    }

    fn drawable(pass: RenderPass, tile_id: OverscaledTileId) -> Drawable {
        let mut drawable = Drawable::new("d", ShaderHandle(SimpleIdentity::unique()), pass);
        drawable.tile_id = Some(tile_id);
        drawable.vertex_data = vec![0u8; 8];
        drawable.index_data = vec![0u8; 6];
        drawable.segments = vec![Segment {
            index_offset: 0,
            index_count: 3,
        }];
        drawable
    }

    #[test]
    fn removal_is_scoped_to_the_exact_pass_and_tile() {
        let mut group = TileLayerGroup::new(0, 4, "fill");
        group.add_drawable(RenderPass::Opaque, tile(0, 0), drawable(RenderPass::Opaque, tile(0, 0)));
        group.add_drawable(
            RenderPass::Translucent,
            tile(0, 0),
            drawable(RenderPass::Translucent, tile(0, 0)),
        );
        group.add_drawable(RenderPass::Opaque, tile(1, 0), drawable(RenderPass::Opaque, tile(1, 0)));

        let removed = group.remove_drawables(RenderPass::Opaque, &tile(0, 0));
        assert_eq!(removed.len(), 1);
        assert_eq!(group.drawable_count(), 2);
    }

    #[test]
    fn clear_returns_every_drawable() {
        let mut group = TileLayerGroup::new(0, 4, "fill");
        group.add_drawable(RenderPass::Opaque, tile(0, 0), drawable(RenderPass::Opaque, tile(0, 0)));
        group.add_drawable(RenderPass::Opaque, tile(1, 1), drawable(RenderPass::Opaque, tile(1, 1)));

        assert_eq!(group.clear_drawables().len(), 2);
        assert!(group.is_empty());
    }

    #[test]
    fn render_draws_only_the_current_pass() {
        let context = Rc::new(NopContext::new());
        let mut parameters = paint_parameters(context.clone(), RenderPass::Opaque);

        let mut group = TileLayerGroup::new(0, 4, "fill");
        group.add_drawable(RenderPass::Opaque, tile(0, 0), drawable(RenderPass::Opaque, tile(0, 0)));
        group.add_drawable(
            RenderPass::Translucent,
            tile(0, 0),
            drawable(RenderPass::Translucent, tile(0, 0)),
        );
        group.set_stencil_tiles([tile(0, 0).to_unwrapped()].into_iter().collect());

        group.render(&mut parameters);
        assert_eq!(context.draw_calls.get(), 1);
        assert_eq!(context.stamped_masks.get(), 1);
    }
}
