//! The per-frame parameter bundle shared by every draw call: camera
//! matrices, depth sublayer math and the tile clipping-mask stencil
//! bookkeeping.

use std::{
    collections::{BTreeMap, BTreeSet},
    rc::Rc,
};

use cgmath::{Deg, Matrix4};

use crate::{
    coords::UnwrappedTileId,
    render::{
        graphics::{
            ColorMode, DepthFunction, DepthMask, DepthMode, GraphicsContext, StencilMode,
            StencilOp, StencilTest,
        },
        render_pass::RenderPass,
    },
};

pub const NUM_SUBLAYERS: u32 = 3;
pub const DEPTH_EPSILON: f32 = 1.0 / (1 << 16) as f32;
pub const MAX_STENCIL_VALUE: i32 = 255;

/// Camera state for the frame.
#[derive(Copy, Clone, Debug)]
pub struct TransformState {
    pub zoom: f64,
    pub width: u32,
    pub height: u32,
    pub field_of_view: f64,
    pub camera_to_center_distance: f64,
}

impl TransformState {
    pub fn new(zoom: f64, width: u32, height: u32) -> Self {
        Self {
            zoom,
            width: width.max(1),
            height: height.max(1),
            field_of_view: 36.87,
            camera_to_center_distance: 1000.0,
        }
    }

    fn projection(&self, near: f64) -> Matrix4<f64> {
        let aspect = self.width as f64 / self.height as f64;
        cgmath::perspective(
            Deg(self.field_of_view),
            aspect,
            near,
            self.camera_to_center_distance * 10.0,
        )
    }
}

/// The three projection matrices a frame needs: regular, pixel-aligned, and
/// one with the near plane pushed out so extrusion layers do not waste depth
/// precision on empty space close to the camera.
#[derive(Copy, Clone, Debug)]
pub struct TransformParameters {
    pub state: TransformState,
    pub proj_matrix: Matrix4<f64>,
    pub aligned_proj_matrix: Matrix4<f64>,
    pub near_clipped_proj_matrix: Matrix4<f64>,
}

impl TransformParameters {
    pub fn new(state: TransformState) -> Self {
        let proj_matrix = state.projection(1.0);
        // Aligned with the pixel grid: snap the translation column so odd
        // viewport sizes do not blur line rendering.
        let mut aligned_proj_matrix = proj_matrix;
        aligned_proj_matrix.w.x = aligned_proj_matrix.w.x.round();
        aligned_proj_matrix.w.y = aligned_proj_matrix.w.y.round();
        let near_clipped_proj_matrix = state.projection(0.1 * state.camera_to_center_distance);
        Self {
            state,
            proj_matrix,
            aligned_proj_matrix,
            near_clipped_proj_matrix,
        }
    }
}

pub struct PaintParameters {
    pub context: Rc<dyn GraphicsContext>,
    pub transform: TransformParameters,
    pub pass: RenderPass,
    pub pixel_ratio: f32,
    pub frame_count: u64,

    /// Index of the layer currently being drawn, counted in draw order.
    pub current_layer: u32,
    /// Layers below this index skip the depth test entirely.
    pub opaque_pass_cutoff: u32,
    pub depth_range_size: f32,

    next_stencil_id: i32,
    tile_clipping_mask_ids: BTreeMap<UnwrappedTileId, i32>,
}

impl PaintParameters {
    pub fn new(
        context: Rc<dyn GraphicsContext>,
        transform: TransformParameters,
        pixel_ratio: f32,
        layer_count: usize,
        frame_count: u64,
    ) -> Self {
        let depth_range_size =
            1.0 - (layer_count as f32 + 2.0) * NUM_SUBLAYERS as f32 * DEPTH_EPSILON;
        Self {
            context,
            transform,
            pass: RenderPass::Opaque,
            pixel_ratio,
            frame_count,
            current_layer: 0,
            opaque_pass_cutoff: 0,
            depth_range_size,
            next_stencil_id: 1,
            tile_clipping_mask_ids: BTreeMap::new(),
        }
    }

    pub fn matrix_for_tile(&self, tile_id: &UnwrappedTileId, aligned: bool) -> Matrix4<f64> {
        let projection = if aligned {
            self.aligned_proj()
        } else {
            self.transform.proj_matrix
        };
        projection * tile_id.transform_for_zoom(self.transform.state.zoom)
    }

    fn aligned_proj(&self) -> Matrix4<f64> {
        self.transform.aligned_proj_matrix
    }

    /// Depth state for sublayer `n` of the current layer. Disabled below the
    /// opaque pass cutoff; otherwise a fixed depth value that grows with
    /// `(current_layer, n)` so later opaque layers never depth-fail against
    /// earlier ones.
    pub fn depth_mode_for_sublayer(&self, n: usize, mask: DepthMask) -> DepthMode {
        if self.current_layer < self.opaque_pass_cutoff {
            return DepthMode::disabled();
        }
        debug_assert!((n as u32) < NUM_SUBLAYERS);
        let depth = self.depth_range_size
            + ((1 + self.current_layer) * NUM_SUBLAYERS + n as u32) as f32 * DEPTH_EPSILON;
        DepthMode {
            func: DepthFunction::LessEqual,
            mask,
            range: (depth, depth),
        }
    }

    pub fn color_mode_for_render_pass(&self) -> ColorMode {
        match self.pass {
            RenderPass::Opaque => ColorMode::Unblended,
            RenderPass::Translucent => ColorMode::AlphaBlended,
        }
    }

    pub fn depth_mode_for_3d(&self) -> DepthMode {
        DepthMode {
            func: DepthFunction::LessEqual,
            mask: DepthMask::ReadWrite,
            range: (0.0, self.depth_range_size),
        }
    }

    fn clear_stencil(&mut self) {
        self.next_stencil_id = 1;
        self.tile_clipping_mask_ids.clear();
        self.context.clear_stencil_buffer();
    }

    /// Stamps a stencil reference value over each tile's footprint so later
    /// draws can clip to it. A no-op when `tile_ids` matches the currently
    /// stamped set; clears and restarts ID allocation when the fresh IDs
    /// would overflow the stencil range.
    #[tracing::instrument(skip_all)]
    pub fn render_tile_clipping_masks(&mut self, tile_ids: &BTreeSet<UnwrappedTileId>) {
        if tile_ids.len() == self.tile_clipping_mask_ids.len()
            && tile_ids
                .iter()
                .eq(self.tile_clipping_mask_ids.keys())
        {
            // The current stencil mask covers this set already.
            return;
        }

        if self.next_stencil_id + tile_ids.len() as i32 > MAX_STENCIL_VALUE {
            self.clear_stencil();
        }

        let context = Rc::clone(&self.context);
        for tile_id in tile_ids {
            if self.tile_clipping_mask_ids.contains_key(tile_id) {
                continue;
            }
            let stencil_id = self.next_stencil_id;
            self.next_stencil_id += 1;
            self.tile_clipping_mask_ids.insert(*tile_id, stencil_id);
            context.stamp_clip_mask(*tile_id, stencil_id);
        }
    }

    pub fn clear_tile_clipping_masks(&mut self) {
        if !self.tile_clipping_mask_ids.is_empty() {
            self.clear_stencil();
        }
    }

    /// Stencil state restricting a draw to `tile_id`'s stamped footprint.
    /// The tile must have been passed to `render_tile_clipping_masks` first.
    pub fn stencil_mode_for_clipping(&self, tile_id: &UnwrappedTileId) -> StencilMode {
        let id = self.tile_clipping_mask_ids.get(tile_id).copied();
        debug_assert!(id.is_some(), "no clipping mask stamped for {tile_id}");
        StencilMode {
            test: StencilTest::Equal { mask: 0b1111_1111 },
            reference: id.unwrap_or(0),
            write_mask: 0,
            fail: StencilOp::Keep,
            depth_fail: StencilOp::Keep,
            pass: StencilOp::Replace,
        }
    }

    /// Extrusion rendering writes the stencil buffer itself, which destroys
    /// the 2D clipping masks; every stamped ID is invalidated.
    pub fn stencil_mode_for_3d(&mut self) -> StencilMode {
        if self.next_stencil_id + 1 > MAX_STENCIL_VALUE {
            self.clear_stencil();
        }
        self.tile_clipping_mask_ids.clear();

        let id = self.next_stencil_id;
        self.next_stencil_id += 1;
        StencilMode {
            test: StencilTest::NotEqual { mask: 0b1111_1111 },
            reference: id,
            write_mask: 0b1111_1111,
            fail: StencilOp::Keep,
            depth_fail: StencilOp::Keep,
            pass: StencilOp::Replace,
        }
    }
}
