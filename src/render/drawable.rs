//! One GPU draw unit: bound buffers, uniforms, textures, a shader reference.

use bytemuck_derive::{Pod, Zeroable};

use crate::{
    coords::{OverscaledTileId, UnwrappedTileId},
    render::{
        graphics::{
            BufferHandle, DepthMask, DrawCall, DrawState, GraphicsContext, TextureHandle,
            UniformBufferHandle,
        },
        paint_parameters::PaintParameters,
        render_pass::RenderPass,
    },
    util::SimpleIdentity,
};

pub use crate::render::graphics::ShaderHandle;

/// The per-drawable uniform block every shader receives.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct DrawableUniforms {
    pub matrix: [[f32; 4]; 4],
    pub color: [f32; 4],
    pub opacity: f32,
    pub _pad: [f32; 3],
}

impl Default for DrawableUniforms {
    fn default() -> Self {
        Self {
            matrix: cgmath::Matrix4::from_scale(1.0f32).into(),
            color: [0.0, 0.0, 0.0, 1.0],
            opacity: 1.0,
            _pad: [0.0; 3],
        }
    }
}

/// One contiguous index range drawn with a single call.
#[derive(Copy, Clone, Debug)]
pub struct Segment {
    pub index_offset: u32,
    pub index_count: u32,
}

/// Per-frame mutation hook attached to a drawable. Runs immediately before
/// the draw call; the extension point for custom-rendering plugins.
pub trait DrawableTweaker {
    fn init(&self, drawable: &mut Drawable, context: &dyn GraphicsContext);
    fn execute(&self, drawable: &mut Drawable, parameters: &PaintParameters);
}

pub struct Drawable {
    pub id: SimpleIdentity,
    pub name: String,
    pub shader: ShaderHandle,
    pub pass: RenderPass,
    /// Set for tile-scoped drawables; background drawables have none.
    pub tile_id: Option<OverscaledTileId>,
    /// Identity of the bucket this drawable was built from. Compared, never
    /// dereferenced, so a reloaded tile cannot leave a dangling reference.
    pub bucket_id: SimpleIdentity,
    pub is_3d: bool,
    pub enabled: bool,
    pub draw_priority: i32,
    pub sub_layer: usize,

    pub vertex_data: Vec<u8>,
    pub index_data: Vec<u8>,
    pub uniforms: DrawableUniforms,
    pub texture: Option<TextureHandle>,
    pub segments: Vec<Segment>,
    tweakers: Vec<Box<dyn DrawableTweaker>>,
    /// How many of `tweakers` have had `init` run; the rest are initialized
    /// on the next draw.
    tweakers_initialized: usize,

    vertex_buffer: Option<BufferHandle>,
    index_buffer: Option<BufferHandle>,
    uniform_buffer: Option<UniformBufferHandle>,
}

impl Drawable {
    pub fn new(name: impl Into<String>, shader: ShaderHandle, pass: RenderPass) -> Self {
        Self {
            id: SimpleIdentity::unique(),
            name: name.into(),
            shader,
            pass,
            tile_id: None,
            bucket_id: SimpleIdentity::EMPTY,
            is_3d: false,
            enabled: true,
            draw_priority: 0,
            sub_layer: 0,
            vertex_data: Vec::new(),
            index_data: Vec::new(),
            uniforms: DrawableUniforms::default(),
            texture: None,
            segments: Vec::new(),
            tweakers: Vec::new(),
            tweakers_initialized: 0,
            vertex_buffer: None,
            index_buffer: None,
            uniform_buffer: None,
        }
    }

    pub fn add_tweaker(&mut self, tweaker: Box<dyn DrawableTweaker>) {
        self.tweakers.push(tweaker);
    }

    fn unwrapped_tile(&self) -> Option<UnwrappedTileId> {
        self.tile_id.map(|id| id.to_unwrapped())
    }

    /// Materializes GPU buffers from the raw payloads. Idempotent per
    /// resource; a buffer already uploaded is left alone, uniforms are
    /// re-pushed every call since tweakers mutate them.
    pub fn upload(&mut self, context: &dyn GraphicsContext) {
        if self.vertex_buffer.is_none() && !self.vertex_data.is_empty() {
            self.vertex_buffer = Some(context.create_vertex_buffer(&self.vertex_data));
        }
        if self.index_buffer.is_none() && !self.index_data.is_empty() {
            self.index_buffer = Some(context.create_index_buffer(&self.index_data));
        }
        let uniform_bytes = bytemuck::bytes_of(&self.uniforms);
        match self.uniform_buffer {
            Some(handle) => context.update_uniform_buffer(handle, uniform_bytes),
            None => self.uniform_buffer = Some(context.create_uniform_buffer(uniform_bytes)),
        }
    }

    /// Issues one indexed draw per segment with the depth/stencil/color
    /// state this drawable's pass and tile scope require.
    pub fn draw(&mut self, parameters: &mut PaintParameters) {
        if !self.enabled || self.segments.is_empty() {
            return;
        }
        debug_assert_eq!(self.pass, parameters.pass);

        let context = std::rc::Rc::clone(&parameters.context);

        let tweakers = std::mem::take(&mut self.tweakers);
        for (index, tweaker) in tweakers.iter().enumerate() {
            if index >= self.tweakers_initialized {
                tweaker.init(self, context.as_ref());
            }
            tweaker.execute(self, parameters);
        }
        self.tweakers_initialized = tweakers.len();
        self.tweakers = tweakers;

        self.upload(context.as_ref());
        let (Some(vertex_buffer), Some(index_buffer)) = (self.vertex_buffer, self.index_buffer)
        else {
            return;
        };

        let depth = if self.is_3d {
            parameters.depth_mode_for_3d()
        } else {
            // Opaque draws write depth so the monotone per-layer values
            // occlude later passes; translucent draws only test it.
            let mask = match self.pass {
                RenderPass::Opaque => DepthMask::ReadWrite,
                RenderPass::Translucent => DepthMask::ReadOnly,
            };
            parameters.depth_mode_for_sublayer(self.sub_layer, mask)
        };
        let stencil = if self.is_3d {
            parameters.stencil_mode_for_3d()
        } else {
            match self.unwrapped_tile() {
                Some(tile_id) => parameters.stencil_mode_for_clipping(&tile_id),
                None => crate::render::graphics::StencilMode::disabled(),
            }
        };
        let color = parameters.color_mode_for_render_pass();
        let state = DrawState {
            depth,
            stencil,
            color,
        };

        for segment in &self.segments {
            context.draw(
                &state,
                &DrawCall {
                    shader: self.shader,
                    vertex_buffer,
                    index_buffer,
                    index_offset: segment.index_offset,
                    index_count: segment.index_count,
                    uniforms: self.uniform_buffer,
                    texture: self.texture,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, collections::BTreeSet, rc::Rc};

    use super::{Drawable, DrawableTweaker, DrawableUniforms, Segment};
    use crate::{
        coords::{CanonicalTileId, OverscaledTileId},
        render::{
            graphics::{DepthMask, GraphicsContext, NopContext, ShaderHandle},
            paint_parameters::{test_support::paint_parameters, PaintParameters},
            render_pass::RenderPass,
        },
        util::SimpleIdentity,
    };

    fn tile_drawable(pass: RenderPass) -> Drawable {
        let mut drawable = Drawable::new("test", ShaderHandle(SimpleIdentity::unique()), pass);
        drawable.tile_id = Some(OverscaledTileId::from_canonical(
            CanonicalTileId::new(0, 0, 0),
        ));
        drawable.vertex_data = vec![0u8; 16];
        drawable.index_data = vec![0u8; 12];
        drawable.segments = vec![Segment {
            index_offset: 0,
            index_count: 6,
        }];
        drawable
    }

    #[test]
    fn draw_issues_one_call_per_segment() {
        let context = Rc::new(NopContext::new());
        let mut parameters = paint_parameters(context.clone(), RenderPass::Translucent);
        let mut drawable = tile_drawable(RenderPass::Translucent);
        parameters
            .render_tile_clipping_masks(&BTreeSet::from([drawable.tile_id.unwrap().to_unwrapped()]));
        drawable.segments.push(Segment {
            index_offset: 6,
            index_count: 3,
        });

        drawable.draw(&mut parameters);
        assert_eq!(context.draw_calls.get(), 2);
    }

    #[test]
    fn disabled_drawables_are_skipped() {
        let context = Rc::new(NopContext::new());
        let mut parameters = paint_parameters(context.clone(), RenderPass::Opaque);
        let mut drawable = tile_drawable(RenderPass::Opaque);
        drawable.enabled = false;

        drawable.draw(&mut parameters);
        assert_eq!(context.draw_calls.get(), 0);
    }

    #[test]
    fn upload_reuses_buffers_but_refreshes_uniforms() {
        let context = NopContext::new();
        let mut drawable = tile_drawable(RenderPass::Opaque);
        drawable.upload(&context);
        let first = drawable.vertex_buffer;
        drawable.uniforms = DrawableUniforms {
            opacity: 0.5,
            ..DrawableUniforms::default()
        };
        drawable.upload(&context);
        assert_eq!(drawable.vertex_buffer, first);
    }

    #[test]
    fn opaque_draws_write_depth_and_translucent_draws_do_not() {
        let context = Rc::new(NopContext::new());

        let mut parameters = paint_parameters(context.clone(), RenderPass::Opaque);
        let mut drawable = tile_drawable(RenderPass::Opaque);
        parameters
            .render_tile_clipping_masks(&BTreeSet::from([drawable.tile_id.unwrap().to_unwrapped()]));
        drawable.draw(&mut parameters);
        let state = context.last_draw_state.get().unwrap();
        assert_eq!(state.depth.mask, DepthMask::ReadWrite);

        let mut parameters = paint_parameters(context.clone(), RenderPass::Translucent);
        let mut drawable = tile_drawable(RenderPass::Translucent);
        parameters
            .render_tile_clipping_masks(&BTreeSet::from([drawable.tile_id.unwrap().to_unwrapped()]));
        drawable.draw(&mut parameters);
        let state = context.last_draw_state.get().unwrap();
        assert_eq!(state.depth.mask, DepthMask::ReadOnly);
    }

    struct CountingTweaker {
        inits: Rc<Cell<usize>>,
        executes: Rc<Cell<usize>>,
    }

    impl DrawableTweaker for CountingTweaker {
        fn init(&self, _drawable: &mut Drawable, _context: &dyn GraphicsContext) {
            self.inits.set(self.inits.get() + 1);
        }

        fn execute(&self, _drawable: &mut Drawable, _parameters: &PaintParameters) {
            self.executes.set(self.executes.get() + 1);
        }
    }

    #[test]
    fn tweakers_init_once_and_execute_every_draw() {
        let context = Rc::new(NopContext::new());
        let mut parameters = paint_parameters(context.clone(), RenderPass::Translucent);
        let mut drawable = tile_drawable(RenderPass::Translucent);
        parameters
            .render_tile_clipping_masks(&BTreeSet::from([drawable.tile_id.unwrap().to_unwrapped()]));

        let inits = Rc::new(Cell::new(0));
        let executes = Rc::new(Cell::new(0));
        drawable.add_tweaker(Box::new(CountingTweaker {
            inits: Rc::clone(&inits),
            executes: Rc::clone(&executes),
        }));

        drawable.draw(&mut parameters);
        drawable.draw(&mut parameters);
        assert_eq!(inits.get(), 1);
        assert_eq!(executes.get(), 2);
    }

    #[test]
    fn nop_context_hands_out_distinct_handles() {
        let context = NopContext::new();
        let a = context.create_vertex_buffer(&[0u8; 4]);
        let b = context.create_vertex_buffer(&[0u8; 4]);
        assert_ne!(a, b);
    }
}
