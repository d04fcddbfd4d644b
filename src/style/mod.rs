//! The immutable style-layer descriptor surface the renderer consumes.
//!
//! Style parsing and expression evaluation live outside this crate; what
//! arrives here are plain, already-resolved values. A [`LayerImpl`] is the
//! immutable descriptor for one style layer, shared by reference counting,
//! and [`EvaluatedProperties`] is the per-zoom snapshot a
//! [`RenderLayer`](crate::render::render_layer::RenderLayer) re-computes
//! every frame.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crate::render::render_pass::RenderPasses;

/// Reference-counted immutable handle, replaced wholesale on style changes.
pub type Immutable<T> = Arc<T>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Visible,
    None,
}

/// The layer kinds the orchestrator distinguishes. The kind decides which
/// bucket data a layer consumes and which render passes it can occupy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LayerType {
    Background,
    Fill,
    Line,
    Symbol,
    Raster,
    FillExtrusion,
}

/// Premultiplied RGBA.
#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub struct Color(pub [f32; 4]);

impl Color {
    pub const BLACK: Color = Color([0.0, 0.0, 0.0, 1.0]);

    pub fn alpha(&self) -> f32 {
        self.0[3]
    }
}

/// Resolved paint values for one layer. The real property set is large and
/// data-driven; the renderer only needs the values that decide pass
/// membership and the per-drawable uniforms.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PaintValues {
    pub color: Color,
    pub opacity: f32,
}

impl Default for PaintValues {
    fn default() -> Self {
        Self {
            color: Color::BLACK,
            opacity: 1.0,
        }
    }
}

/// Immutable descriptor for one style layer.
#[derive(Clone, Debug)]
pub struct LayerImpl {
    pub id: String,
    pub layer_type: LayerType,
    /// Source this layer draws from; `None` for background layers.
    pub source: Option<String>,
    pub min_zoom: f32,
    pub max_zoom: f32,
    pub visibility: Visibility,
    pub paint: PaintValues,
}

impl LayerImpl {
    pub fn new(id: impl Into<String>, layer_type: LayerType) -> Self {
        Self {
            id: id.into(),
            layer_type,
            source: None,
            min_zoom: 0.0,
            max_zoom: 24.0,
            visibility: Visibility::default(),
            paint: PaintValues::default(),
        }
    }
}

/// The per-zoom snapshot of a layer's paint values plus the render passes
/// those values place the layer in.
#[derive(Clone, Debug, PartialEq)]
pub struct EvaluatedProperties {
    pub paint: PaintValues,
    pub passes: RenderPasses,
}

impl EvaluatedProperties {
    /// Classifies the layer into render passes for the given paint values.
    /// Fully opaque fills, backgrounds and rasters go to the opaque pass;
    /// anything blended goes to translucent; extrusions additionally occupy
    /// the 3D pass.
    pub fn evaluate(layer: &LayerImpl, paint: PaintValues) -> Self {
        let passes = if layer.visibility == Visibility::None {
            RenderPasses::empty()
        } else {
            match layer.layer_type {
                LayerType::FillExtrusion => RenderPasses::PASS_3D | RenderPasses::TRANSLUCENT,
                LayerType::Line | LayerType::Symbol => RenderPasses::TRANSLUCENT,
                LayerType::Background | LayerType::Fill | LayerType::Raster => {
                    if paint.opacity >= 1.0 && paint.color.alpha() >= 1.0 {
                        RenderPasses::OPAQUE
                    } else {
                        RenderPasses::TRANSLUCENT
                    }
                }
            }
        };
        Self { paint, passes }
    }
}

/// Timing inputs for starting paint-property transitions.
#[derive(Copy, Clone, Debug)]
pub struct TransitionParameters {
    pub now: Instant,
    pub duration: Duration,
}

/// Inputs for the per-frame paint evaluation.
#[derive(Copy, Clone, Debug)]
pub struct PropertyEvaluationParameters {
    pub zoom: f64,
    pub now: Instant,
}

#[cfg(test)]
mod tests {
    use super::{Color, EvaluatedProperties, LayerImpl, LayerType, PaintValues, Visibility};
    use crate::render::render_pass::RenderPasses;

    #[test]
    fn opaque_fill_goes_to_the_opaque_pass() {
        let layer = LayerImpl::new("water", LayerType::Fill);
        let evaluated = EvaluatedProperties::evaluate(&layer, PaintValues::default());
        assert_eq!(evaluated.passes, RenderPasses::OPAQUE);
    }

    #[test]
    fn blended_fill_goes_to_the_translucent_pass() {
        let layer = LayerImpl::new("parks", LayerType::Fill);
        let paint = PaintValues {
            color: Color([0.0, 0.5, 0.0, 0.5]),
            opacity: 1.0,
        };
        let evaluated = EvaluatedProperties::evaluate(&layer, paint);
        assert_eq!(evaluated.passes, RenderPasses::TRANSLUCENT);
    }

    #[test]
    fn hidden_layers_have_no_passes() {
        let mut layer = LayerImpl::new("water", LayerType::Fill);
        layer.visibility = Visibility::None;
        let evaluated = EvaluatedProperties::evaluate(&layer, PaintValues::default());
        assert!(evaluated.passes.is_empty());
    }

    #[test]
    fn extrusions_occupy_the_3d_pass() {
        let layer = LayerImpl::new("buildings", LayerType::FillExtrusion);
        let evaluated = EvaluatedProperties::evaluate(&layer, PaintValues::default());
        assert!(evaluated.passes.contains(RenderPasses::PASS_3D));
        assert!(evaluated.passes.contains(RenderPasses::TRANSLUCENT));
    }
}
