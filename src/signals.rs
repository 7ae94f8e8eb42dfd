use crate::engine::{require_element, FlipAxis, RenderingEngine};
use crate::registry::SeriesRegistry;

/// Viewer-wide commands raised by the toolbar or the surrounding UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerSignal {
    ClearAllAnnotations,
    RotateClockwise(usize),
    RotateCounterClockwise(usize),
    Flip(usize, FlipAxis),
    ResetView(usize),
}

impl ViewerSignal {
    pub fn label(self) -> &'static str {
        match self {
            Self::ClearAllAnnotations => "Clear annotations",
            Self::RotateClockwise(_) => "Rotate right",
            Self::RotateCounterClockwise(_) => "Rotate left",
            Self::Flip(_, FlipAxis::Horizontal) => "Flip horizontal",
            Self::Flip(_, FlipAxis::Vertical) => "Flip vertical",
            Self::ResetView(_) => "Reset view",
        }
    }
}

/// Applies a signal. Viewports without an enabled element are skipped with a
/// warning; returns the number of viewports that changed.
pub fn apply_signal(
    signal: ViewerSignal,
    registry: &SeriesRegistry,
    engine: &mut dyn RenderingEngine,
) -> usize {
    match signal {
        ViewerSignal::ClearAllAnnotations => {
            let mut cleared = 0;
            for viewport_index in 0..registry.viewport_count() {
                if !engine.is_enabled(viewport_index) {
                    continue;
                }
                let removed = engine.clear_annotations(viewport_index);
                if removed > 0 {
                    log::info!("cleared {removed} annotation(s) from viewport {viewport_index}");
                    cleared += 1;
                }
            }
            cleared
        }
        ViewerSignal::RotateClockwise(viewport_index) => {
            on_viewport(engine, viewport_index, |engine| engine.rotate(viewport_index, 1))
        }
        ViewerSignal::RotateCounterClockwise(viewport_index) => {
            on_viewport(engine, viewport_index, |engine| engine.rotate(viewport_index, -1))
        }
        ViewerSignal::Flip(viewport_index, axis) => {
            on_viewport(engine, viewport_index, |engine| engine.flip(viewport_index, axis))
        }
        ViewerSignal::ResetView(viewport_index) => {
            on_viewport(engine, viewport_index, |engine| engine.reset_view(viewport_index))
        }
    }
}

fn on_viewport(
    engine: &mut dyn RenderingEngine,
    viewport_index: usize,
    action: impl FnOnce(&mut dyn RenderingEngine) -> bool,
) -> usize {
    if let Err(err) = require_element(engine, viewport_index) {
        log::warn!("signal ignored: {err}");
        return 0;
    }
    usize::from(action(engine))
}
