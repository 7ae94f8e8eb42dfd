use crate::registry::{SeriesRegistry, ViewportBinding, MAX_VIEWPORTS};

const WHEEL_DEAD_ZONE: f32 = 0.5;
pub const DEFAULT_PIXELS_PER_FRAME_STEP: f32 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavCommand {
    Next,
    Previous,
    First,
    Last,
    GoTo(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavKey {
    Up,
    Down,
    Left,
    Right,
    Home,
    End,
}

impl NavKey {
    pub fn command(self) -> NavCommand {
        match self {
            Self::Up | Self::Left => NavCommand::Previous,
            Self::Down | Self::Right => NavCommand::Next,
            Self::Home => NavCommand::First,
            Self::End => NavCommand::Last,
        }
    }
}

/// A navigation command addressed to one binding generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavRequest {
    pub viewport_index: usize,
    pub generation: u64,
    pub command: NavCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameChange {
    pub viewport_index: usize,
    pub from: usize,
    pub to: usize,
}

pub fn go_to(binding: &mut ViewportBinding, frame: usize) -> usize {
    binding.current_frame = frame.min(binding.stack_length.saturating_sub(1));
    binding.current_frame
}

pub fn next(binding: &mut ViewportBinding) -> usize {
    let len = binding.stack_length.max(1);
    binding.current_frame = (binding.current_frame + 1) % len;
    binding.current_frame
}

pub fn previous(binding: &mut ViewportBinding) -> usize {
    let len = binding.stack_length.max(1);
    binding.current_frame = if binding.current_frame == 0 {
        len - 1
    } else {
        (binding.current_frame - 1).min(len - 1)
    };
    binding.current_frame
}

pub fn apply(binding: &mut ViewportBinding, command: NavCommand) -> FrameChange {
    let from = binding.current_frame;
    let to = match command {
        NavCommand::Next => next(binding),
        NavCommand::Previous => previous(binding),
        NavCommand::First => go_to(binding, 0),
        NavCommand::Last => go_to(binding, usize::MAX),
        NavCommand::GoTo(frame) => go_to(binding, frame),
    };
    FrameChange {
        viewport_index: binding.viewport_index,
        from,
        to,
    }
}

/// Turns raw wheel deltas into whole frame steps. Positive deltas step forward.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WheelAccumulator {
    residual: f32,
    pixels_per_step: f32,
}

impl Default for WheelAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_PIXELS_PER_FRAME_STEP)
    }
}

impl WheelAccumulator {
    pub fn new(pixels_per_step: f32) -> Self {
        Self {
            residual: 0.0,
            pixels_per_step: pixels_per_step.max(1.0),
        }
    }

    pub fn feed(&mut self, delta: f32) -> i32 {
        if delta.abs() <= WHEEL_DEAD_ZONE {
            return 0;
        }

        // Reset stale residuals when the user reverses scroll direction.
        if self.residual != 0.0 && delta.signum() != self.residual.signum() {
            self.residual = 0.0;
        }
        self.residual += delta;

        let steps = (self.residual / self.pixels_per_step).trunc() as i32;
        self.residual -= steps as f32 * self.pixels_per_step;
        steps
    }

    pub fn reset(&mut self) {
        self.residual = 0.0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackReconciliation {
    Consistent,
    Mismatch { reported: usize, loaded: usize },
    Empty,
}

/// Adopts the engine's loaded stack as the source of truth for a binding.
pub fn reconcile_stack_length(
    binding: &mut ViewportBinding,
    reported: Option<usize>,
    loaded: usize,
) -> StackReconciliation {
    if loaded == 0 {
        return StackReconciliation::Empty;
    }
    binding.stack_length = loaded;
    binding.stack_confirmed = true;
    if binding.current_frame >= loaded {
        binding.current_frame = loaded - 1;
    }
    match reported {
        Some(reported) if reported != loaded => {
            log::warn!(
                "viewport {} series {}: backend reported {reported} frames, engine loaded {loaded}",
                binding.viewport_index,
                binding.series.id
            );
            StackReconciliation::Mismatch { reported, loaded }
        }
        _ => StackReconciliation::Consistent,
    }
}

pub struct FrameNavigator {
    wheels: [WheelAccumulator; MAX_VIEWPORTS],
}

impl Default for FrameNavigator {
    fn default() -> Self {
        Self::new(DEFAULT_PIXELS_PER_FRAME_STEP)
    }
}

impl FrameNavigator {
    pub fn new(pixels_per_step: f32) -> Self {
        Self {
            wheels: [WheelAccumulator::new(pixels_per_step); MAX_VIEWPORTS],
        }
    }

    /// Applies a request unless its binding has since been replaced.
    pub fn apply_request(
        &mut self,
        registry: &mut SeriesRegistry,
        request: NavRequest,
    ) -> Option<FrameChange> {
        let binding = registry.binding_mut(request.viewport_index)?;
        if binding.generation != request.generation {
            log::debug!(
                "dropping navigation for viewport {}: generation {} superseded by {}",
                request.viewport_index,
                request.generation,
                binding.generation
            );
            return None;
        }
        Some(apply(binding, request.command))
    }

    pub fn command(
        &mut self,
        registry: &mut SeriesRegistry,
        viewport_index: usize,
        command: NavCommand,
    ) -> Option<FrameChange> {
        let binding = registry.binding_mut(viewport_index)?;
        Some(apply(binding, command))
    }

    pub fn key(
        &mut self,
        registry: &mut SeriesRegistry,
        viewport_index: usize,
        key: NavKey,
    ) -> Option<FrameChange> {
        self.command(registry, viewport_index, key.command())
    }

    /// Each accumulated step is applied in order, so a fast flick over the
    /// last frame wraps exactly like repeated `next()` calls.
    pub fn wheel(
        &mut self,
        registry: &mut SeriesRegistry,
        viewport_index: usize,
        delta: f32,
    ) -> Option<FrameChange> {
        let steps = self.wheels.get_mut(viewport_index)?.feed(delta);
        if steps == 0 {
            return None;
        }
        let binding = registry.binding_mut(viewport_index)?;
        let from = binding.current_frame;
        let command = if steps > 0 {
            NavCommand::Next
        } else {
            NavCommand::Previous
        };
        for _ in 0..steps.unsigned_abs() {
            apply(binding, command);
        }
        Some(FrameChange {
            viewport_index,
            from,
            to: binding.current_frame,
        })
    }

    /// Called when a viewport is rebound so leftover wheel motion does not
    /// leak into the new stack.
    pub fn reset_viewport(&mut self, viewport_index: usize) {
        if let Some(wheel) = self.wheels.get_mut(viewport_index) {
            wheel.reset();
        }
    }
}
