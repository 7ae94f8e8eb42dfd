use serde::{Deserialize, Serialize};

use crate::error::{ViewerError, ViewerResult};
use crate::series::{decode_drag_payload, SeriesDescriptor, SeriesId};

pub const MAX_VIEWPORTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GridLayout {
    #[serde(rename = "1x1")]
    Single,
    #[serde(rename = "1x2")]
    SideBySide,
    #[default]
    #[serde(rename = "2x2")]
    Quad,
}

impl GridLayout {
    pub fn viewport_count(self) -> usize {
        match self {
            Self::Single => 1,
            Self::SideBySide => 2,
            Self::Quad => 4,
        }
    }

    /// (rows, columns)
    pub fn shape(self) -> (usize, usize) {
        match self {
            Self::Single => (1, 1),
            Self::SideBySide => (1, 2),
            Self::Quad => (2, 2),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "1x1" | "single" => Some(Self::Single),
            "1x2" | "side-by-side" => Some(Self::SideBySide),
            "2x2" | "quad" => Some(Self::Quad),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Single => "1x1",
            Self::SideBySide => "1x2",
            Self::Quad => "2x2",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewportBinding {
    pub viewport_index: usize,
    pub series: SeriesDescriptor,
    /// Always >= 1 and `current_frame < stack_length`.
    pub stack_length: usize,
    pub current_frame: usize,
    pub generation: u64,
    /// Set once the engine has reported its own loaded stack for this binding.
    pub stack_confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DragState {
    pub source_series_id: SeriesId,
    pub hovered_viewport: Option<usize>,
}

/// Extension point consulted before every assignment.
pub trait AssignmentPolicy {
    fn check(
        &self,
        viewport_index: usize,
        incoming: &SeriesDescriptor,
        current: Option<&SeriesDescriptor>,
    ) -> Result<(), String>;
}

pub struct AcceptAll;

impl AssignmentPolicy for AcceptAll {
    fn check(
        &self,
        _viewport_index: usize,
        _incoming: &SeriesDescriptor,
        _current: Option<&SeriesDescriptor>,
    ) -> Result<(), String> {
        Ok(())
    }
}

/// Rejects replacing a series with one of a different known modality.
pub struct SameModality;

impl AssignmentPolicy for SameModality {
    fn check(
        &self,
        _viewport_index: usize,
        incoming: &SeriesDescriptor,
        current: Option<&SeriesDescriptor>,
    ) -> Result<(), String> {
        let Some(current) = current else {
            return Ok(());
        };
        match (current.modality.as_deref(), incoming.modality.as_deref()) {
            (Some(existing), Some(next)) if !existing.eq_ignore_ascii_case(next) => {
                Err(format!("modality {next} does not match {existing}"))
            }
            _ => Ok(()),
        }
    }
}

pub struct SeriesRegistry {
    layout: GridLayout,
    slots: [Option<ViewportBinding>; MAX_VIEWPORTS],
    series_order: Vec<SeriesDescriptor>,
    primary: Option<SeriesId>,
    next_generation: u64,
    drag: Option<DragState>,
    policy: Box<dyn AssignmentPolicy>,
}

impl Default for SeriesRegistry {
    fn default() -> Self {
        Self::new(GridLayout::default())
    }
}

impl SeriesRegistry {
    pub fn new(layout: GridLayout) -> Self {
        Self {
            layout,
            slots: Default::default(),
            series_order: Vec::new(),
            primary: None,
            next_generation: 1,
            drag: None,
            policy: Box::new(AcceptAll),
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn AssignmentPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn layout(&self) -> GridLayout {
        self.layout
    }

    pub fn viewport_count(&self) -> usize {
        self.layout.viewport_count()
    }

    pub fn series_order(&self) -> &[SeriesDescriptor] {
        &self.series_order
    }

    pub fn set_series_order(&mut self, series: Vec<SeriesDescriptor>) {
        self.series_order = series;
    }

    /// Updates the catalogue entry for a series, e.g. once its stack is listed.
    pub fn upsert_series(&mut self, series: SeriesDescriptor) {
        match self.series_order.iter_mut().find(|known| known.id == series.id) {
            Some(known) => *known = series,
            None => self.series_order.push(series),
        }
    }

    pub fn find_series(&self, series_id: &SeriesId) -> Option<&SeriesDescriptor> {
        self.series_order.iter().find(|series| &series.id == series_id)
    }

    pub fn primary(&self) -> Option<&SeriesId> {
        self.primary.as_ref()
    }

    pub fn set_primary(&mut self, series_id: Option<SeriesId>) {
        self.primary = series_id;
    }

    fn check_index(&self, viewport_index: usize) -> ViewerResult<()> {
        if viewport_index < self.viewport_count() {
            Ok(())
        } else {
            Err(ViewerError::ViewportOutOfRange(viewport_index))
        }
    }

    /// Last write wins: any existing binding is replaced and a fresh generation issued.
    pub fn assign(
        &mut self,
        viewport_index: usize,
        series: SeriesDescriptor,
    ) -> ViewerResult<&ViewportBinding> {
        self.check_index(viewport_index)?;
        let current = self.slots[viewport_index]
            .as_ref()
            .map(|binding| &binding.series);
        self.policy
            .check(viewport_index, &series, current)
            .map_err(|reason| ViewerError::AssignmentRejected {
                viewport: viewport_index,
                reason,
            })?;

        let generation = self.next_generation;
        self.next_generation += 1;
        let stack_length = series.stack_length.unwrap_or(1).max(1);
        log::debug!(
            "viewport {viewport_index} bound to series {} (generation {generation})",
            series.id
        );
        let binding = self.slots[viewport_index].insert(ViewportBinding {
            viewport_index,
            series,
            stack_length,
            current_frame: 0,
            generation,
            stack_confirmed: false,
        });
        Ok(binding)
    }

    /// The bound series, or the configured default for an unbound viewport.
    pub fn get(&self, viewport_index: usize) -> Option<&SeriesDescriptor> {
        if viewport_index >= self.viewport_count() {
            return None;
        }
        self.slots[viewport_index]
            .as_ref()
            .map(|binding| &binding.series)
            .or_else(|| self.default_for(viewport_index))
    }

    pub fn default_for(&self, viewport_index: usize) -> Option<&SeriesDescriptor> {
        let primary_pos = self
            .primary
            .as_ref()
            .and_then(|primary| self.series_order.iter().position(|s| &s.id == primary))
            .unwrap_or(0);
        self.series_order.get(primary_pos + viewport_index)
    }

    /// Binds every empty viewport to its default series, as on grid mount.
    pub fn bind_defaults(&mut self) -> Vec<usize> {
        let mut bound = Vec::new();
        for index in 0..self.viewport_count() {
            if self.slots[index].is_some() {
                continue;
            }
            let Some(series) = self.default_for(index).cloned() else {
                continue;
            };
            match self.assign(index, series) {
                Ok(_) => bound.push(index),
                Err(err) => log::warn!("default binding for viewport {index} skipped: {err}"),
            }
        }
        bound
    }

    pub fn binding(&self, viewport_index: usize) -> Option<&ViewportBinding> {
        self.slots.get(viewport_index).and_then(Option::as_ref)
    }

    pub fn binding_mut(&mut self, viewport_index: usize) -> Option<&mut ViewportBinding> {
        self.slots.get_mut(viewport_index).and_then(Option::as_mut)
    }

    pub fn bindings(&self) -> impl Iterator<Item = &ViewportBinding> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn generation(&self, viewport_index: usize) -> Option<u64> {
        self.binding(viewport_index).map(|binding| binding.generation)
    }

    pub fn is_current(&self, viewport_index: usize, generation: u64) -> bool {
        self.generation(viewport_index) == Some(generation)
    }

    pub fn ensure_current(&self, viewport_index: usize, generation: u64) -> ViewerResult<()> {
        let current = self.generation(viewport_index).unwrap_or(0);
        if current == generation {
            Ok(())
        } else {
            Err(ViewerError::Stale {
                viewport: viewport_index,
                got: generation,
                current,
            })
        }
    }

    pub fn viewports_for_series(&self, series_id: &SeriesId) -> Vec<usize> {
        self.bindings()
            .filter(|binding| &binding.series.id == series_id)
            .map(|binding| binding.viewport_index)
            .collect()
    }

    pub fn unbind(&mut self, viewport_index: usize) -> Option<ViewportBinding> {
        self.slots.get_mut(viewport_index).and_then(Option::take)
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.drag = None;
    }

    /// Switches the grid; bindings for viewports that no longer exist are torn down.
    pub fn set_layout(&mut self, layout: GridLayout) -> Vec<usize> {
        self.layout = layout;
        let mut removed = Vec::new();
        for index in layout.viewport_count()..MAX_VIEWPORTS {
            if self.slots[index].take().is_some() {
                removed.push(index);
            }
        }
        if let Some(drag) = self.drag.as_mut() {
            if drag
                .hovered_viewport
                .is_some_and(|index| index >= layout.viewport_count())
            {
                drag.hovered_viewport = None;
            }
        }
        removed
    }

    pub fn begin_drag(&mut self, series_id: SeriesId) {
        self.drag = Some(DragState {
            source_series_id: series_id,
            hovered_viewport: None,
        });
    }

    pub fn drag_state(&self) -> Option<&DragState> {
        self.drag.as_ref()
    }

    pub fn drag_over(&mut self, viewport_index: usize) {
        if viewport_index >= self.viewport_count() {
            return;
        }
        if let Some(drag) = self.drag.as_mut() {
            drag.hovered_viewport = Some(viewport_index);
        }
    }

    pub fn drag_leave(&mut self, viewport_index: usize) {
        if let Some(drag) = self.drag.as_mut() {
            if drag.hovered_viewport == Some(viewport_index) {
                drag.hovered_viewport = None;
            }
        }
    }

    pub fn cancel_drag(&mut self) {
        self.drag = None;
    }

    pub fn is_drop_highlighted(&self, viewport_index: usize) -> bool {
        self.drag
            .as_ref()
            .is_some_and(|drag| drag.hovered_viewport == Some(viewport_index))
    }

    /// Decodes a serialized series descriptor and binds it. Drag state is
    /// cleared whether or not the drop succeeds.
    pub fn accept_drop(
        &mut self,
        viewport_index: usize,
        payload: &str,
    ) -> ViewerResult<&ViewportBinding> {
        self.drag = None;
        let dropped = decode_drag_payload(payload)?;
        // Prefer the catalogue copy, it may already know the stack length.
        let series = match self.find_series(&dropped.id) {
            Some(known) if known.stack_length.is_some() => known.clone(),
            _ => dropped,
        };
        self.assign(viewport_index, series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::encode_drag_payload;

    fn series(id: &str, stack_length: usize) -> SeriesDescriptor {
        let mut series = SeriesDescriptor::from_backend(id);
        series.stack_length = Some(stack_length);
        series
    }

    #[test]
    fn assign_then_get_returns_series_with_reset_frame() {
        let mut registry = SeriesRegistry::new(GridLayout::Quad);
        for index in 0..MAX_VIEWPORTS {
            registry.assign(index, series("first", 3)).expect("in range");
            registry.binding_mut(index).expect("bound").current_frame = 2;

            let next = series(&format!("s{index}"), 7 + index);
            registry.assign(index, next.clone()).expect("in range");
            assert_eq!(registry.get(index), Some(&next));
            let binding = registry.binding(index).expect("bound");
            assert_eq!(binding.current_frame, 0);
            assert_eq!(binding.stack_length, 7 + index);
        }
    }

    #[test]
    fn reassignment_bumps_generation() {
        let mut registry = SeriesRegistry::default();
        let first = registry.assign(1, series("a", 2)).expect("bound").generation;
        let second = registry.assign(1, series("b", 2)).expect("bound").generation;
        assert!(second > first);
        assert!(!registry.is_current(1, first));
        assert!(registry.ensure_current(1, second).is_ok());
        assert!(matches!(
            registry.ensure_current(1, first),
            Err(ViewerError::Stale { .. })
        ));
    }

    #[test]
    fn defaults_follow_primary_then_series_order() {
        let mut registry = SeriesRegistry::new(GridLayout::Quad);
        registry.set_series_order(vec![series("a", 1), series("b", 1), series("c", 1)]);
        registry.set_primary(Some(SeriesId::new("b")));

        assert_eq!(registry.get(0).map(|s| s.id.as_str()), Some("b"));
        assert_eq!(registry.get(1).map(|s| s.id.as_str()), Some("c"));
        assert_eq!(registry.get(2), None);

        let bound = registry.bind_defaults();
        assert_eq!(bound, vec![0, 1]);
        assert!(registry.binding(2).is_none());
    }

    #[test]
    fn out_of_layout_assignment_is_rejected() {
        let mut registry = SeriesRegistry::new(GridLayout::SideBySide);
        assert!(matches!(
            registry.assign(2, series("a", 1)),
            Err(ViewerError::ViewportOutOfRange(2))
        ));
    }

    #[test]
    fn shrinking_layout_tears_down_extra_bindings() {
        let mut registry = SeriesRegistry::new(GridLayout::Quad);
        for index in 0..4 {
            registry.assign(index, series("a", 1)).expect("bound");
        }
        let removed = registry.set_layout(GridLayout::Single);
        assert_eq!(removed, vec![1, 2, 3]);
        assert_eq!(registry.bindings().count(), 1);
    }

    #[test]
    fn drop_payload_binds_and_clears_highlight() {
        let mut registry = SeriesRegistry::default();
        let dropped = series("dragged", 4);
        registry.begin_drag(dropped.id.clone());
        registry.drag_over(3);
        assert!(registry.is_drop_highlighted(3));
        registry.drag_leave(3);
        assert!(!registry.is_drop_highlighted(3));
        registry.drag_over(2);

        let payload = encode_drag_payload(&dropped).expect("serializable");
        let binding = registry.accept_drop(2, &payload).expect("valid drop");
        assert_eq!(binding.series.id, dropped.id);
        assert_eq!(binding.stack_length, 4);
        assert!(registry.drag_state().is_none());
    }

    #[test]
    fn malformed_drop_leaves_binding_untouched() {
        let mut registry = SeriesRegistry::default();
        registry.assign(0, series("kept", 2)).expect("bound");
        registry.begin_drag(SeriesId::new("x"));
        assert!(matches!(
            registry.accept_drop(0, "{broken"),
            Err(ViewerError::Payload(_))
        ));
        assert_eq!(registry.get(0).map(|s| s.id.as_str()), Some("kept"));
        assert!(registry.drag_state().is_none());
    }

    #[test]
    fn same_modality_policy_blocks_mismatch() {
        let mut registry = SeriesRegistry::default().with_policy(Box::new(SameModality));
        let mut ct = series("ct", 1);
        ct.modality = Some("CT".to_string());
        let mut mr = series("mr", 1);
        mr.modality = Some("MR".to_string());

        registry.assign(0, ct).expect("empty viewport accepts anything");
        assert!(matches!(
            registry.assign(0, mr),
            Err(ViewerError::AssignmentRejected { viewport: 0, .. })
        ));
    }

    #[test]
    fn viewports_for_series_lists_every_binding() {
        let mut registry = SeriesRegistry::default();
        registry.assign(0, series("a", 1)).expect("bound");
        registry.assign(2, series("a", 1)).expect("bound");
        registry.assign(3, series("b", 1)).expect("bound");
        assert_eq!(registry.viewports_for_series(&SeriesId::new("a")), vec![0, 2]);
    }
}
