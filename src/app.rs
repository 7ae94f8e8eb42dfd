use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, Utc};
use eframe::egui::{
    self, Color32, FontId, Sense, Stroke, TextureHandle, TextureOptions, ViewportCommand,
};

use crate::annotation::{AnnotationDetails, AnnotationPatch, ToolType};
use crate::backend::{Backend, HttpBackend, OfflineBackend};
use crate::engine::{shapes_on_slice, FlipAxis, RenderingEngine};
use crate::geometry::{Point, ViewTransform};
use crate::hittest::{hit_test, HitTestConfig};
use crate::hover::{HoverEvent, HoverTarget, HoverTracker};
use crate::jobs::JobMode;
use crate::launch::LaunchRequest;
use crate::loader::{LoadEvent, LoadedStack, StackLoader};
use crate::local_engine::{
    ActiveTool, FrameStatus, LocalEngine, StrokeOutcome, DEFAULT_BRUSH_RADIUS,
};
use crate::navigation::{
    reconcile_stack_length, FrameChange, FrameNavigator, NavCommand, NavKey, NavRequest,
    StackReconciliation,
};
use crate::notify::{NotificationLevel, Notifications};
use crate::registry::{GridLayout, SameModality, SeriesRegistry, MAX_VIEWPORTS};
use crate::renderer::{annotation_outline, image_mesh, labelmap_color, parse_color_code, to_pos};
use crate::segmentation::{DeletePrompt, LayerId, LayerManager, LayerMetadata};
use crate::series::{encode_drag_payload, InstanceRecord, SeriesDescriptor, SeriesId, SeriesSource};
use crate::settings::Settings;
use crate::signals::{apply_signal, ViewerSignal};
use crate::sync::{AnnotationRef, AnnotationSyncBridge};

const APP_TITLE: &str = "RadView";
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const BUSY_REPAINT_INTERVAL: Duration = Duration::from_millis(16);
const GRID_GAP: f32 = 2.0;
const ACCENT: Color32 = Color32::from_rgb(90, 140, 220);
const DROP_HIGHLIGHT: Color32 = Color32::from_rgb(240, 180, 60);
const ANNOTATION_FALLBACK: Color32 = Color32::from_rgb(245, 197, 24);
const ERROR_TEXT: Color32 = Color32::from_rgb(230, 90, 90);
const LAYOUTS: [GridLayout; 3] = [GridLayout::Single, GridLayout::SideBySide, GridLayout::Quad];
const NAV_KEYS: [(egui::Key, NavKey); 6] = [
    (egui::Key::ArrowUp, NavKey::Up),
    (egui::Key::ArrowDown, NavKey::Down),
    (egui::Key::ArrowLeft, NavKey::Left),
    (egui::Key::ArrowRight, NavKey::Right),
    (egui::Key::Home, NavKey::Home),
    (egui::Key::End, NavKey::End),
];

/// What egui carries while a series is dragged out of the series list.
struct SeriesDrag {
    series_id: SeriesId,
    encoded: String,
}

struct ViewportTexture {
    handle: TextureHandle,
    revision: u64,
}

struct HoverCard {
    target: HoverTarget,
    details: AnnotationDetails,
}

struct Selection {
    target: AnnotationRef,
    details: AnnotationDetails,
    notes: String,
}

struct LayerEditor {
    layer_id: LayerId,
    name: String,
    notes: String,
}

struct LayerRow {
    id: LayerId,
    name: String,
    visible: bool,
    persisted: bool,
    saving: bool,
    unsynced: bool,
    slices: usize,
}

pub struct ViewerApp {
    settings_path: Option<PathBuf>,
    registry: SeriesRegistry,
    navigator: FrameNavigator,
    hover: HoverTracker,
    hit_config: HitTestConfig,
    engine: LocalEngine,
    loader: StackLoader,
    sync: AnnotationSyncBridge,
    layers: LayerManager,
    notifications: Notifications,
    catalog: HashMap<SeriesId, Vec<InstanceRecord>>,
    textures: [Option<ViewportTexture>; MAX_VIEWPORTS],
    viewport_rects: [Option<egui::Rect>; MAX_VIEWPORTS],
    load_errors: HashMap<usize, String>,
    active_viewport: usize,
    hovered_viewport: Option<usize>,
    /// Engine revision the hover target was last computed against.
    hover_revision: u64,
    tool: ActiveTool,
    brush_radius: f32,
    hover_card: Option<HoverCard>,
    selection: Option<Selection>,
    layer_editor: Option<LayerEditor>,
    pending_delete: Option<DeletePrompt>,
    pending_launch_request: Option<LaunchRequest>,
    status_line: String,
}

impl ViewerApp {
    pub fn new(
        settings: Settings,
        settings_path: Option<PathBuf>,
        initial_request: Option<LaunchRequest>,
        initial_status: Option<String>,
    ) -> Self {
        let (backend, backend_status) = connect_backend(&settings);
        let mut registry = SeriesRegistry::new(settings.viewer.layout);
        if settings.viewer.same_modality_only {
            registry = registry.with_policy(Box::new(SameModality));
        }
        let mut engine = LocalEngine::new(Arc::clone(&backend), JobMode::Threaded);
        engine.set_annotator(settings.backend.username.clone());

        Self {
            settings_path,
            registry,
            navigator: FrameNavigator::new(settings.wheel_pixels_per_step()),
            hover: HoverTracker::new(settings.hover_timings()),
            hit_config: settings.hit_test_config(),
            engine,
            loader: StackLoader::new(Arc::clone(&backend), JobMode::Threaded),
            sync: AnnotationSyncBridge::new(
                Arc::clone(&backend),
                JobMode::Threaded,
                settings.cache_ttl(),
            ),
            layers: LayerManager::new(backend, JobMode::Threaded),
            notifications: Notifications::new(settings.notification_lifetime()),
            catalog: HashMap::new(),
            textures: Default::default(),
            viewport_rects: Default::default(),
            load_errors: HashMap::new(),
            active_viewport: 0,
            hovered_viewport: None,
            hover_revision: 0,
            tool: ActiveTool::Navigate,
            brush_radius: DEFAULT_BRUSH_RADIUS,
            hover_card: None,
            selection: None,
            layer_editor: None,
            pending_delete: None,
            pending_launch_request: initial_request,
            status_line: initial_status.or(backend_status).unwrap_or_default(),
        }
    }

    fn apply_black_background(ctx: &egui::Context) {
        let mut visuals = egui::Visuals::dark();
        let line_base = Color32::from_gray(28);
        let line_hover = Color32::from_gray(42);
        let line_active = Color32::from_gray(56);

        visuals.panel_fill = Color32::BLACK;
        visuals.window_fill = Color32::from_gray(8);
        visuals.faint_bg_color = Color32::BLACK;
        visuals.extreme_bg_color = Color32::BLACK;
        visuals.window_stroke = Stroke::new(1.0, line_base);
        visuals.widgets.noninteractive.bg_stroke = Stroke::new(1.0, line_base);
        visuals.widgets.inactive.bg_stroke = Stroke::new(1.0, line_base);
        visuals.widgets.hovered.bg_stroke = Stroke::new(1.0, line_hover);
        visuals.widgets.active.bg_stroke = Stroke::new(1.0, line_active);
        visuals.widgets.open.bg_stroke = Stroke::new(1.0, line_base);
        visuals.selection.bg_fill = ACCENT.gamma_multiply(0.6);
        ctx.set_visuals(visuals);
    }

    fn is_busy(&self) -> bool {
        self.engine.is_loading()
            || self.loader.has_pending_work()
            || self.sync.has_pending_work()
            || self.layers.has_pending_work()
    }

    fn handle_launch_request(&mut self, request: LaunchRequest, now: Instant) {
        if let Some(layout) = request.layout {
            self.set_layout(layout, now);
        }
        for id in &request.series {
            self.remember_series(SeriesDescriptor::from_backend(id.clone()));
            self.loader.request_descriptor(SeriesId::new(id.clone()));
        }
        if !request.paths.is_empty() {
            self.remember_series(SeriesDescriptor::from_local_paths(request.paths));
        }
        self.registry.set_primary(request.primary.map(SeriesId::new));
        if self.registry.series_order().is_empty() {
            self.status_line = "Launch request had no series to open.".to_string();
            return;
        }
        self.bind_defaults(now);
    }

    fn open_dicoms(&mut self, ctx: &egui::Context, now: Instant) {
        let picked = rfd::FileDialog::new()
            .add_filter("DICOM", &["dcm"])
            .pick_files();

        if let Some(paths) = picked {
            self.open_local_paths(paths, now);
            ctx.request_repaint();
        }
    }

    fn open_dropped_files(&mut self, ctx: &egui::Context, now: Instant) {
        let dropped: Vec<PathBuf> = ctx.input(|input| {
            input
                .raw
                .dropped_files
                .iter()
                .filter_map(|file| file.path.clone())
                .collect()
        });
        if !dropped.is_empty() {
            self.open_local_paths(dropped, now);
        }
    }

    /// Opens a file selection as one series in the active viewport.
    fn open_local_paths(&mut self, paths: Vec<PathBuf>, now: Instant) {
        if paths.is_empty() {
            return;
        }
        let series = SeriesDescriptor::from_local_paths(paths);
        self.remember_series(series.clone());
        self.bind_series(self.active_viewport, series, now);
    }

    fn remember_series(&mut self, series: SeriesDescriptor) {
        let merged = merge_descriptor(self.registry.find_series(&series.id), series);
        self.registry.upsert_series(merged);
    }

    fn set_layout(&mut self, layout: GridLayout, now: Instant) {
        for viewport_index in self.registry.set_layout(layout) {
            self.loader.cancel_viewport(viewport_index);
            self.reset_viewport_state(viewport_index, now);
        }
        if self.active_viewport >= layout.viewport_count() {
            self.active_viewport = 0;
        }
        self.bind_defaults(now);
    }

    fn persist_layout(&self, layout: GridLayout) {
        let Some(path) = self.settings_path.as_deref() else {
            return;
        };
        // Reload so launch-time overrides such as credentials never reach the file.
        let mut stored = Settings::load_or_default(Some(path));
        stored.viewer.layout = layout;
        if let Err(err) = stored.save(path) {
            log::warn!("{err:#}");
        }
    }

    fn bind_defaults(&mut self, now: Instant) {
        for viewport_index in self.registry.bind_defaults() {
            self.start_binding(viewport_index, now);
        }
    }

    fn bind_series(&mut self, viewport_index: usize, series: SeriesDescriptor, now: Instant) {
        let assigned = self
            .registry
            .assign(viewport_index, series)
            .map(|binding| binding.generation);
        match assigned {
            Ok(_) => {
                self.active_viewport = viewport_index;
                self.start_binding(viewport_index, now);
            }
            Err(err) => {
                self.status_line = err.to_string();
                self.notifications.report(&err, now);
            }
        }
    }

    /// Drops everything tied to the viewport's previous binding.
    fn reset_viewport_state(&mut self, viewport_index: usize, now: Instant) {
        if let Some(event) = self.hover.invalidate_viewport(viewport_index) {
            self.on_hover_event(event, now);
        }
        self.sync.forget_viewport(viewport_index);
        self.navigator.reset_viewport(viewport_index);
        self.engine.disable(viewport_index);
        self.textures[viewport_index] = None;
        self.load_errors.remove(&viewport_index);
        if self
            .selection
            .as_ref()
            .is_some_and(|selection| selection.target.viewport_index == viewport_index)
        {
            self.selection = None;
        }
        if self
            .hover_card
            .as_ref()
            .is_some_and(|card| card.target.viewport_index == viewport_index)
        {
            self.hover_card = None;
        }
    }

    /// Unbinds the whole grid. Defaults are not re-applied until the next
    /// layout change or drop.
    fn close_all_viewports(&mut self, now: Instant) {
        self.registry.clear();
        for viewport_index in 0..MAX_VIEWPORTS {
            self.loader.cancel_viewport(viewport_index);
            self.reset_viewport_state(viewport_index, now);
        }
        self.status_line = "Closed all viewports.".to_string();
    }

    fn start_binding(&mut self, viewport_index: usize, now: Instant) {
        self.reset_viewport_state(viewport_index, now);
        let Some(binding) = self.registry.binding(viewport_index) else {
            return;
        };
        self.loader
            .request_stack(viewport_index, binding.generation, &binding.series);
    }

    fn poll_background(&mut self, now: Instant) {
        self.engine.poll();
        for event in self.loader.poll(&self.registry) {
            self.on_load_event(event);
        }

        let resolved = self.sync.poll(
            &self.registry,
            &mut self.engine,
            &mut self.notifications,
            now,
        );
        for update in resolved {
            if let Some(card) = self.hover_card.as_mut() {
                if AnnotationRef::from(&card.target) == update.target {
                    card.details = update.details.clone();
                }
            }
            if let Some(selection) = self.selection.as_mut() {
                if selection.target == update.target {
                    if selection.notes.is_empty() {
                        selection.notes = update.details.notes.clone().unwrap_or_default();
                    }
                    selection.details = update.details;
                }
            }
        }

        self.layers
            .poll(&mut self.engine, &mut self.notifications, now);
        while let Some(event) = self.hover.tick(now) {
            self.on_hover_event(event, now);
        }
        self.notifications.prune(now);
    }

    fn on_load_event(&mut self, event: LoadEvent) {
        match event {
            LoadEvent::Descriptor(descriptor) => self.remember_series(descriptor),
            LoadEvent::Stack(loaded) => self.on_stack_loaded(loaded),
            LoadEvent::Failed {
                viewport_index,
                message,
            } => {
                if let Some(viewport_index) = viewport_index {
                    self.load_errors.insert(viewport_index, message.clone());
                }
                self.status_line = message;
            }
        }
    }

    fn on_stack_loaded(&mut self, loaded: LoadedStack) {
        let LoadedStack {
            viewport_index,
            generation,
            series,
            instances,
            stack,
        } = loaded;
        if !self.engine.enable(viewport_index, generation, stack) {
            return;
        }
        let loaded_count = self
            .engine
            .loaded_image_count(viewport_index)
            .unwrap_or(0);
        let Some(binding) = self.registry.binding_mut(viewport_index) else {
            return;
        };
        let reported = series.stack_length.or(series.reported_instance_count);
        let outcome = reconcile_stack_length(binding, reported, loaded_count);
        let frame = binding.current_frame;

        if outcome == StackReconciliation::Empty {
            log::warn!("viewport {viewport_index}: series {} has no images", series.id);
            self.registry.unbind(viewport_index);
            self.engine.disable(viewport_index);
            self.load_errors
                .insert(viewport_index, "Series has no images".to_string());
            return;
        }

        self.engine.display_frame(viewport_index, frame);
        if series.source == SeriesSource::Backend {
            self.sync
                .load_for_binding(viewport_index, generation, &series.id);
            self.layers.load_from_backend(&series.id);
        }
        let mut known = series;
        known.stack_length = Some(loaded_count);
        self.catalog.insert(known.id.clone(), instances);
        self.remember_series(known);
    }

    fn show_frame(&mut self, change: FrameChange) {
        self.engine.display_frame(change.viewport_index, change.to);
    }

    fn set_tool(&mut self, tool: ActiveTool) {
        self.engine.cancel_stroke();
        self.tool = tool;
    }

    /// Keeps the brush pointed at the active layer.
    fn sync_brush_layer(&mut self) {
        let ActiveTool::Brush {
            layer_id,
            erase,
            radius,
        } = self.tool
        else {
            return;
        };
        match self.layers.active().map(|layer| layer.id.0) {
            Some(active) if active == layer_id => {}
            Some(active) => {
                self.tool = ActiveTool::Brush {
                    layer_id: active,
                    erase,
                    radius,
                }
            }
            None => self.set_tool(ActiveTool::Navigate),
        }
    }

    fn sync_drag_state(&mut self, ctx: &egui::Context) {
        match egui::DragAndDrop::payload::<SeriesDrag>(ctx) {
            Some(drag) => {
                if self.registry.drag_state().is_none() {
                    self.registry.begin_drag(drag.series_id.clone());
                }
            }
            None => {
                if self.registry.drag_state().is_some() {
                    self.registry.cancel_drag();
                }
            }
        }
    }

    /// Returns true when the window was asked to close.
    fn handle_keys(&mut self, ctx: &egui::Context, now: Instant) -> bool {
        let mut close_requested = false;
        let mut nav_key = None;
        let mut escape = false;
        let mut delete = false;
        let typing = ctx.wants_keyboard_input();
        ctx.input_mut(|input| {
            if input.consume_key(egui::Modifiers::COMMAND, egui::Key::W) {
                close_requested = true;
            }
            if typing {
                return;
            }
            for (key, nav) in NAV_KEYS {
                if input.consume_key(egui::Modifiers::NONE, key) {
                    nav_key = Some(nav);
                }
            }
            escape = input.consume_key(egui::Modifiers::NONE, egui::Key::Escape);
            delete = input.consume_key(egui::Modifiers::NONE, egui::Key::Delete);
        });
        if close_requested {
            ctx.send_viewport_cmd(ViewportCommand::Close);
            return true;
        }

        if let Some(key) = nav_key {
            if let Some(change) =
                self.navigator
                    .key(&mut self.registry, self.active_viewport, key)
            {
                self.show_frame(change);
            }
        }
        if escape {
            self.engine.cancel_stroke();
            self.selection = None;
        }
        if delete {
            self.delete_selection(now);
        }
        false
    }

    fn on_hover_event(&mut self, event: HoverEvent, now: Instant) {
        match event {
            HoverEvent::Entered(target) => {
                let target_ref = AnnotationRef::from(&target);
                match self
                    .sync
                    .resolve(&self.registry, &self.engine, &target_ref, now)
                {
                    Ok(resolution) => {
                        self.hover_card = Some(HoverCard {
                            details: resolution.details().clone(),
                            target,
                        });
                    }
                    Err(err) => {
                        self.hover_card = None;
                        self.notifications.report(&err, now);
                    }
                }
            }
            HoverEvent::Moved(target) => {
                if let Some(card) = self.hover_card.as_mut() {
                    if card.target.same_shape(&target) {
                        card.target = target;
                    }
                }
            }
            HoverEvent::Cleared(_) => self.hover_card = None,
        }
    }

    fn select(&mut self, target: AnnotationRef, now: Instant) {
        match self
            .sync
            .resolve(&self.registry, &self.engine, &target, now)
        {
            Ok(resolution) => {
                let details = resolution.details().clone();
                let notes = details.notes.clone().unwrap_or_default();
                self.selection = Some(Selection {
                    target,
                    details,
                    notes,
                });
            }
            Err(err) => {
                self.selection = None;
                self.notifications.report(&err, now);
            }
        }
    }

    fn delete_selection(&mut self, now: Instant) {
        let Some(selection) = self.selection.take() else {
            return;
        };
        if let Err(err) =
            self.sync
                .delete_annotation(&self.registry, &mut self.engine, &selection.target)
        {
            self.notifications.report(&err, now);
        }
        if self
            .hover_card
            .as_ref()
            .is_some_and(|card| card.target.client_id == selection.target.client_id)
        {
            self.hover_card = None;
        }
    }

    fn hit_target(&self, viewport_index: usize, pointer: Point) -> Option<HoverTarget> {
        let binding = self.registry.binding(viewport_index)?;
        let transform = self.engine.view_transform(viewport_index)?;
        let shapes = shapes_on_slice(&self.engine, viewport_index, binding.current_frame);
        let hit = hit_test(&self.hit_config, &shapes, pointer, &transform)?;
        Some(HoverTarget {
            viewport_index,
            generation: binding.generation,
            client_id: hit.shape.client_id.clone(),
            anchor: hit.anchor,
        })
    }

    fn begin_stroke(&mut self, viewport_index: usize, tool: ActiveTool, display: Point) -> bool {
        if let ActiveTool::Brush { layer_id, .. } = tool {
            let on_series = match (
                self.layers.layer(LayerId(layer_id)),
                self.registry.binding(viewport_index),
            ) {
                (Some(layer), Some(binding)) => layer.series_id == binding.series.id,
                _ => false,
            };
            if !on_series {
                self.status_line =
                    "Select a layer that belongs to this series before painting.".to_string();
                return false;
            }
        }
        self.engine.begin_stroke(viewport_index, tool, display)
    }

    fn finish_stroke(&mut self, now: Instant) {
        match self.engine.finish_stroke() {
            Some(StrokeOutcome::Annotation {
                viewport_index,
                client_id,
            }) => {
                let Some(generation) = self.registry.generation(viewport_index) else {
                    return;
                };
                self.select(
                    AnnotationRef {
                        viewport_index,
                        generation,
                        client_id,
                    },
                    now,
                );
            }
            Some(StrokeOutcome::Painted { layer_id, snapshot }) => {
                if let Err(err) = self.layers.record_snapshot(LayerId(layer_id), snapshot) {
                    self.notifications.report(&err, now);
                }
            }
            None => {}
        }
    }

    fn show_toolbar(&mut self, ctx: &egui::Context, now: Instant) {
        let mut open_dicoms_clicked = false;
        let mut close_all_clicked = false;
        let mut layout_choice = None;
        let mut signal = None;
        let viewport_index = self.active_viewport;

        egui::TopBottomPanel::top("toolbar").show(ctx, |ui| {
            ui.add_space(2.0);
            ui.horizontal_wrapped(|ui| {
                ui.menu_button("File", |ui| {
                    if ui.button("Open DICOM(s)").clicked() {
                        open_dicoms_clicked = true;
                        ui.close_menu();
                    }
                    if ui.button("Close all viewports").clicked() {
                        close_all_clicked = true;
                        ui.close_menu();
                    }
                });
                ui.menu_button("Layout", |ui| {
                    for layout in LAYOUTS {
                        if ui
                            .radio(self.registry.layout() == layout, layout.label())
                            .clicked()
                        {
                            layout_choice = Some(layout);
                            ui.close_menu();
                        }
                    }
                });
                ui.separator();
                self.show_tool_buttons(ui);
                ui.separator();
                for candidate in [
                    ViewerSignal::RotateCounterClockwise(viewport_index),
                    ViewerSignal::RotateClockwise(viewport_index),
                    ViewerSignal::Flip(viewport_index, FlipAxis::Horizontal),
                    ViewerSignal::Flip(viewport_index, FlipAxis::Vertical),
                    ViewerSignal::ResetView(viewport_index),
                    ViewerSignal::ClearAllAnnotations,
                ] {
                    if ui.button(candidate.label()).clicked() {
                        signal = Some(candidate);
                    }
                }
                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    ui.weak(format!("{APP_TITLE} v{APP_VERSION}"));
                });
            });
            ui.add_space(2.0);
        });

        if open_dicoms_clicked {
            self.open_dicoms(ctx, now);
        }
        if close_all_clicked {
            self.close_all_viewports(now);
        }
        if let Some(layout) = layout_choice {
            self.set_layout(layout, now);
            self.persist_layout(layout);
        }
        if let Some(signal) = signal {
            if apply_signal(signal, &self.registry, &mut self.engine) == 0 {
                self.status_line = format!("{}: nothing to change.", signal.label());
            }
            if signal == ViewerSignal::ClearAllAnnotations {
                self.selection = None;
                if let Some(event) = self.hover.reset() {
                    self.on_hover_event(event, now);
                }
            }
        }
    }

    fn show_tool_buttons(&mut self, ui: &mut egui::Ui) {
        if ui
            .selectable_label(self.tool == ActiveTool::Navigate, "Navigate")
            .on_hover_text("Drag to pan, Ctrl+wheel to zoom, click a shape to inspect it")
            .clicked()
        {
            self.set_tool(ActiveTool::Navigate);
        }
        for tool_type in ToolType::ALL {
            let tool = ActiveTool::Annotate(tool_type);
            if ui
                .selectable_label(self.tool == tool, tool_type.label())
                .clicked()
            {
                self.set_tool(tool);
            }
        }

        let active_layer = self.layers.active().map(|layer| layer.id);
        let brush_radius = self.brush_radius;
        let mut chosen = None;
        ui.add_enabled_ui(active_layer.is_some(), |ui| {
            for (label, erase) in [("Brush", false), ("Eraser", true)] {
                let selected = matches!(
                    self.tool,
                    ActiveTool::Brush { erase: current, .. } if current == erase
                );
                let response = ui
                    .selectable_label(selected, label)
                    .on_disabled_hover_text("Create or select a segmentation layer first");
                if response.clicked() {
                    if let Some(layer_id) = active_layer {
                        chosen = Some(ActiveTool::Brush {
                            layer_id: layer_id.0,
                            erase,
                            radius: brush_radius,
                        });
                    }
                }
            }
        });
        if let Some(tool) = chosen {
            self.set_tool(tool);
        }

        if let ActiveTool::Brush {
            layer_id, erase, ..
        } = self.tool
        {
            let slider = egui::Slider::new(&mut self.brush_radius, 1.0..=40.0).text("radius");
            if ui.add(slider).changed() {
                self.tool = ActiveTool::Brush {
                    layer_id,
                    erase,
                    radius: self.brush_radius,
                };
            }
        }
    }

    fn show_status_bar(&mut self, ctx: &egui::Context) {
        let mut request = None;
        let busy = self.is_busy();

        egui::TopBottomPanel::bottom("status-bar").show(ctx, |ui| {
            ui.horizontal(|ui| {
                if let Some(binding) = self.registry.binding(self.active_viewport) {
                    let last = binding.stack_length.saturating_sub(1);
                    let make = |command| NavRequest {
                        viewport_index: binding.viewport_index,
                        generation: binding.generation,
                        command,
                    };
                    ui.label(format!("Viewport {}", binding.viewport_index + 1));
                    if ui.button("<<").on_hover_text("First frame").clicked() {
                        request = Some(make(NavCommand::First));
                    }
                    if ui.button("<").on_hover_text("Previous frame").clicked() {
                        request = Some(make(NavCommand::Previous));
                    }
                    let mut frame = binding.current_frame;
                    let slider = egui::Slider::new(&mut frame, 0..=last).show_value(false);
                    if ui.add_enabled(last > 0, slider).changed() {
                        request = Some(make(NavCommand::GoTo(frame)));
                    }
                    if ui.button(">").on_hover_text("Next frame").clicked() {
                        request = Some(make(NavCommand::Next));
                    }
                    if ui.button(">>").on_hover_text("Last frame").clicked() {
                        request = Some(make(NavCommand::Last));
                    }
                    ui.monospace(format!(
                        "{:>4} / {}",
                        binding.current_frame + 1,
                        binding.stack_length
                    ));
                    ui.separator();
                }
                if busy {
                    ui.spinner();
                }
                ui.label(self.status_line.as_str());
            });
        });

        if let Some(request) = request {
            if let Some(change) = self.navigator.apply_request(&mut self.registry, request) {
                self.show_frame(change);
            }
        }
    }

    fn show_series_panel(&mut self, ctx: &egui::Context, now: Instant) {
        let mut show_on_active = None;

        egui::SidePanel::left("series-panel")
            .resizable(true)
            .default_width(230.0)
            .show(ctx, |ui| {
                ui.heading("Series");
                if self.registry.series_order().is_empty() {
                    ui.label("Open DICOM(s) or launch with series ids to start.");
                }
                egui::ScrollArea::vertical()
                    .id_salt("series-list")
                    .show(ui, |ui| {
                        for series in self.registry.series_order() {
                            let encoded = match encode_drag_payload(series) {
                                Ok(encoded) => encoded,
                                Err(err) => {
                                    log::warn!("series {} cannot be dragged: {err}", series.id);
                                    continue;
                                }
                            };
                            let shown_in = self
                                .registry
                                .viewports_for_series(&series.id)
                                .iter()
                                .map(|index| (index + 1).to_string())
                                .collect::<Vec<_>>();
                            let detail = match (series.stack_length, shown_in.is_empty()) {
                                (Some(length), true) => format!("{length} image(s)"),
                                (Some(length), false) => format!(
                                    "{length} image(s) · viewport {}",
                                    shown_in.join(", ")
                                ),
                                (None, true) => "not loaded".to_string(),
                                (None, false) => format!("viewport {}", shown_in.join(", ")),
                            };

                            let is_primary = self.registry.primary() == Some(&series.id);
                            ui.horizontal(|ui| {
                                if ui
                                    .small_button("Show")
                                    .on_hover_text("Show in the active viewport")
                                    .clicked()
                                {
                                    show_on_active = Some(series.clone());
                                }
                                let drag = SeriesDrag {
                                    series_id: series.id.clone(),
                                    encoded,
                                };
                                let id = egui::Id::new(("series-drag", series.id.as_str()));
                                ui.dnd_drag_source(id, drag, |ui| {
                                    ui.vertical(|ui| {
                                        if is_primary {
                                            ui.strong(format!("{} (primary)", series.label()));
                                        } else {
                                            ui.strong(series.label());
                                        }
                                        ui.small(detail);
                                    });
                                });
                            });
                            ui.add_space(4.0);
                        }
                    });
                ui.separator();
                ui.small("Drag a series onto a viewport to show it there.");
            });

        if let Some(series) = show_on_active {
            self.bind_series(self.active_viewport, series, now);
        }
    }

    fn show_inspector(&mut self, ctx: &egui::Context, now: Instant) {
        egui::SidePanel::right("inspector")
            .resizable(true)
            .default_width(270.0)
            .show(ctx, |ui| {
                egui::ScrollArea::vertical()
                    .id_salt("inspector-scroll")
                    .show(ui, |ui| {
                        self.show_layers(ui, now);
                        ui.separator();
                        self.show_selection(ui, now);
                        ui.separator();
                        self.show_series_annotations(ui, now);
                    });
            });
    }

    fn show_layers(&mut self, ui: &mut egui::Ui, now: Instant) {
        ui.heading("Segmentation");
        let Some((series_id, frame)) = self
            .registry
            .binding(self.active_viewport)
            .map(|binding| (binding.series.id.clone(), binding.current_frame))
        else {
            ui.label("Bind a series to the active viewport to segment it.");
            return;
        };

        ui.horizontal(|ui| {
            if ui.button("New layer").clicked() {
                self.layers
                    .create_layer(&mut self.engine, series_id.clone(), frame);
            }
            let mut global = self.layers.global_visible();
            if ui.checkbox(&mut global, "Show layers").changed() {
                self.layers.toggle_global_visibility(&mut self.engine);
            }
        });

        let rows: Vec<LayerRow> = self
            .layers
            .layers_for(&series_id)
            .map(|layer| LayerRow {
                id: layer.id,
                name: layer.name.clone(),
                visible: layer.visible,
                persisted: layer.is_persisted(),
                saving: self.layers.is_saving(layer.id)
                    || self.layers.is_syncing_snapshots(layer.id),
                unsynced: layer.has_unsynced_snapshots(),
                slices: layer.snapshots.len(),
            })
            .collect();
        if rows.is_empty() {
            let elsewhere = self.layers.layers().len();
            if elsewhere == 0 {
                ui.weak("No layers yet.");
            } else {
                ui.weak(format!("No layers for this series ({elsewhere} on other series)."));
            }
        }
        let active = self.layers.active().map(|layer| layer.id);

        for row in rows {
            ui.horizontal(|ui| {
                let (swatch, _) = ui.allocate_exact_size(egui::vec2(10.0, 10.0), Sense::hover());
                ui.painter().rect_filled(swatch, 2.0, labelmap_color(row.id.0));
                let mut visible = row.visible;
                if ui.checkbox(&mut visible, "").on_hover_text("Visible").changed() {
                    if let Err(err) = self.layers.set_visible(&mut self.engine, row.id, visible) {
                        self.notifications.report(&err, now);
                    }
                }
                let label = format!("{} ({} slice(s))", row.name, row.slices);
                if ui.selectable_label(active == Some(row.id), label).clicked() {
                    if let Err(err) = self.layers.select(row.id) {
                        self.notifications.report(&err, now);
                    }
                }
                if row.saving {
                    ui.spinner();
                } else if row.persisted && row.unsynced {
                    let retry = ui
                        .small_button("Save changes")
                        .on_hover_text("Painted slices have not reached the server yet");
                    if retry.clicked() {
                        if let Err(err) = self.layers.sync_snapshots(row.id) {
                            self.notifications.report(&err, now);
                        }
                    }
                } else if row.persisted {
                    ui.weak("saved");
                } else if ui.small_button("Save").clicked() {
                    if let Err(err) = self.layers.save(row.id) {
                        self.notifications.report(&err, now);
                    }
                }
                if ui.small_button("Delete").clicked() {
                    match self.layers.delete_prompt(row.id) {
                        Ok(prompt) => self.pending_delete = Some(prompt),
                        Err(err) => self.notifications.report(&err, now),
                    }
                }
            });
        }

        let Some(layer) = self.layers.active() else {
            self.layer_editor = None;
            return;
        };
        if self.layer_editor.as_ref().map(|editor| editor.layer_id) != Some(layer.id) {
            self.layer_editor = Some(LayerEditor {
                layer_id: layer.id,
                name: layer.name.clone(),
                notes: layer.notes.clone().unwrap_or_default(),
            });
        }
        let mut apply = false;
        if let Some(editor) = self.layer_editor.as_mut() {
            ui.add_space(6.0);
            ui.label("Layer name");
            ui.text_edit_singleline(&mut editor.name);
            ui.label("Notes");
            ui.text_edit_multiline(&mut editor.notes);
            apply = ui.button("Apply").clicked();
        }
        if !apply {
            return;
        }
        if let Some(editor) = self.layer_editor.as_ref() {
            let name = editor.name.trim();
            let metadata = LayerMetadata {
                name: (!name.is_empty()).then(|| name.to_string()),
                notes: Some(editor.notes.clone()),
                ..Default::default()
            };
            if let Err(err) = self.layers.update_metadata(editor.layer_id, metadata) {
                self.notifications.report(&err, now);
            }
        }
    }

    fn show_selection(&mut self, ui: &mut egui::Ui, now: Instant) {
        ui.heading("Annotation");
        let Some(target) = self.selection.as_ref().map(|selection| selection.target.clone())
        else {
            ui.label("Click an annotation to inspect it.");
            return;
        };
        let live = self
            .registry
            .is_current(target.viewport_index, target.generation)
            .then(|| self.engine.annotation(target.viewport_index, &target.client_id))
            .flatten();
        let Some(live) = live else {
            self.selection = None;
            return;
        };
        let persisted_id = live.correlation_id;
        let saving = self.sync.is_saving(&target.client_id);

        let mut save = false;
        let mut delete = false;
        let mut patch = None;
        if let Some(selection) = self.selection.as_mut() {
            details_grid(ui, &selection.details, persisted_id.as_deref());
            ui.horizontal(|ui| {
                if saving {
                    ui.spinner();
                    ui.label("Saving...");
                } else if persisted_id.is_none() {
                    save = ui.button("Save").clicked();
                }
                delete = ui.button("Delete").clicked();
            });
            if persisted_id.is_some() {
                ui.label("Notes");
                ui.text_edit_multiline(&mut selection.notes);
                if ui.button("Update notes").clicked() {
                    selection.details.notes = Some(selection.notes.clone());
                    patch = Some(AnnotationPatch {
                        notes: Some(selection.notes.clone()),
                        ..Default::default()
                    });
                }
            }
        }

        if save {
            if let Err(err) = self.sync.save_draft(&self.registry, &self.engine, &target) {
                self.notifications.report(&err, now);
            }
        }
        if let Some(patch) = patch {
            if let Err(err) =
                self.sync
                    .update_annotation(&self.registry, &self.engine, &target, patch)
            {
                self.notifications.report(&err, now);
            }
        }
        if delete {
            self.delete_selection(now);
        }
    }

    fn show_series_annotations(&mut self, ui: &mut egui::Ui, now: Instant) {
        let Some(series_id) = self
            .registry
            .binding(self.active_viewport)
            .map(|binding| binding.series.id.clone())
        else {
            return;
        };
        let viewports = self.registry.viewports_for_series(&series_id);
        if !viewports
            .iter()
            .all(|viewport_index| self.engine.is_enabled(*viewport_index))
        {
            return;
        }
        let instances = self
            .catalog
            .get(&series_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let collected =
            self.sync
                .collect_series_annotations(&self.registry, &self.engine, &series_id, instances);
        let selected = self
            .selection
            .as_ref()
            .map(|selection| selection.target.client_id.clone());

        let mut picked = None;
        ui.collapsing(format!("Series annotations ({})", collected.len()), |ui| {
            for item in &collected {
                let instance = item
                    .instance
                    .as_ref()
                    .and_then(|instance| instance.file_name.clone())
                    .unwrap_or_else(|| "unmatched".to_string());
                let text = format!(
                    "{} · slice {} · {}",
                    item.shape.tool_type.label(),
                    item.shape.slice_index + 1,
                    instance
                );
                let is_selected = selected.as_deref() == Some(item.shape.client_id.as_str());
                if ui.selectable_label(is_selected, text).clicked() {
                    picked = Some((
                        item.viewport_index,
                        item.shape.client_id.clone(),
                        item.shape.slice_index,
                    ));
                }
            }
        });

        let Some((viewport_index, client_id, slice_index)) = picked else {
            return;
        };
        let Some(generation) = self.registry.generation(viewport_index) else {
            return;
        };
        let request = NavRequest {
            viewport_index,
            generation,
            command: NavCommand::GoTo(slice_index),
        };
        if let Some(change) = self.navigator.apply_request(&mut self.registry, request) {
            self.show_frame(change);
        }
        self.active_viewport = viewport_index;
        self.select(
            AnnotationRef {
                viewport_index,
                generation,
                client_id,
            },
            now,
        );
    }

    fn show_grid(&mut self, ui: &mut egui::Ui, now: Instant) {
        self.viewport_rects = Default::default();
        let (rows, columns) = self.registry.layout().shape();
        let available = ui.available_size();
        let cell_size = egui::vec2(
            ((available.x - GRID_GAP * (columns - 1) as f32) / columns as f32).max(1.0),
            ((available.y - GRID_GAP * (rows - 1) as f32) / rows as f32).max(1.0),
        );

        ui.scope(|ui| {
            ui.spacing_mut().item_spacing = egui::vec2(GRID_GAP, GRID_GAP);
            for row in 0..rows {
                ui.horizontal(|ui| {
                    for column in 0..columns {
                        self.show_viewport(ui, row * columns + column, cell_size, now);
                    }
                });
            }
        });
    }

    fn show_viewport(
        &mut self,
        ui: &mut egui::Ui,
        viewport_index: usize,
        size: egui::Vec2,
        now: Instant,
    ) {
        let (rect, response) = ui.allocate_exact_size(size, Sense::click_and_drag());
        self.viewport_rects[viewport_index] = Some(rect);
        self.engine
            .set_viewport_size(viewport_index, rect.width(), rect.height());

        if response.clicked() || response.drag_started() {
            self.active_viewport = viewport_index;
        }
        self.handle_drop(&response, viewport_index, now);
        self.handle_pointer(ui, &response, viewport_index, rect, now);
        self.track_hover(ui, &response, viewport_index, rect, now);

        let painter = ui.painter_at(rect);
        painter.rect_filled(rect, 0.0, Color32::BLACK);
        self.paint_viewport(ui.ctx(), &painter, viewport_index, rect);

        let border = if self.registry.is_drop_highlighted(viewport_index) {
            Stroke::new(2.0, DROP_HIGHLIGHT)
        } else if viewport_index == self.active_viewport {
            Stroke::new(1.0, ACCENT)
        } else {
            Stroke::new(1.0, Color32::from_gray(28))
        };
        painter.rect_stroke(rect.shrink(1.0), 0.0, border);
    }

    fn handle_drop(&mut self, response: &egui::Response, viewport_index: usize, now: Instant) {
        if response.dnd_hover_payload::<SeriesDrag>().is_some() {
            self.registry.drag_over(viewport_index);
        } else {
            self.registry.drag_leave(viewport_index);
        }
        let Some(drag) = response.dnd_release_payload::<SeriesDrag>() else {
            return;
        };
        let accepted = self
            .registry
            .accept_drop(viewport_index, &drag.encoded)
            .map(|binding| binding.generation);
        match accepted {
            Ok(_) => {
                self.active_viewport = viewport_index;
                self.start_binding(viewport_index, now);
            }
            Err(err) => {
                self.status_line = err.to_string();
                self.notifications.report(&err, now);
            }
        }
    }

    fn handle_pointer(
        &mut self,
        ui: &egui::Ui,
        response: &egui::Response,
        viewport_index: usize,
        rect: egui::Rect,
        now: Instant,
    ) {
        let local = |pos: egui::Pos2| Point::new(pos.x - rect.min.x, pos.y - rect.min.y);
        let (pointer_delta, press_origin, zoom_delta, raw_scroll, smooth_scroll) =
            ui.input(|input| {
                (
                    input.pointer.delta(),
                    input.pointer.press_origin(),
                    input.zoom_delta(),
                    input.raw_scroll_delta,
                    input.smooth_scroll_delta,
                )
            });

        match self.tool {
            ActiveTool::Navigate => {
                if response.dragged() {
                    self.engine
                        .pan_by(viewport_index, pointer_delta.x, pointer_delta.y);
                }
                if response.double_clicked() {
                    apply_signal(
                        ViewerSignal::ResetView(viewport_index),
                        &self.registry,
                        &mut self.engine,
                    );
                } else if response.clicked() {
                    let hit = response
                        .interact_pointer_pos()
                        .and_then(|pos| self.hit_target(viewport_index, local(pos)));
                    match hit {
                        Some(target) => self.select(AnnotationRef::from(&target), now),
                        None => self.selection = None,
                    }
                }
            }
            tool => {
                if response.drag_started() {
                    if let Some(origin) = press_origin {
                        self.begin_stroke(viewport_index, tool, local(origin));
                    }
                } else if response.dragged() {
                    if let Some(pos) = response.interact_pointer_pos() {
                        self.engine.drag_stroke(local(pos));
                    }
                }
                if response.drag_stopped() {
                    self.finish_stroke(now);
                } else if response.clicked() {
                    if let Some(pos) = response.interact_pointer_pos() {
                        if self.begin_stroke(viewport_index, tool, local(pos)) {
                            self.finish_stroke(now);
                        }
                    }
                }
            }
        }

        if !response.hovered() {
            return;
        }
        let scroll = dominant_scroll_axis(raw_scroll, smooth_scroll);
        if (zoom_delta - 1.0).abs() > f32::EPSILON {
            self.engine.zoom_by(viewport_index, zoom_delta);
        } else if scroll.abs() > f32::EPSILON {
            // egui reports wheel-down as negative; stack navigation counts it forward.
            if let Some(change) = self
                .navigator
                .wheel(&mut self.registry, viewport_index, -scroll)
            {
                self.show_frame(change);
            }
        }
    }

    /// Feeds the hover tracker on pointer movement, so an idle pointer lets the
    /// dwell timer run out. A still pointer is re-checked whenever the engine
    /// redraws, since a frame change or delete swaps the shapes under it.
    fn track_hover(
        &mut self,
        ui: &egui::Ui,
        response: &egui::Response,
        viewport_index: usize,
        rect: egui::Rect,
        now: Instant,
    ) {
        if response.hovered() && !response.dragged() {
            let moved = self.hovered_viewport != Some(viewport_index)
                || ui.input(|input| input.pointer.delta() != egui::Vec2::ZERO);
            let redrawn = self.hover_revision != self.engine.revision();
            self.hovered_viewport = Some(viewport_index);
            if moved || redrawn {
                self.hover_revision = self.engine.revision();
                let candidate = response.hover_pos().and_then(|pos| {
                    self.hit_target(
                        viewport_index,
                        Point::new(pos.x - rect.min.x, pos.y - rect.min.y),
                    )
                });
                if moved {
                    self.hover.pointer(now, candidate);
                } else if let Some(event) = self.hover.retarget(now, candidate) {
                    self.on_hover_event(event, now);
                }
            }
        } else if self.hovered_viewport == Some(viewport_index) {
            self.hovered_viewport = None;
            self.hover.pointer(now, None);
        }
    }

    fn refresh_texture(
        &mut self,
        ctx: &egui::Context,
        viewport_index: usize,
    ) -> Option<egui::TextureId> {
        let revision = self.engine.revision();
        let stale = self.textures[viewport_index]
            .as_ref()
            .map_or(true, |texture| texture.revision != revision);
        if stale {
            let image = self.engine.render(viewport_index)?;
            match self.textures[viewport_index].as_mut() {
                Some(texture) => {
                    texture.handle.set(image, TextureOptions::LINEAR);
                    texture.revision = revision;
                }
                None => {
                    let handle = ctx.load_texture(
                        format!("viewport-{viewport_index}"),
                        image,
                        TextureOptions::LINEAR,
                    );
                    self.textures[viewport_index] = Some(ViewportTexture { handle, revision });
                }
            }
        }
        self.textures[viewport_index]
            .as_ref()
            .map(|texture| texture.handle.id())
    }

    fn paint_viewport(
        &mut self,
        ctx: &egui::Context,
        painter: &egui::Painter,
        viewport_index: usize,
        rect: egui::Rect,
    ) {
        let message = match self.engine.frame_status(viewport_index) {
            FrameStatus::Ready => None,
            FrameStatus::Unbound => Some(if self.loader.is_loading(viewport_index) {
                "Loading series...".to_string()
            } else if let Some(err) = self.load_errors.get(&viewport_index) {
                err.clone()
            } else if self.registry.binding(viewport_index).is_some() {
                "Waiting for images...".to_string()
            } else if let Some(series) = self.registry.get(viewport_index) {
                format!("Drop a series here\n(default: {})", series.label())
            } else {
                "Drop a series here".to_string()
            }),
            FrameStatus::Loading => Some("Loading image...".to_string()),
            FrameStatus::Failed(reason) => Some(reason),
        };

        match message {
            Some(message) => {
                painter.text(
                    rect.center(),
                    egui::Align2::CENTER_CENTER,
                    message,
                    FontId::proportional(14.0),
                    Color32::from_gray(150),
                );
            }
            None => {
                if let Some(transform) = self.engine.view_transform(viewport_index) {
                    if let Some(texture) = self.refresh_texture(ctx, viewport_index) {
                        painter.add(egui::Shape::mesh(image_mesh(texture, &transform, rect.min)));
                    }
                    self.paint_annotations(painter, viewport_index, &transform, rect.min);
                    self.paint_stroke_preview(painter, viewport_index, &transform, rect.min);
                }
            }
        }
        self.paint_caption(painter, viewport_index, rect);
    }

    fn paint_annotations(
        &self,
        painter: &egui::Painter,
        viewport_index: usize,
        transform: &ViewTransform,
        origin: egui::Pos2,
    ) {
        let Some(binding) = self.registry.binding(viewport_index) else {
            return;
        };
        let hovered = self
            .hover_card
            .as_ref()
            .filter(|card| card.target.viewport_index == viewport_index)
            .map(|card| card.target.client_id.as_str());
        let selected = self
            .selection
            .as_ref()
            .filter(|selection| selection.target.viewport_index == viewport_index)
            .map(|selection| selection.target.client_id.as_str());

        for shape in shapes_on_slice(&self.engine, viewport_index, binding.current_frame) {
            let color = parse_color_code(&shape.style.color_code).unwrap_or(ANNOTATION_FALLBACK);
            let emphasized = hovered == Some(shape.client_id.as_str())
                || selected == Some(shape.client_id.as_str());
            let stroke = Stroke::new(if emphasized { 2.5 } else { 1.5 }, color);
            let points: Vec<egui::Pos2> = shape
                .geometry
                .iter()
                .map(|point| to_pos(origin, transform.image_to_display(*point)))
                .collect();
            for outline in annotation_outline(shape.tool_type, &points, stroke) {
                painter.add(outline);
            }
            let caption = shape.measurement().or_else(|| shape.text_content.clone());
            if let (Some(caption), Some(last)) = (caption, points.last()) {
                painter.text(
                    *last + egui::vec2(6.0, -6.0),
                    egui::Align2::LEFT_BOTTOM,
                    caption,
                    FontId::proportional(12.0),
                    color,
                );
            }
        }
    }

    fn paint_stroke_preview(
        &self,
        painter: &egui::Painter,
        viewport_index: usize,
        transform: &ViewTransform,
        origin: egui::Pos2,
    ) {
        let Some((tool, points)) = self.engine.stroke_preview(viewport_index) else {
            return;
        };
        match tool {
            ActiveTool::Annotate(tool_type) => {
                let display: Vec<egui::Pos2> = points
                    .iter()
                    .map(|point| to_pos(origin, transform.image_to_display(*point)))
                    .collect();
                for outline in annotation_outline(tool_type, &display, Stroke::new(1.0, ACCENT))
                {
                    painter.add(outline);
                }
            }
            ActiveTool::Brush { radius, erase, .. } => {
                let Some(last) = points.last() else {
                    return;
                };
                let center = transform.image_to_display(*last);
                let edge = transform.image_to_display(Point::new(last.x + radius, last.y));
                let color = if erase { Color32::from_gray(180) } else { ACCENT };
                painter.circle_stroke(
                    to_pos(origin, center),
                    center.distance_to(edge),
                    Stroke::new(1.0, color),
                );
            }
            ActiveTool::Navigate => {}
        }
    }

    fn paint_caption(&self, painter: &egui::Painter, viewport_index: usize, rect: egui::Rect) {
        let Some(binding) = self.registry.binding(viewport_index) else {
            return;
        };
        let label = self
            .registry
            .find_series(&binding.series.id)
            .unwrap_or(&binding.series)
            .label();
        let color = Color32::from_gray(200);
        painter.text(
            rect.left_top() + egui::vec2(6.0, 4.0),
            egui::Align2::LEFT_TOP,
            label,
            FontId::proportional(12.0),
            color,
        );
        painter.text(
            rect.left_bottom() + egui::vec2(6.0, -4.0),
            egui::Align2::LEFT_BOTTOM,
            frame_caption(binding.current_frame, binding.stack_length, binding.stack_confirmed),
            FontId::monospace(12.0),
            color,
        );
    }

    fn show_hover_card(&self, ctx: &egui::Context) {
        let Some(card) = self.hover_card.as_ref() else {
            return;
        };
        let Some(rect) = self
            .viewport_rects
            .get(card.target.viewport_index)
            .copied()
            .flatten()
        else {
            return;
        };
        let position = to_pos(rect.min, card.target.anchor) + egui::vec2(14.0, 14.0);
        egui::Area::new(egui::Id::new("annotation-hover-card"))
            .order(egui::Order::Tooltip)
            .fixed_pos(position)
            .interactable(false)
            .show(ctx, |ui| {
                egui::Frame::popup(ui.style()).show(ui, |ui| {
                    ui.set_max_width(260.0);
                    details_grid(ui, &card.details, card.details.persisted_id.as_deref());
                });
            });
    }

    fn show_delete_prompt(&mut self, ctx: &egui::Context, now: Instant) {
        let Some(prompt) = self.pending_delete.clone() else {
            return;
        };
        let mut confirmed = false;
        let mut cancelled = false;
        egui::Window::new(prompt.title.clone())
            .id(egui::Id::new("layer-delete-prompt"))
            .collapsible(false)
            .resizable(false)
            .anchor(egui::Align2::CENTER_CENTER, egui::Vec2::ZERO)
            .show(ctx, |ui| {
                ui.label(prompt.message.as_str());
                ui.add_space(8.0);
                ui.horizontal(|ui| {
                    let label = if prompt.persisted { "Delete" } else { "Discard" };
                    confirmed = ui
                        .button(egui::RichText::new(label).color(ERROR_TEXT))
                        .clicked();
                    cancelled = ui.button("Cancel").clicked();
                });
            });

        if confirmed {
            self.pending_delete = None;
            if let Err(err) = self
                .layers
                .delete(&mut self.engine, prompt.layer_id, prompt.token)
            {
                self.notifications.report(&err, now);
            }
        } else if cancelled {
            self.pending_delete = None;
            self.layers.cancel_delete(prompt.layer_id);
        }
    }

    fn show_notifications(&mut self, ctx: &egui::Context) {
        if self.notifications.is_empty() {
            return;
        }
        let mut dismissed = None;
        egui::Area::new(egui::Id::new("notifications"))
            .order(egui::Order::Foreground)
            .anchor(egui::Align2::RIGHT_BOTTOM, egui::vec2(-10.0, -40.0))
            .show(ctx, |ui| {
                ui.set_max_width(360.0);
                for notification in self.notifications.iter() {
                    let color = match notification.level {
                        NotificationLevel::Error => ERROR_TEXT,
                        NotificationLevel::Info => ui.visuals().text_color(),
                    };
                    egui::Frame::popup(ui.style()).show(ui, |ui| {
                        ui.horizontal(|ui| {
                            ui.label(
                                egui::RichText::new(notification.message.as_str()).color(color),
                            );
                            if ui.small_button("x").clicked() {
                                dismissed = Some(notification.id);
                            }
                        });
                    });
                }
            });
        if let Some(id) = dismissed {
            self.notifications.dismiss(id);
        }
    }

    fn schedule_repaint(&self, ctx: &egui::Context, now: Instant) {
        if self.is_busy() || self.registry.drag_state().is_some() {
            ctx.request_repaint_after(BUSY_REPAINT_INTERVAL);
            return;
        }
        let deadline = [self.hover.next_deadline(), self.notifications.next_expiry()]
            .into_iter()
            .flatten()
            .min();
        if let Some(deadline) = deadline {
            ctx.request_repaint_after(deadline.saturating_duration_since(now));
        }
    }

    fn shutdown(&mut self) {
        self.engine.cancel_stroke();
        self.loader.cancel_all();
        self.sync.cancel_all();
        self.layers.cancel_all();
    }
}

impl eframe::App for ViewerApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        let now = Instant::now();
        Self::apply_black_background(ctx);

        if let Some(request) = self.pending_launch_request.take() {
            self.handle_launch_request(request, now);
        }
        self.open_dropped_files(ctx, now);
        self.poll_background(now);
        self.sync_brush_layer();
        if self.handle_keys(ctx, now) {
            return;
        }
        self.sync_drag_state(ctx);

        self.show_toolbar(ctx, now);
        self.show_status_bar(ctx);
        self.show_series_panel(ctx, now);
        self.show_inspector(ctx, now);
        egui::CentralPanel::default()
            .frame(egui::Frame::none().fill(Color32::BLACK))
            .show(ctx, |ui| self.show_grid(ui, now));

        self.show_hover_card(ctx);
        self.show_delete_prompt(ctx, now);
        self.show_notifications(ctx);

        if self.is_busy() {
            ctx.set_cursor_icon(egui::CursorIcon::Progress);
        }
        self.schedule_repaint(ctx, now);
    }
}

impl Drop for ViewerApp {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn connect_backend(settings: &Settings) -> (Arc<dyn Backend>, Option<String>) {
    let offline: Arc<dyn Backend> = Arc::new(OfflineBackend);
    let Some(config) = settings.backend_config() else {
        log::info!("no backend configured, local files only");
        return (offline, None);
    };
    match HttpBackend::new(&config) {
        Ok(backend) => {
            log::info!("using backend {}", backend.base_url());
            let backend: Arc<dyn Backend> = Arc::new(backend);
            (backend, None)
        }
        Err(err) => {
            log::error!("could not set up backend client: {err:#}");
            (offline, Some(format!("Backend unavailable: {err:#}")))
        }
    }
}

/// Later descriptors win, but never erase what an earlier one already knew.
fn merge_descriptor(
    known: Option<&SeriesDescriptor>,
    mut incoming: SeriesDescriptor,
) -> SeriesDescriptor {
    let Some(known) = known else {
        return incoming;
    };
    if incoming.description.trim().is_empty() {
        incoming.description = known.description.clone();
    }
    incoming.modality = incoming.modality.or_else(|| known.modality.clone());
    incoming.study_uid = incoming.study_uid.or_else(|| known.study_uid.clone());
    incoming.reported_instance_count = incoming
        .reported_instance_count
        .or(known.reported_instance_count);
    incoming.stack_length = incoming.stack_length.or(known.stack_length);
    incoming
}

fn dominant_scroll_axis(raw_scroll: egui::Vec2, smooth_scroll: egui::Vec2) -> f32 {
    let pick = |delta: egui::Vec2| {
        if delta.y.abs() >= delta.x.abs() {
            delta.y
        } else {
            delta.x
        }
    };

    if smooth_scroll != egui::Vec2::ZERO {
        pick(smooth_scroll)
    } else {
        pick(raw_scroll)
    }
}

/// Frame counter shown under each viewport; the length is provisional until the engine
/// reports its loaded stack.
fn frame_caption(current_frame: usize, stack_length: usize, confirmed: bool) -> String {
    if confirmed {
        format!("{} / {stack_length}", current_frame + 1)
    } else {
        format!("{} / {stack_length}?", current_frame + 1)
    }
}

fn format_timestamp(value: DateTime<Utc>) -> String {
    value
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M")
        .to_string()
}

fn details_grid(ui: &mut egui::Ui, details: &AnnotationDetails, persisted_id: Option<&str>) {
    ui.strong(
        details
            .label
            .as_deref()
            .unwrap_or_else(|| details.tool_type.label()),
    );
    let state = match persisted_id {
        Some(_) => details
            .status
            .clone()
            .unwrap_or_else(|| "saved".to_string()),
        None => "draft (unsaved)".to_string(),
    };
    egui::Grid::new(("annotation-details", details.client_id.as_str()))
        .num_columns(2)
        .show(ui, |ui| {
            let row = |ui: &mut egui::Ui, key: &str, value: Option<String>| {
                if let Some(value) = value {
                    ui.monospace(key);
                    ui.label(value);
                    ui.end_row();
                }
            };
            row(ui, "Tool", Some(details.tool_type.label().to_string()));
            row(ui, "Slice", Some((details.slice_index + 1).to_string()));
            row(ui, "Measure", details.measurement.clone());
            row(ui, "State", Some(state));
            row(ui, "Annotator", details.annotator_id.clone());
            row(ui, "Reviewer", details.reviewer_id.clone());
            row(
                ui,
                "Notes",
                details.notes.clone().filter(|notes| !notes.trim().is_empty()),
            );
            row(ui, "Created", details.created_at.map(format_timestamp));
            row(ui, "Updated", details.updated_at.map(format_timestamp));
        });
    if persisted_id.is_some() && !details.enriched {
        ui.horizontal(|ui| {
            ui.spinner();
            ui.small("Fetching saved details...");
        });
    }
}
