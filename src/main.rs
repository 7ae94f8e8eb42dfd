mod annotation;
mod app;
mod backend;
mod dicom;
mod engine;
mod error;
mod geometry;
mod hittest;
mod hover;
mod jobs;
mod labelmap;
mod launch;
mod loader;
mod local_engine;
mod navigation;
mod notify;
mod registry;
mod renderer;
mod segmentation;
mod series;
mod settings;
mod signals;
mod sync;

fn main() -> eframe::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    let (initial_request, initial_status) = match launch::parse_launch_request_from_args(&cli_args)
    {
        Ok(request) => (request, None),
        Err(err) => {
            log::error!("rejected launch arguments: {err}");
            (None, Some(format!("Launch URL/args error: {err}")))
        }
    };

    let settings_path = settings::settings_file_path();
    let mut settings = settings::Settings::load_or_default(settings_path.as_deref());
    settings.apply_env();
    if let Some(request) = initial_request.as_ref() {
        settings.apply_launch(request);
    }

    let native_options = eframe::NativeOptions {
        viewport: eframe::egui::ViewportBuilder::default()
            .with_inner_size([1440.0, 900.0])
            .with_min_inner_size([800.0, 520.0])
            .with_resizable(true),
        ..Default::default()
    };

    eframe::run_native(
        "RadView",
        native_options,
        Box::new(move |_cc| {
            Ok(Box::new(app::ViewerApp::new(
                settings,
                settings_path,
                initial_request,
                initial_status,
            )))
        }),
    )
}
