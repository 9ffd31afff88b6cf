mod error;
mod html;
mod routes;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::info;

use chessboard_vision::{
    CameraCalibrationService, ChessboardPattern, ComponentConfig, GenericService, Model, Module,
    ModuleConfig, PassStore, PassWatcher,
};

use routes::{router, AppState};

#[derive(Parser, Debug)]
#[command(name = "calib-webapp", version, about = "Calibration pass browser and calibration API")]
struct Args {
    /// Directory holding one sub-directory per calibration pass
    #[arg(long, default_value = "module-data/calibration-passes")]
    base_dir: PathBuf,

    #[arg(long, default_value = "0.0.0.0:5000")]
    listen: SocketAddr,

    /// Disable the completed-pass watcher
    #[arg(long)]
    no_watch: bool,

    /// Seconds between watcher scans
    #[arg(long, default_value_t = 2.0)]
    check_interval: f64,

    /// Module config providing the calibration service
    #[arg(long)]
    config: Option<PathBuf>,

    /// Service name in the module config
    #[arg(long, requires = "config")]
    service: Option<String>,

    /// Board inner corners as COLSxROWS when no config is given
    #[arg(long, default_value = "9x6")]
    grid: ChessboardPattern,

    #[arg(long, default_value_t = 25.0)]
    square_mm: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    let args = Args::parse();

    let store = PassStore::new(&args.base_dir)
        .with_context(|| format!("creating {}", args.base_dir.display()))?;
    let calibration = calibration_service(&args)?;

    let watcher = if args.no_watch {
        None
    } else {
        let summaries = store.clone();
        let interval = Duration::try_from_secs_f64(args.check_interval)
            .map_err(|e| anyhow!("invalid --check-interval: {e}"))?;
        Some(
            PassWatcher::new(store.base_dir())
                .with_interval(interval)
                .spawn(move |pass_id, dir| {
                    info!(pass_id, dir = %dir.display(), "pass complete");
                    if let Some(metadata) = summaries.metadata(pass_id)? {
                        info!(pass_id, %metadata, "pass metadata");
                    }
                    summaries.write_summary(pass_id).map(|_| ())
                }),
        )
    };

    let app = router(AppState {
        store: store.clone(),
        calibration: Some(calibration),
        watcher_enabled: watcher.is_some(),
    });

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    info!("Starting calibration webapp on http://{}", args.listen);
    info!("Saving files to: {}", store.base_dir().display());

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    if let Some(watcher) = watcher {
        watcher.stop().await;
    }
    info!("Webapp stopped");
    Ok(())
}

fn setup_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn calibration_service(args: &Args) -> Result<Arc<dyn GenericService>> {
    if let Some(path) = &args.config {
        let module = Module::build(&ModuleConfig::load(path)?)?;
        return match &args.service {
            Some(name) => Ok(module.service(name)?),
            None => module
                .sole_service()
                .ok_or_else(|| anyhow!("{} needs exactly one service, or pass --service", path.display())),
        };
    }
    let attributes = json!({
        "pattern_size": [args.grid.cols, args.grid.rows],
        "square_size_mm": args.square_mm,
    });
    let attributes = attributes
        .as_object()
        .cloned()
        .ok_or_else(|| anyhow!("attributes must be an object"))?;
    let config = ComponentConfig::new("calibration", Model::camera_calibration(), attributes);
    Ok(Arc::new(CameraCalibrationService::new(&config)?))
}
