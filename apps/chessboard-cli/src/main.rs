use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand, ValueEnum};
use nalgebra::Matrix3;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use chessboard_vision::image_io::{decode_image, to_gray};
use chessboard_vision::service::CalibrationSummary;
use chessboard_vision::{
    detect_chessboard_corners, matrix_to_ov, ov_to_matrix, render_chessboard_png, share,
    BoardScene, CameraCalibrationService, CameraIntrinsics, ChessboardPattern, ChessboardTracker,
    ComponentConfig, Dependencies, DistortionModel, FileCamera, FileCameraConfig, GenericService,
    Model, Module, ModuleConfig, OrientationVector, PassStore, PoseTracker,
};

#[derive(Parser, Debug)]
#[command(
    name = "chessboard",
    version,
    about = "Chessboard pose tracking and camera calibration",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ModelArg {
    Standard,
    Rational,
}

impl From<ModelArg> for DistortionModel {
    fn from(m: ModelArg) -> Self {
        match m {
            ModelArg::Standard => DistortionModel::Standard5,
            ModelArg::Rational => DistortionModel::Rational8,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Find chessboard inner corners in an image
    Detect {
        #[arg(long)]
        image: PathBuf,
        /// Inner corners as COLSxROWS (e.g., 9x6)
        #[arg(long, default_value = "9x6")]
        grid: ChessboardPattern,
    },
    /// Board pose from an image, or from a tracker in a module config
    Pose {
        /// Image file or directory (first image is used)
        #[arg(long, conflicts_with = "config")]
        image: Option<PathBuf>,
        #[arg(long, default_value = "9x6")]
        grid: ChessboardPattern,
        #[arg(long, default_value_t = 25.0)]
        square_mm: f64,
        /// Calibration summary JSON written by `calibrate`
        #[arg(long)]
        calibration: Option<PathBuf>,
        /// Intrinsics as fx,fy,cx,cy
        #[arg(long)]
        intrinsics: Option<String>,
        /// Distortion as k1,k2,p1,p2,k3[,k4,k5,k6]
        #[arg(long)]
        distortion: Option<String>,
        /// Module config (YAML or JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Pose tracker name in the module config
        #[arg(long, requires = "config")]
        tracker: Option<String>,
    },
    /// Calibrate camera intrinsics from chessboard images
    Calibrate {
        /// Image files or directories
        #[arg(required = true)]
        images: Vec<PathBuf>,
        #[arg(long, default_value = "9x6")]
        grid: ChessboardPattern,
        #[arg(long, default_value_t = 25.0)]
        square_mm: f64,
        #[arg(long, value_enum, default_value_t = ModelArg::Rational)]
        model: ModelArg,
        /// Write the result JSON here as well as to stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Send a do_command payload to a service from a module config
    DoCommand {
        #[arg(long)]
        config: PathBuf,
        /// Service name; optional when the config has exactly one
        #[arg(long)]
        service: Option<String>,
        /// JSON command, or @path to read it from a file
        command: String,
    },
    /// Orientation vector to rotation matrix
    Ov2mat {
        #[arg(long, allow_hyphen_values = true)]
        ox: f64,
        #[arg(long, allow_hyphen_values = true)]
        oy: f64,
        #[arg(long, allow_hyphen_values = true)]
        oz: f64,
        /// Degrees
        #[arg(long, allow_hyphen_values = true)]
        theta: f64,
    },
    /// Rotation matrix (9 row-major values) to orientation vector
    Mat2ov {
        #[arg(allow_hyphen_values = true)]
        matrix: String,
    },
    /// Render a synthetic chessboard view to PNG
    Render {
        #[arg(long)]
        out: PathBuf,
        /// Scene JSON (intrinsics, pattern_size, square_size_mm, rvec, tvec)
        #[arg(long)]
        scene: Option<PathBuf>,
        /// Rotation vector as x,y,z
        #[arg(long, allow_hyphen_values = true)]
        rvec: Option<String>,
        /// Translation in mm as x,y,z
        #[arg(long, allow_hyphen_values = true)]
        tvec: Option<String>,
    },
    /// Calibration pass storage
    Passes {
        #[arg(long, default_value = "module-data/calibration-passes")]
        dir: PathBuf,
        #[command(subcommand)]
        action: PassAction,
    },
}

#[derive(Subcommand, Debug)]
enum PassAction {
    /// List passes and their files
    List,
    /// Mark a pass complete
    Complete {
        pass_id: String,
        /// Extra metadata JSON object stored in the sentinel
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Write summary.json for a pass
    Summary { pass_id: String },
}

fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Detect { image, grid } => detect(&image, grid),
        Commands::Pose {
            image,
            grid,
            square_mm,
            calibration,
            intrinsics,
            distortion,
            config,
            tracker,
        } => match (config, image) {
            (Some(config), _) => pose_from_config(&config, tracker.as_deref()),
            (None, Some(image)) => pose_from_image(
                &image,
                grid,
                square_mm,
                calibration.as_deref(),
                intrinsics.as_deref(),
                distortion.as_deref(),
            ),
            (None, None) => Err(anyhow!("either --image or --config is required")),
        },
        Commands::Calibrate {
            images,
            grid,
            square_mm,
            model,
            out,
        } => calibrate(&images, grid, square_mm, model.into(), out.as_deref()),
        Commands::DoCommand {
            config,
            service,
            command,
        } => do_command(&config, service.as_deref(), &command),
        Commands::Ov2mat { ox, oy, oz, theta } => ov2mat(ox, oy, oz, theta),
        Commands::Mat2ov { matrix } => mat2ov(&matrix),
        Commands::Render {
            out,
            scene,
            rvec,
            tvec,
        } => render(&out, scene.as_deref(), rvec.as_deref(), tvec.as_deref()),
        Commands::Passes { dir, action } => passes(&dir, action),
    }
}

fn setup_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_list(s: &str, expected: Option<usize>) -> Result<Vec<f64>> {
    let values = s
        .split(',')
        .map(|v| v.trim().parse::<f64>().with_context(|| format!("invalid number {v:?}")))
        .collect::<Result<Vec<_>>>()?;
    match expected {
        Some(n) if values.len() != n => Err(anyhow!("expected {n} values, got {}", values.len())),
        _ => Ok(values),
    }
}

fn parse_triple(s: &str) -> Result<[f64; 3]> {
    let v = parse_list(s, Some(3))?;
    Ok([v[0], v[1], v[2]])
}

fn detect(image: &Path, pattern: ChessboardPattern) -> Result<()> {
    let bytes = fs::read(image).with_context(|| format!("reading {}", image.display()))?;
    let gray = to_gray(&decode_image(&bytes)?);
    let corners = detect_chessboard_corners(&gray, pattern);
    info!(found = corners.is_some(), "detection finished");
    let corners: Vec<[f64; 2]> = corners
        .unwrap_or_default()
        .iter()
        .map(|p| [p.x, p.y])
        .collect();
    print_json(&json!({
        "found": !corners.is_empty(),
        "width": gray.width(),
        "height": gray.height(),
        "corners": corners,
    }))
}

fn pose_from_image(
    image: &Path,
    pattern: ChessboardPattern,
    square_mm: f64,
    calibration: Option<&Path>,
    intrinsics: Option<&str>,
    distortion: Option<&str>,
) -> Result<()> {
    let (intrinsics, mut coeffs) = match (calibration, intrinsics) {
        (Some(path), _) => {
            let summary: CalibrationSummary = serde_json::from_str(
                &fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?,
            )
            .with_context(|| format!("parsing calibration {}", path.display()))?;
            let m = summary.camera_matrix;
            let d = summary.distortion_coefficients;
            (
                CameraIntrinsics {
                    width_px: summary.image_size.width,
                    height_px: summary.image_size.height,
                    fx: m.fx,
                    fy: m.fy,
                    cx: m.cx,
                    cy: m.cy,
                },
                vec![d.k1, d.k2, d.p1, d.p2, d.k3],
            )
        }
        (None, Some(values)) => {
            let v = parse_list(values, Some(4))?;
            (
                CameraIntrinsics {
                    width_px: 0,
                    height_px: 0,
                    fx: v[0],
                    fy: v[1],
                    cx: v[2],
                    cy: v[3],
                },
                Vec::new(),
            )
        }
        (None, None) => return Err(anyhow!("pass --calibration or --intrinsics")),
    };
    if let Some(d) = distortion {
        coeffs = parse_list(d, None)?;
    }

    let camera = FileCamera::open(
        "camera",
        FileCameraConfig {
            path: image.to_path_buf(),
            intrinsics: Some(intrinsics),
            distortion: coeffs,
        },
    )?;
    let mut deps = Dependencies::default();
    deps.insert_camera("camera", share(camera));
    let attributes = json!({
        "camera_name": "camera",
        "pattern_size": [pattern.cols, pattern.rows],
        "square_size_mm": square_mm,
    });
    let config = ComponentConfig::new("chessboard", Model::chessboard(), as_object(attributes)?);
    let tracker = ChessboardTracker::new(&config, &deps)?;
    print_json(&tracker.get_poses(&[])?)
}

fn pose_from_config(config: &Path, tracker: Option<&str>) -> Result<()> {
    let module = Module::build(&ModuleConfig::load(config)?)?;
    let name = match tracker {
        Some(name) => name.to_string(),
        None => match module.tracker_names().as_slice() {
            [only] => only.clone(),
            names => return Err(anyhow!("choose a tracker with --tracker: {names:?}")),
        },
    };
    print_json(&module.pose_tracker(&name)?.get_poses(&[])?)
}

fn collect_images(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let camera = FileCamera::open(
                "images",
                FileCameraConfig {
                    path: input.clone(),
                    intrinsics: None,
                    distortion: Vec::new(),
                },
            )?;
            files.extend(camera.files().iter().cloned());
        } else {
            files.push(input.clone());
        }
    }
    Ok(files)
}

fn calibrate(
    inputs: &[PathBuf],
    pattern: ChessboardPattern,
    square_mm: f64,
    model: DistortionModel,
    out: Option<&Path>,
) -> Result<()> {
    let files = collect_images(inputs)?;
    info!(count = files.len(), "loading calibration images");
    let mut images = Vec::with_capacity(files.len());
    for file in &files {
        match fs::read(file) {
            Ok(bytes) => images.push(Value::String(STANDARD.encode(bytes))),
            Err(e) => warn!(path = %file.display(), error = %e, "skipping unreadable image"),
        }
    }

    let attributes = json!({
        "pattern_size": [pattern.cols, pattern.rows],
        "square_size_mm": square_mm,
    });
    let config = ComponentConfig::new("calibration", Model::camera_calibration(), as_object(attributes)?);
    let service = CameraCalibrationService::new(&config)?.with_model(model);
    let mut command = Map::new();
    command.insert("calibrate_camera".to_string(), json!({ "images": images }));
    let reply = service.do_command(&command)?;
    print_json(&reply)?;
    if let Some(out) = out {
        fs::write(out, serde_json::to_vec_pretty(&reply)?)
            .with_context(|| format!("writing {}", out.display()))?;
        info!(path = %out.display(), "wrote calibration");
    }
    if reply.get("success") != Some(&Value::Bool(true)) {
        return Err(anyhow!("calibration failed"));
    }
    Ok(())
}

fn do_command(config: &Path, service: Option<&str>, command: &str) -> Result<()> {
    let raw = match command.strip_prefix('@') {
        Some(path) => fs::read_to_string(path).with_context(|| format!("reading {path}"))?,
        None => command.to_string(),
    };
    let command = as_object(serde_json::from_str(&raw).context("command must be JSON")?)?;
    let module = Module::build(&ModuleConfig::load(config)?)?;
    let target = match service {
        Some(name) => module.service(name)?,
        None => module
            .sole_service()
            .ok_or_else(|| anyhow!("choose a service with --service"))?,
    };
    print_json(&target.do_command(&command)?)
}

fn ov2mat(ox: f64, oy: f64, oz: f64, theta: f64) -> Result<()> {
    let r = ov_to_matrix(&OrientationVector::new(ox, oy, oz, theta))?;
    let rows: Vec<[f64; 3]> = (0..3).map(|i| [r[(i, 0)], r[(i, 1)], r[(i, 2)]]).collect();
    print_json(&rows)
}

fn mat2ov(matrix: &str) -> Result<()> {
    let v = parse_list(matrix, Some(9))?;
    let r = Matrix3::from_row_slice(&v);
    print_json(&matrix_to_ov(&r))
}

fn render(out: &Path, scene: Option<&Path>, rvec: Option<&str>, tvec: Option<&str>) -> Result<()> {
    let mut scene: BoardScene = match scene {
        Some(path) => serde_json::from_str(&fs::read_to_string(path)?)
            .with_context(|| format!("parsing scene {}", path.display()))?,
        None => BoardScene::default(),
    };
    if let Some(r) = rvec {
        scene.rvec = parse_triple(r)?;
    }
    if let Some(t) = tvec {
        scene.tvec = parse_triple(t)?;
    }
    fs::write(out, render_chessboard_png(&scene)?)
        .with_context(|| format!("writing {}", out.display()))?;
    info!(path = %out.display(), "rendered chessboard");
    Ok(())
}

fn passes(dir: &Path, action: PassAction) -> Result<()> {
    let store = PassStore::new(dir)?;
    match action {
        PassAction::List => print_json(&store.list_passes()?),
        PassAction::Complete { pass_id, metadata } => {
            let metadata = metadata
                .map(|m| serde_json::from_str(&m).context("metadata must be JSON").and_then(as_object))
                .transpose()?;
            store.mark_pass_complete(&pass_id, metadata.as_ref())?;
            print_json(&json!({"status": "complete", "pass_id": pass_id}))
        }
        PassAction::Summary { pass_id } => print_json(&store.write_summary(&pass_id)?),
    }
}

fn as_object(value: Value) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!("expected a JSON object, got {other}")),
    }
}
