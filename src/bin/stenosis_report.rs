//! stenosis_report - analyze one image from the command line.
//!
//! Runs the same pipeline as the API and writes the Markdown report to stdout
//! (or `--out`). Optional outputs: the HTML results page, the annotated image,
//! and the analysis as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use stenosis_screen::report::ReportGenerator;
use stenosis_screen::ui::Ui;
use stenosis_screen::{render, Analyzer, ScreeningConfig, UploadedImage};

#[derive(Parser, Debug)]
#[command(
    name = "stenosis_report",
    about = "Screen one image for stenosis and write a diagnostic report"
)]
struct Args {
    /// Image to analyze (png, jpg, jpeg)
    #[arg(long, value_name = "PATH")]
    image: PathBuf,

    /// JSON detections fixture; forces the stub detector
    #[arg(long, value_name = "PATH")]
    detections: Option<PathBuf>,

    /// Config file (JSON, or TOML by extension); defaults to STENOSIS_CONFIG
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write the Markdown report here instead of stdout
    #[arg(long, value_name = "PATH")]
    out: Option<PathBuf>,

    /// Write the HTML results page
    #[arg(long, value_name = "PATH")]
    html: Option<PathBuf>,

    /// Write the annotated JPEG (needs the 'annotate' feature)
    #[arg(long, value_name = "PATH")]
    annotated: Option<PathBuf>,

    /// Write the full analysis as JSON
    #[arg(long, value_name = "PATH")]
    json: Option<PathBuf>,

    /// Skip the text-generation service and use the fallback reports
    #[arg(long)]
    offline: bool,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let ui = Ui::from_args(Some(&args.ui), std::io::stderr().is_terminal());

    let mut config = {
        let _stage = ui.stage("Load configuration");
        match &args.config {
            Some(path) => ScreeningConfig::load_from(path)?,
            None => ScreeningConfig::load()?,
        }
    };
    if let Some(path) = &args.detections {
        config.detector.backend = "stub".to_string();
        config.detector.fixture_path = Some(path.clone());
    }

    let analyzer = {
        let _stage = ui.stage("Prepare pipeline");
        let analyzer = Analyzer::from_config(&config)?;
        if args.offline {
            let fallbacks = analyzer.reporter().fallbacks().clone();
            analyzer.with_reporter(ReportGenerator::with_fallbacks(
                Box::new(stenosis_screen::report::OfflineGenerator),
                fallbacks,
            ))
        } else {
            analyzer
        }
    };

    let image = {
        let _stage = ui.stage("Read image");
        let bytes = std::fs::read(&args.image)
            .with_context(|| format!("failed to read image {}", args.image.display()))?;
        let name = args
            .image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        UploadedImage::with_limit(&name, bytes, config.api.max_upload_bytes)?
    };

    let result = {
        let _stage = ui.stage("Analyze");
        analyzer.analyze(&image)?
    };
    ui.summary(&result);

    match &args.out {
        Some(path) => write_output(path, result.report.markdown.as_bytes())?,
        None => print!("{}", result.report.markdown),
    }
    if let Some(path) = &args.html {
        let annotated_href = match (&args.annotated, &result.annotated) {
            (Some(path), Some(_)) => path.file_name().map(|n| n.to_string_lossy().into_owned()),
            _ => None,
        };
        let page = render::results_page(
            &result.image.file_name,
            &result.findings,
            &result.severity,
            &result.report,
            annotated_href.as_deref(),
        );
        write_output(path, page.as_bytes())?;
    }
    if let Some(path) = &args.annotated {
        match &result.annotated {
            Some(annotated) => write_output(path, &annotated.jpeg)?,
            None => log::warn!("no annotated image produced; {} not written", path.display()),
        }
    }
    if let Some(path) = &args.json {
        write_output(path, &serde_json::to_vec_pretty(&result)?)?;
    }
    Ok(())
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}
