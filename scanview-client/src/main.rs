use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use scanview_core::{RendererError, Volume, VolumeRenderer};
use scanview_engine::{EngineConfig, SessionContext};

use scanview_client::{load_session_tree, ApiConfig, NiftiCodec, RestClient};

/// Headless renderer: logs what would be displayed instead of drawing it.
struct LogRenderer;

impl VolumeRenderer for LogRenderer {
    fn prepare(&mut self, scan_changed: bool) {
        if scan_changed {
            info!("rebuilding display state for new scan");
        }
    }

    fn display(&mut self, volume: &Volume) -> Result<(), RendererError> {
        info!(
            dims = ?volume.dims,
            range = ?volume.value_range(),
            "displaying volume"
        );
        Ok(())
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = env::args().skip(1);
    let Some(base_url) = args.next() else {
        eprintln!("usage: scanview <base-url> [experiment-name]");
        eprintln!("  SCANVIEW_TOKEN   bearer token for the API, if required");
        return ExitCode::FAILURE;
    };
    let experiment_filter = args.next();

    match run(base_url, experiment_filter) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(base_url: String, experiment_filter: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let client = Arc::new(RestClient::new(ApiConfig {
        base_url,
        token: env::var("SCANVIEW_TOKEN").ok(),
    }));

    let tree = Arc::new(load_session_tree(&client)?);
    if tree.image_count() == 0 {
        warn!("session contains no images, nothing to do");
        return Ok(());
    }

    let experiment = match &experiment_filter {
        Some(name) => tree
            .experiments()
            .find(|e| &e.name == name)
            .ok_or_else(|| format!("no experiment named {name:?}"))?,
        None => tree
            .experiments()
            .next()
            .ok_or("session contains no experiments")?,
    };
    let experiment_id = experiment.id.clone();
    info!(experiment = %experiment_id, name = %experiment.name, "selected experiment");

    let ctx = SessionContext::new(
        tree.clone(),
        client,
        Arc::new(NiftiCodec::new()),
        Box::new(LogRenderer),
        EngineConfig::default(),
    );

    // Display the experiment's first image; this also kicks off the
    // prefetch of everything else in the experiment.
    let first_image = tree
        .scans_of(&experiment_id)
        .iter()
        .find_map(|scan| tree.images_of(scan).first())
        .ok_or("experiment contains no images")?;
    ctx.swap_to(first_image)?;

    let mut last_percent = 0;
    while ctx.state().is_loading_experiment() || ctx.state().is_loading_dataset() {
        let percent = (ctx.state().cached_fraction() * 100.0) as u32;
        if percent != last_percent {
            info!(percent, "caching experiment");
            last_percent = percent;
        }
        thread::sleep(Duration::from_millis(50));
    }

    if ctx.state().has_dataset_error() {
        warn!("the displayed dataset failed to load");
    }

    let (done, total) = ctx.state().cached_progress();
    info!(done, total, "experiment cached");
    for scan_id in tree.scans_of(&experiment_id) {
        let range = ctx.cumulative_range(scan_id);
        let name = tree.scan(scan_id).map(|s| s.name.clone()).unwrap_or_default();
        if range.is_empty() {
            warn!(scan = %scan_id, %name, "no image of this scan decoded");
        } else {
            info!(scan = %scan_id, %name, min = range.min, max = range.max, "cumulative range");
        }
    }

    Ok(())
}
