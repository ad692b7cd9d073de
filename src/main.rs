use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use parking_lot::Mutex;
use tracing::{Subscriber, info, warn};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use wheels::domain::ports::{FileProducer, ImageProducer, ImageTarget};
use wheels::domain::{CachedImage, ImageSource, LoadError, LoadListener};
use wheels::infrastructure::{AppConfig, CliArgs, ConfigStore, Executors, ImageLoader};
use wheels::presentation::ImageView;

const LOAD_TIMEOUT: Duration = Duration::from_secs(60);

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

/// Formats events into the log file when one is configured, else into
/// `fallback`.
fn output_layer<S, W>(log_path: Option<&Path>, fallback: W) -> Result<BoxedLayer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let Some(log_path) = log_path else {
        return Ok(fmt::layer()
            .with_writer(fallback)
            .with_target(false)
            .boxed());
    };

    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    Ok(fmt::layer()
        .with_writer(file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .boxed())
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));
    let log_path = config.effective_log_path();

    tracing_subscriber::registry()
        .with(filter)
        .with(output_layer(log_path.as_deref(), std::io::stderr)?)
        .init();

    if let Some(log_path) = log_path {
        info!(path = %log_path.display(), "Logging initialized");
    }

    Ok(())
}

enum Outcome {
    Loaded {
        source: ImageSource,
        width: u32,
        height: u32,
    },
    Failed(LoadError),
}

/// Records per-file outcomes and counts finished requests.
#[derive(Default)]
struct Progress {
    outcomes: Mutex<HashMap<PathBuf, Outcome>>,
    finished: AtomicUsize,
}

impl Progress {
    fn finished(&self) -> usize {
        self.finished.load(Ordering::Acquire)
    }
}

impl LoadListener<PathBuf> for Progress {
    fn on_loaded(&self, data: &PathBuf, image: &Arc<CachedImage>, source: ImageSource) {
        let (width, height) = image.dimensions();
        self.outcomes.lock().insert(
            data.clone(),
            Outcome::Loaded {
                source,
                width,
                height,
            },
        );
    }

    fn on_displayed(&self, _: &PathBuf, _: &Arc<CachedImage>, _: &Arc<dyn ImageTarget>) {
        self.finished.fetch_add(1, Ordering::AcqRel);
    }

    fn on_error(&self, data: &PathBuf, error: &LoadError) {
        self.outcomes
            .lock()
            .insert(data.clone(), Outcome::Failed(error.clone()));
        self.finished.fetch_add(1, Ordering::AcqRel);
    }
}

fn load_config(args: &CliArgs) -> Result<AppConfig> {
    let store = ConfigStore::new()?;
    let mut config = store
        .load_config(args.config.as_deref())
        .wrap_err("Failed to load configuration")?;
    config.merge_with_args(args);
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = CliArgs::parse();
    let config = load_config(&args)?;
    init_logging(&config)?;

    info!(version = wheels::VERSION, "Starting {}", wheels::NAME);

    let (executors, mut main_loop) = Executors::from_current(&config.pools)?;
    let producer: Arc<dyn ImageProducer<PathBuf>> = Arc::new(FileProducer);
    let loader = ImageLoader::from_config(&config.cache, &config.display, executors, producer)
        .await
        .wrap_err("Failed to set up image caches")?;

    if args.clear {
        loader.clear_caches().await;
        println!("Caches cleared");
    }

    let progress = Arc::new(Progress::default());
    let listener: Arc<dyn LoadListener<PathBuf>> = progress.clone();
    let mut views = Vec::with_capacity(args.files.len());
    for file in &args.files {
        let view = Arc::new(ImageView::new());
        let target: Arc<dyn ImageTarget> = view.clone();
        loader.load(file.clone(), &target, Some(Arc::clone(&listener)));
        views.push((file, view));
    }

    let expected = views.len();
    if !main_loop
        .run_until(LOAD_TIMEOUT, || progress.finished() >= expected)
        .await
    {
        warn!(
            finished = progress.finished(),
            expected, "Timed out waiting for image loads"
        );
    }

    let outcomes = progress.outcomes.lock();
    for (file, view) in &views {
        match (outcomes.get(*file), view.current_key()) {
            (Some(Outcome::Loaded { source, width, height }), Some(_)) => {
                println!("{}: {width}x{height} from {source}", file.display());
            }
            (Some(Outcome::Failed(error)), _) => {
                println!("{}: failed: {error}", file.display());
            }
            _ => println!("{}: not loaded", file.display()),
        }
    }
    drop(outcomes);

    println!("memory: {}", loader.memory_cache().stats());
    if let Some(storage) = loader.storage_cache() {
        storage.wait_idle().await;
        let (files, bytes) = storage
            .usage()
            .await
            .wrap_err("Failed to read storage cache usage")?;
        println!(
            "storage: {files} files, {bytes}/{} bytes in {}",
            storage.max_size(),
            storage.dir().display()
        );
    }

    Ok(())
}
