use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use engine_core::asset::AssetState;
use engine_core::config::EngineConfig;
use engine_core::context::EngineContext;
use engine_core::job::{FnJob, JobDependencies};
use engine_core::job_graph::JobGraph;
use engine_core::jobs::{JobSystem, JobsConfig, JobsTelemetry};
use engine_core::observability;
use engine_core::sprite_assets::{GridSpriteSheet, TextureAsset};

const EXIT_SUCCESS: i32 = 0;
const EXIT_USAGE: i32 = 2;
const EXIT_CONFIG: i32 = 10;
const EXIT_LOAD: i32 = 11;
const EXIT_CONFLICT: i32 = 12;
const EXIT_JOB_PANIC: i32 = 13;

#[derive(Parser)]
#[command(name = "tools", version, about = "Job system and asset pipeline tools")]
struct Cli {
    #[arg(long, global = true, default_value = "info")]
    log_level: log::LevelFilter,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs a job graph whose jobs race on one counter.
    Graph(GraphArgs),
    /// Loads a sprite sheet through the async pipeline.
    Load(LoadArgs),
    /// Posts general and loading jobs and prints scheduler telemetry.
    Smoke(SmokeArgs),
}

#[derive(Parser)]
struct GraphArgs {
    #[arg(long, default_value_t = 16)]
    jobs: usize,

    #[arg(long, default_value_t = 1000)]
    increments: usize,

    #[arg(long, value_enum, default_value_t = MaskMode::Shared)]
    masks: MaskMode,

    #[arg(long, default_value_t = 4)]
    workers: usize,
}

#[derive(ValueEnum, Clone, Copy, PartialEq, Eq)]
enum MaskMode {
    Shared,
    Disjoint,
}

#[derive(Parser)]
struct LoadArgs {
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "DIR")]
    content_root: Option<PathBuf>,

    #[arg(long, value_name = "NAME")]
    sheet: String,

    #[arg(long, default_value_t = 600)]
    max_frames: u32,
}

#[derive(Parser)]
struct SmokeArgs {
    #[arg(long, default_value_t = 64)]
    general: usize,

    #[arg(long, default_value_t = 16)]
    loading: usize,

    #[arg(long)]
    inline: bool,
}

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::default()
        .write_style(env_logger::WriteStyle::Auto)
        .filter_level(cli.log_level)
        .init();
    observability::install_panic_hook();
    let exit_code = match cli.command {
        Commands::Graph(args) => run_graph(args),
        Commands::Load(args) => run_load(args),
        Commands::Smoke(args) => run_smoke(args),
    };
    std::process::exit(exit_code);
}

fn run_graph(args: GraphArgs) -> i32 {
    if args.jobs == 0 || args.jobs > 64 {
        eprintln!("--jobs must be between 1 and 64");
        return EXIT_USAGE;
    }
    let jobs = match JobSystem::new(JobsConfig::threaded(args.workers, 1)) {
        Ok(jobs) => jobs,
        Err(err) => {
            eprintln!("{}", err);
            return EXIT_CONFIG;
        }
    };

    let counter = Arc::new(AtomicUsize::new(0));
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let mut graph = JobGraph::new();
    for index in 0..args.jobs {
        let mask = match args.masks {
            MaskMode::Shared => 1,
            MaskMode::Disjoint => 1u64 << index,
        };
        let counter = Arc::clone(&counter);
        let active = Arc::clone(&active);
        let max_active = Arc::clone(&max_active);
        let increments = args.increments;
        graph.add_job(
            FnJob::new(format!("increment-{}", index), move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                for _ in 0..increments {
                    // Split load/store: overlapping writers lose updates.
                    let value = counter.load(Ordering::Relaxed);
                    thread::yield_now();
                    counter.store(value + 1, Ordering::Relaxed);
                }
                active.fetch_sub(1, Ordering::SeqCst);
            })
            .with_dependencies(JobDependencies::new().writes(mask))
            .boxed(),
        );
    }

    let started = Instant::now();
    jobs.execute_job_graph(&mut graph, true);
    let elapsed = started.elapsed();

    let expected = args.jobs * args.increments;
    let actual = counter.load(Ordering::SeqCst);
    let max_in_flight = max_active.load(Ordering::SeqCst);
    println!(
        "graph {} jobs x {} increments: counter={} expected={} lost={} max_in_flight={} ({:.1} ms)",
        args.jobs,
        args.increments,
        actual,
        expected,
        expected.saturating_sub(actual),
        max_in_flight,
        elapsed.as_secs_f64() * 1000.0
    );
    print_telemetry(&jobs.telemetry());

    if args.masks == MaskMode::Shared && (actual != expected || max_in_flight > 1) {
        eprintln!("conflicting jobs overlapped");
        return EXIT_CONFLICT;
    }
    EXIT_SUCCESS
}

fn run_load(args: LoadArgs) -> i32 {
    let mut config = match args.config.as_deref() {
        Some(path) => match EngineConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("{}", err);
                return EXIT_CONFIG;
            }
        },
        None => EngineConfig::default(),
    };
    if let Some(root) = args.content_root {
        config.assets.content_root = Some(root);
    }
    if config.assets.content_root.is_none() {
        eprintln!("--content-root or a config with assets.content_root is required");
        return EXIT_USAGE;
    }

    let mut context = match EngineContext::new(config) {
        Ok(context) => context,
        Err(err) => {
            eprintln!("{}", err);
            return EXIT_CONFIG;
        }
    };
    let started = Instant::now();
    let id = context.assets_mut().request::<GridSpriteSheet>(&args.sheet);
    if !id.is_valid() {
        report_asset_error(&context);
        return EXIT_LOAD;
    }

    while context.assets().asset_state(id) == AssetState::Future {
        if context.frame_index() >= u64::from(args.max_frames) {
            eprintln!("{} still loading after {} frames", args.sheet, args.max_frames);
            for future in context.assets().futures_snapshot() {
                eprintln!(
                    "  {} {} priority={} awaiting_sub_loads={}",
                    future.id, future.key, future.priority, future.awaiting_sub_loads
                );
            }
            return EXIT_LOAD;
        }
        context.begin_frame();
        thread::sleep(Duration::from_millis(1));
    }

    let summary = context.assets_mut().get::<GridSpriteSheet>(id).map(|sheet| {
        (
            sheet.columns(),
            sheet.rows(),
            sheet.frames().len(),
            sheet.texture(),
        )
    });
    let Some((columns, rows, frame_count, texture)) = summary else {
        report_asset_error(&context);
        return EXIT_LOAD;
    };
    let size = context
        .assets_mut()
        .get::<TextureAsset>(texture)
        .and_then(|texture| texture.upload())
        .map(|upload| (upload.width, upload.height))
        .unwrap_or((0, 0));
    println!(
        "loaded {} in {} frames ({:.1} ms): {}x{} grid, {} frames, texture {}x{}",
        args.sheet,
        context.frame_index(),
        started.elapsed().as_secs_f64() * 1000.0,
        columns,
        rows,
        frame_count,
        size.0,
        size.1
    );
    let telemetry = context.assets().telemetry();
    println!(
        "assets: loaded={} posted={} completed={} failures={}",
        telemetry.loaded, telemetry.loads_posted, telemetry.loads_completed, telemetry.failures
    );
    context.assets_mut().release(id);
    context.shutdown();
    EXIT_SUCCESS
}

fn run_smoke(args: SmokeArgs) -> i32 {
    let config = if args.inline {
        JobsConfig::inline()
    } else {
        JobsConfig::default()
    };
    let jobs = match JobSystem::new(config) {
        Ok(jobs) => jobs,
        Err(err) => {
            eprintln!("{}", err);
            return EXIT_CONFIG;
        }
    };

    let executed = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    for index in 0..args.general + args.loading {
        let executed = Arc::clone(&executed);
        let completed = Arc::clone(&completed);
        let job = FnJob::new(format!("smoke-{}", index), move || {
            executed.fetch_add(1, Ordering::Relaxed);
        })
        .with_priority((index % 4) as i32)
        .on_complete(move || {
            completed.fetch_add(1, Ordering::Relaxed);
            true
        })
        .boxed();
        if index < args.general {
            jobs.post_job(job);
        } else {
            jobs.post_loading_job(job);
        }
    }
    jobs.wait_for_all_jobs();

    println!(
        "smoke ok (executed={}, completed={})",
        executed.load(Ordering::Relaxed),
        completed.load(Ordering::Relaxed)
    );
    let telemetry = jobs.telemetry();
    print_telemetry(&telemetry);
    jobs.shutdown();
    if telemetry.panicked > 0 {
        if let Some(error) = observability::sticky_error() {
            eprintln!("{}", error);
        }
        return EXIT_JOB_PANIC;
    }
    EXIT_SUCCESS
}

fn print_telemetry(telemetry: &JobsTelemetry) {
    println!(
        "jobs: queued general={} loading={} active general={} loading={} awaiting_complete={} executed={} cancelled={} panicked={}",
        telemetry.general_queue_depth,
        telemetry.loading_queue_depth,
        telemetry.general_workers_active,
        telemetry.loading_workers_active,
        telemetry.awaiting_complete,
        telemetry.executed,
        telemetry.cancelled,
        telemetry.panicked
    );
}

fn report_asset_error(context: &EngineContext) {
    match context.assets().last_error() {
        Some(err) => eprintln!("{}", err),
        None => eprintln!("asset load failed"),
    }
}
