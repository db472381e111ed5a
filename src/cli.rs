use crate::{
    config::Config,
    converter::{parse_filter, DocumentConverter, Filter, RefreshFilter},
    office::{holder, process::program_in_office_home, OfficePool, StopMode},
    util::{ensure_dir, expand_tilde},
};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "office-pool")]
#[command(about = "Supervised office process pool for document conversion")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./office-pool.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(flatten)]
    pub overrides: PoolOverrides,
}

/// Pool settings given on the command line. Each one replaces the matching
/// config value for this run.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct PoolOverrides {
    /// Office installation directory; the program is looked up inside it.
    #[arg(long, global = true, conflicts_with = "program")]
    pub office_home: Option<PathBuf>,

    /// Office program to launch, or "auto".
    #[arg(long, global = true)]
    pub program: Option<String>,

    /// Port of one office instance. Repeat for more instances. Together with
    /// --pipe this replaces the configured instance list.
    #[arg(long = "port", global = true)]
    pub ports: Vec<u16>,

    /// Pipe name of one office instance. Repeatable.
    #[arg(long = "pipe", global = true)]
    pub pipes: Vec<String>,

    #[arg(long, global = true)]
    pub task_timeout_ms: Option<u64>,

    #[arg(long, global = true)]
    pub queue_timeout_ms: Option<u64>,

    /// Recycle an office process after this many tasks (0 = never).
    #[arg(long, global = true)]
    pub max_tasks: Option<u32>,

    #[arg(long, global = true, value_enum)]
    pub stop_mode: Option<StopMode>,
}

impl PoolOverrides {
    pub fn apply(&self, cfg: &mut Config) -> Result<()> {
        if let Some(home) = &self.office_home {
            let home = expand_tilde(&home.to_string_lossy());
            let program = program_in_office_home(&home)
                .ok_or_else(|| anyhow!("no office program under {}", home.display()))?;
            cfg.process.program = program.to_string_lossy().into_owned();
        }
        if let Some(program) = &self.program {
            cfg.process.program = program.clone();
        }
        if !self.ports.is_empty() || !self.pipes.is_empty() {
            cfg.pool.ports = self.ports.clone();
            cfg.pool.pipe_names = self.pipes.clone();
        }
        if let Some(ms) = self.task_timeout_ms {
            cfg.pool.task_execution_timeout_ms = ms;
        }
        if let Some(ms) = self.queue_timeout_ms {
            cfg.pool.task_queue_timeout_ms = ms;
        }
        if let Some(max) = self.max_tasks {
            cfg.pool.max_tasks_per_process = max;
        }
        if let Some(mode) = self.stop_mode {
            cfg.process.stop_mode = mode;
        }
        Ok(())
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the resolved office program and pool layout.
    Doctor {},
    /// Convert one or more documents.
    Convert {
        #[arg(long, required = true, num_args = 1..)]
        input: Vec<PathBuf>,
        /// Target file; only valid with a single input.
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        out_dir: Option<PathBuf>,
        /// Output format name or extension (defaults to converter.default_format).
        #[arg(long)]
        format: Option<String>,
        /// Refresh documents before storing them.
        #[arg(long)]
        refresh: bool,
        /// Filter applied before storing: refresh, page_count or
        /// select_page=N. Repeat to chain them in order.
        #[arg(long = "filter")]
        filters: Vec<String>,
    },
}

pub fn dispatch(args: Args) -> Result<()> {
    let mut cfg = match resolve_config_path(args.config.as_deref()) {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    args.overrides
        .apply(&mut cfg)
        .context("applying command-line overrides")?;
    let _guard = init_logging(&args, &cfg, resolve_log_path(&cfg).as_deref())?;

    match &args.cmd {
        Command::Doctor {} => doctor(&cfg),
        Command::Convert {
            input,
            output,
            out_dir,
            format,
            refresh,
            filters,
        } => convert(
            &cfg,
            input,
            output.as_deref(),
            out_dir.as_deref(),
            format.as_deref(),
            &filter_chain(*refresh || cfg.converter.refresh, filters)?,
        ),
    }
}

fn resolve_config_path(user: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = user {
        return Some(p.to_path_buf());
    }
    let default = PathBuf::from("office-pool.toml");
    default.exists().then_some(default)
}

fn init_logging(args: &Args, cfg: &Config, file_path: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries the JSON summary, so logs go to stderr.
    let stderr_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    };

    let (file_layer, guard) = if let Some(path) = file_path {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::File::create(path)
            .with_context(|| format!("create log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn resolve_log_path(cfg: &Config) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }
    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }
    Some(PathBuf::from(&cfg.process.work_dir).join("office-pool.log"))
}

fn doctor(cfg: &Config) -> Result<()> {
    let settings = cfg.pool_settings()?;
    let process = cfg.process_settings();
    let diag = serde_json::json!({
        "program": process.program,
        "program_exists": process.program.is_file(),
        "work_dir": process.work_dir,
        "stop_mode": process.stop_mode,
        "instances": settings.instances.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "host": settings.host,
        "task_queue_timeout_ms": cfg.pool.task_queue_timeout_ms,
        "task_execution_timeout_ms": cfg.pool.task_execution_timeout_ms,
        "max_tasks_per_process": cfg.pool.max_tasks_per_process,
    });
    println!("{}", serde_json::to_string_pretty(&diag)?);
    Ok(())
}

fn convert(
    cfg: &Config,
    inputs: &[PathBuf],
    output: Option<&Path>,
    out_dir: Option<&Path>,
    format: Option<&str>,
    filters: &[Arc<dyn Filter>],
) -> Result<()> {
    if output.is_some() && inputs.len() > 1 {
        return Err(anyhow!("--output takes a single --input; use --out-dir for several"));
    }
    let out_root = out_dir
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&cfg.converter.out_dir));
    let format_name = format.unwrap_or(cfg.converter.default_format.as_str());

    let converter = filters
        .iter()
        .fold(DocumentConverter::new().with_default_format(format_name), |c, f| {
            c.with_filter(Arc::clone(f))
        });
    let extension = converter
        .registry()
        .by_name(format_name)
        .map(|f| f.extension.clone())
        .ok_or_else(|| anyhow!("unknown output format: {format_name}"))?;

    let targets: Vec<PathBuf> = match output {
        Some(path) => vec![path.to_path_buf()],
        None => inputs
            .iter()
            .map(|input| target_path(&out_root, input, &extension))
            .collect::<Result<_>>()?,
    };

    let pool = Arc::new(OfficePool::from_config(cfg).context("building office pool")?);
    let report = pool.start().context("starting office pool")?;
    if !report.is_complete() {
        warn!(
            "converting with {} of {} office instances",
            report.started,
            pool.size()
        );
    }
    holder::set(Some(Arc::clone(&pool)));

    let outcome = run_conversions(&converter, inputs, &targets, format);

    holder::set(None);
    if let Err(e) = pool.stop() {
        warn!("office pool did not stop cleanly: {e}");
    }
    outcome
}

/// `--refresh` goes first, then the `--filter` chain in the order given.
fn filter_chain(refresh: bool, specs: &[String]) -> Result<Vec<Arc<dyn Filter>>> {
    let mut chain: Vec<Arc<dyn Filter>> = Vec::new();
    if refresh {
        chain.push(Arc::new(RefreshFilter));
    }
    for spec in specs {
        chain.push(parse_filter(spec).with_context(|| format!("--filter {spec}"))?);
    }
    Ok(chain)
}

fn run_conversions(
    converter: &DocumentConverter,
    inputs: &[PathBuf],
    targets: &[PathBuf],
    format: Option<&str>,
) -> Result<()> {
    let handles: Vec<_> = inputs
        .iter()
        .zip(targets)
        .map(|(input, target)| (input, converter.submit(input, target, format)))
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    let mut failed = 0usize;
    for (input, handle) in handles {
        let outcome = handle.and_then(|h| h.wait());
        match outcome {
            Ok(report) => results.push(serde_json::json!({ "status": "ok", "report": report })),
            Err(e) => {
                failed += 1;
                warn!("{}: {e}", input.display());
                results.push(serde_json::json!({
                    "status": "error",
                    "source": input,
                    "error": e.to_string(),
                }));
            }
        }
    }

    info!("{} converted, {failed} failed", results.len() - failed);
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "converted": results.len() - failed,
            "failed": failed,
            "results": results,
        }))?
    );
    if failed > 0 {
        return Err(anyhow!("{failed} of {} conversions failed", results.len()));
    }
    Ok(())
}

fn target_path(out_root: &Path, input: &Path, extension: &str) -> Result<PathBuf> {
    let stem = input
        .file_stem()
        .ok_or_else(|| anyhow!("input has no file name: {}", input.display()))?;
    Ok(out_root.join(format!("{}.{extension}", stem.to_string_lossy())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn overrides_replace_config_values() {
        let args = parse(&[
            "office-pool",
            "convert",
            "--input",
            "a.docx",
            "--port",
            "2010",
            "--port",
            "2011",
            "--pipe",
            "office_a",
            "--program",
            "/opt/office/soffice",
            "--task-timeout-ms",
            "9000",
            "--max-tasks",
            "5",
            "--stop-mode",
            "kill",
        ]);
        let mut cfg = Config::default();
        args.overrides.apply(&mut cfg).unwrap();

        assert_eq!(cfg.pool.ports, vec![2010, 2011]);
        assert_eq!(cfg.pool.pipe_names, vec!["office_a".to_string()]);
        assert_eq!(cfg.process.program, "/opt/office/soffice");
        assert_eq!(cfg.process.stop_mode, StopMode::Kill);
        let settings = cfg.pool_settings().unwrap();
        assert_eq!(settings.instances.len(), 3);
        assert_eq!(settings.instance.task_execution_timeout.as_millis(), 9000);
        assert_eq!(settings.instance.max_tasks_per_process, 5);
    }

    #[test]
    fn no_overrides_keep_the_config() {
        let args = parse(&["office-pool", "doctor"]);
        let mut cfg = Config::default();
        cfg.pool.ports = vec![2020];
        args.overrides.apply(&mut cfg).unwrap();
        assert_eq!(cfg.pool.ports, vec![2020]);
        assert_eq!(cfg.process.program, "auto");
        assert_eq!(cfg.pool.task_queue_timeout_ms, 30_000);
    }

    #[test]
    fn office_home_resolves_the_program_inside_it() {
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(home.path().join("program")).unwrap();
        std::fs::write(home.path().join("program/soffice"), b"").unwrap();

        let overrides = PoolOverrides {
            office_home: Some(home.path().to_path_buf()),
            ..Default::default()
        };
        let mut cfg = Config::default();
        overrides.apply(&mut cfg).unwrap();
        assert_eq!(
            PathBuf::from(&cfg.process.program),
            home.path().join("program/soffice")
        );

        let empty = tempfile::tempdir().unwrap();
        let overrides = PoolOverrides {
            office_home: Some(empty.path().to_path_buf()),
            ..Default::default()
        };
        assert!(overrides.apply(&mut Config::default()).is_err());
    }

    #[test]
    fn filter_chain_keeps_the_given_order() {
        let chain = filter_chain(
            true,
            &["page_count".to_string(), "select_page=1".to_string()],
        )
        .unwrap();
        let names: Vec<_> = chain.iter().map(|f| f.name().to_string()).collect();
        assert_eq!(names, vec!["refresh", "page_count", "select_page"]);
        assert!(filter_chain(false, &["bogus".to_string()]).is_err());
    }

    #[test]
    fn option_values_are_checked_by_the_parser() {
        assert!(Args::try_parse_from(["office-pool", "doctor", "--stop-mode", "gently"]).is_err());
        assert!(Args::try_parse_from(["office-pool", "doctor", "--port", "x"]).is_err());
    }
}
