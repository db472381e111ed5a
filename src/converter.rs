use crate::{
    error::{OfficeError, Result},
    format::{DocumentFamily, FormatRegistry},
    office::{holder, BridgeRequest, Connection, OfficePool, TaskHandle},
    util::{file_url, now_rfc3339},
};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// A step applied to a loaded document before it is stored.
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, conn: &Connection, doc: &Value) -> Result<()>;
}

/// Recompute fields, indexes and layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshFilter;

impl Filter for RefreshFilter {
    fn name(&self) -> &str {
        "refresh"
    }

    fn apply(&self, conn: &Connection, doc: &Value) -> Result<()> {
        conn.invoke(&BridgeRequest::new("refresh").with_arg("doc", doc.clone()))?;
        Ok(())
    }
}

/// Records the page count of the document as it passes through.
#[derive(Debug, Default)]
pub struct PageCounterFilter {
    pages: AtomicU64,
}

impl PageCounterFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page_count(&self) -> u64 {
        self.pages.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.pages.store(0, Ordering::SeqCst);
    }
}

impl Filter for PageCounterFilter {
    fn name(&self) -> &str {
        "page_count"
    }

    fn apply(&self, conn: &Connection, doc: &Value) -> Result<()> {
        let value = conn.invoke(&BridgeRequest::new("page_count").with_arg("doc", doc.clone()))?;
        let pages = value.as_u64().ok_or_else(|| OfficeError::Bridge {
            op: "page_count".into(),
            reason: format!("expected a number, got {value}"),
        })?;
        self.pages.store(pages, Ordering::SeqCst);
        Ok(())
    }
}

/// Keeps a single page (1-based) and drops the rest.
#[derive(Debug, Clone, Copy)]
pub struct PageSelectorFilter {
    page: u32,
}

impl PageSelectorFilter {
    pub fn new(page: u32) -> Self {
        Self { page }
    }
}

impl Filter for PageSelectorFilter {
    fn name(&self) -> &str {
        "select_page"
    }

    fn apply(&self, conn: &Connection, doc: &Value) -> Result<()> {
        if self.page == 0 {
            return Err(OfficeError::Conversion("page numbers start at 1".into()));
        }
        conn.invoke(
            &BridgeRequest::new("select_page")
                .with_arg("doc", doc.clone())
                .with_arg("page", self.page),
        )?;
        Ok(())
    }
}

/// Build a filter from its command-line form: `refresh`, `page_count` or
/// `select_page=N`.
pub fn parse_filter(spec: &str) -> Result<Arc<dyn Filter>> {
    let (name, arg) = match spec.split_once('=') {
        Some((name, arg)) => (name.trim(), Some(arg.trim())),
        None => (spec.trim(), None),
    };
    match (name, arg) {
        ("refresh", None) => Ok(Arc::new(RefreshFilter)),
        ("page_count", None) => Ok(Arc::new(PageCounterFilter::new())),
        ("select_page", Some(page)) => match page.parse::<u32>() {
            Ok(page) if page > 0 => Ok(Arc::new(PageSelectorFilter::new(page))),
            _ => Err(OfficeError::Config(format!(
                "select_page needs a page number >= 1, got {page:?}"
            ))),
        },
        _ => Err(OfficeError::Config(format!("unknown filter {spec:?}"))),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversionReport {
    pub source: PathBuf,
    pub target: PathBuf,
    pub input_format: String,
    pub output_format: String,
    pub export_filter: String,
    pub instance: String,
    pub filters: Vec<String>,
    pub finished_at: String,
    pub elapsed_ms: u64,
}

/// Everything a conversion task needs, resolved before submission.
struct Job {
    source: PathBuf,
    target: PathBuf,
    source_url: String,
    target_url: String,
    input_format: String,
    output_format: String,
    export_filter: String,
    filters: Vec<Arc<dyn Filter>>,
}

/// Converts documents on an explicit pool, or on the installed one.
#[derive(Clone)]
pub struct DocumentConverter {
    pool: Option<Arc<OfficePool>>,
    registry: Arc<FormatRegistry>,
    filters: Vec<Arc<dyn Filter>>,
    default_format: String,
}

impl Default for DocumentConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentConverter {
    pub fn new() -> Self {
        Self {
            pool: None,
            registry: Arc::new(FormatRegistry::default()),
            filters: Vec::new(),
            default_format: "pdf".into(),
        }
    }

    pub fn with_pool(mut self, pool: Arc<OfficePool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_registry(mut self, registry: FormatRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Filters run in the order they are added.
    pub fn with_filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_default_format(mut self, format: impl Into<String>) -> Self {
        self.default_format = format.into();
        self
    }

    pub fn registry(&self) -> &FormatRegistry {
        &self.registry
    }

    /// Convert and wait for the result.
    pub fn convert(
        &self,
        source: &Path,
        target: &Path,
        format: Option<&str>,
    ) -> Result<ConversionReport> {
        self.submit(source, target, format)?.wait()
    }

    /// Queue a conversion and return without waiting.
    pub fn submit(
        &self,
        source: &Path,
        target: &Path,
        format: Option<&str>,
    ) -> Result<TaskHandle<ConversionReport>> {
        let pool = self.resolve_pool()?;
        let job = self.prepare(source, target, format)?;
        debug!(
            "converting {} -> {} ({})",
            job.source.display(),
            job.target.display(),
            job.export_filter
        );
        pool.submit(move |conn| run_job(conn, job))
    }

    fn resolve_pool(&self) -> Result<Arc<OfficePool>> {
        match &self.pool {
            Some(pool) => Ok(Arc::clone(pool)),
            None => holder::get().ok_or(OfficeError::NoInstalledPool),
        }
    }

    fn prepare(&self, source: &Path, target: &Path, format: Option<&str>) -> Result<Job> {
        if !source.is_file() {
            return Err(OfficeError::Conversion(format!(
                "source does not exist: {}",
                source.display()
            )));
        }
        let input = self.registry.for_path(source)?;
        let family = input.family.ok_or_else(|| {
            OfficeError::Conversion(format!("{} documents cannot be loaded", input.name))
        })?;

        let output = match format {
            Some(name) => self
                .registry
                .by_name(name)
                .ok_or_else(|| OfficeError::UnknownFormat(name.to_string()))?,
            None => match self.registry.for_path(target) {
                Ok(f) => f,
                Err(_) => self
                    .registry
                    .by_name(&self.default_format)
                    .ok_or_else(|| OfficeError::UnknownFormat(self.default_format.clone()))?,
            },
        };
        let export_filter = output
            .export_filter(family)
            .ok_or_else(|| unsupported(family, &output.name))?
            .to_string();

        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                OfficeError::Conversion(format!("creating {}: {e}", parent.display()))
            })?;
        }
        let url = |p: &Path| file_url(p).map_err(|e| OfficeError::Conversion(format!("{e:#}")));

        Ok(Job {
            source_url: url(source)?,
            target_url: url(target)?,
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            input_format: input.extension.clone(),
            output_format: output.extension.clone(),
            export_filter,
            filters: self.filters.clone(),
        })
    }
}

fn unsupported(family: DocumentFamily, output: &str) -> OfficeError {
    OfficeError::Conversion(format!("no export filter from {family:?} documents to {output}"))
}

fn run_job(conn: &Connection, job: Job) -> Result<ConversionReport> {
    let started = Instant::now();
    let doc = conn.invoke(
        &BridgeRequest::new("load")
            .with_arg("url", job.source_url.as_str())
            .with_arg("hidden", true),
    )?;

    let outcome = apply_and_store(conn, &job, &doc);

    // A lost connection has already taken the document with it.
    if !matches!(&outcome, Err(e) if e.is_connection_lost()) {
        if let Err(e) = conn.invoke(&BridgeRequest::new("close").with_arg("doc", doc)) {
            warn!("closing {}: {e}", job.source.display());
        }
    }
    outcome?;

    let report = ConversionReport {
        instance: conn.instance().to_string(),
        filters: job.filters.iter().map(|f| f.name().to_string()).collect(),
        finished_at: now_rfc3339(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        source: job.source,
        target: job.target,
        input_format: job.input_format,
        output_format: job.output_format,
        export_filter: job.export_filter,
    };
    info!(
        "converted {} -> {} on {} in {}ms",
        report.source.display(),
        report.target.display(),
        report.instance,
        report.elapsed_ms
    );
    Ok(report)
}

fn apply_and_store(conn: &Connection, job: &Job, doc: &Value) -> Result<()> {
    for filter in &job.filters {
        debug!("applying filter {}", filter.name());
        filter.apply(conn, doc)?;
    }
    conn.invoke(
        &BridgeRequest::new("store")
            .with_arg("doc", doc.clone())
            .with_arg("url", job.target_url.as_str())
            .with_arg("filter", job.export_filter.as_str())
            .with_arg("overwrite", true),
    )?;
    Ok(())
}
