use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::cli::ResolveArgs;
use crate::config::{ClassifierKind, MappingConfig};
use crate::mapping::{
    CancelSignal, ObservationStore, PageOracle, StoreBinding, cancel_pair, resolve_book,
};
use crate::model::{BookRef, SegmentManifest, TocEntry};
use crate::pages::{
    CommandClassifier, ConfiguredClassifier, ConfiguredRenderer, PdftoppmRenderer,
    ReplayClassifier, UnrenderedPages, probe_page_count,
};
use crate::util::{
    ensure_directory, now_utc_string, read_json, safe_stem, sha256_file, write_json_atomic,
};

pub const SEGMENT_MANIFEST_VERSION: u32 = 1;

/// One book to resolve and where its artifact goes.
#[derive(Debug, Clone)]
pub struct BookJob {
    pub pdf_path: PathBuf,
    pub toc_path: PathBuf,
    pub output_path: PathBuf,
    pub replay_path: Option<PathBuf>,
    pub total_pages: Option<usize>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TocFile {
    Entries(Vec<TocEntry>),
    Wrapped { entries: Vec<TocEntry> },
}

pub async fn run(args: ResolveArgs) -> Result<()> {
    let mut config = MappingConfig::load(args.config.as_deref())?;
    if let Some(dpi) = args.dpi {
        config.render.dpi = dpi;
    }
    config.validate()?;

    let store = open_store(&args.cache_root)?;
    let output_path = args
        .output
        .unwrap_or_else(|| default_output_path(&args.cache_root, &args.pdf));
    let job = BookJob {
        pdf_path: args.pdf,
        toc_path: args.toc,
        output_path,
        replay_path: args.replay,
        total_pages: args.total_pages,
    };

    let (handle, cancel) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling book");
            handle.cancel();
        }
    });

    let manifest = resolve_one(&job, &config, &args.cache_root, store, cancel).await?;
    info!(
        path = %job.output_path.display(),
        segments = manifest.segments.len(),
        fallback = manifest.review.fallback_count,
        review_required = manifest.review.review_required,
        "wrote segment manifest"
    );
    Ok(())
}

pub fn open_store(cache_root: &Path) -> Result<Arc<ObservationStore>> {
    ensure_directory(cache_root)?;
    let path = cache_root.join("observations.sqlite");
    let store = ObservationStore::open(&path)
        .with_context(|| format!("failed to open observation store {}", path.display()))?;
    Ok(Arc::new(store))
}

pub fn default_output_path(cache_root: &Path, pdf_path: &Path) -> PathBuf {
    cache_root
        .join("segments")
        .join(format!("{}.segments.json", safe_stem(pdf_path)))
}

/// Accepts either a bare array of entries or `{"entries": [...]}`; entries
/// may use `song_title`/`printed_page` or `title`/`page`.
pub fn load_toc(path: &Path) -> Result<Vec<TocEntry>> {
    let toc = match read_json::<TocFile>(path)? {
        TocFile::Entries(entries) | TocFile::Wrapped { entries } => entries,
    };
    Ok(toc)
}

/// Resolves one book and writes its manifest atomically. Nothing is written
/// when resolution fails or is cancelled.
pub async fn resolve_one(
    job: &BookJob,
    config: &MappingConfig,
    cache_root: &Path,
    store: Arc<ObservationStore>,
    cancel: CancelSignal,
) -> Result<SegmentManifest> {
    let toc = load_toc(&job.toc_path)?;

    let pdf_path = job.pdf_path.clone();
    let book_id = tokio::task::spawn_blocking(move || sha256_file(&pdf_path))
        .await
        .context("hashing task failed")??;

    let total_pages = match job.total_pages {
        Some(total) => total,
        None => probe_page_count(&config.render.pdfinfo, &job.pdf_path).await?,
    };
    info!(
        pdf = %job.pdf_path.display(),
        book_id = %book_id,
        total_pages,
        toc_entries = toc.len(),
        "resolving book"
    );

    let (renderer, classifier) = collaborators(job, config, cache_root, &book_id)?;
    let binding = StoreBinding::new(
        store,
        book_id.clone(),
        config.render.dpi,
        classifier.identity(),
    );
    let oracle = PageOracle::new(renderer, classifier, config.retry.policy(), total_pages)?
        .with_cancel(cancel)
        .with_store(binding)
        .with_concurrency(config.search.lookahead);

    let resolution = resolve_book(&toc, &oracle, config)
        .await
        .with_context(|| format!("failed to resolve {}", job.pdf_path.display()))?;

    let manifest = SegmentManifest {
        manifest_version: SEGMENT_MANIFEST_VERSION,
        generated_at: now_utc_string(),
        book: BookRef {
            book_id,
            pdf_path: job.pdf_path.display().to_string(),
            total_pages,
        },
        toc_entry_count: toc.len(),
        offset: resolution.estimate,
        segments: resolution.segments,
        issues: resolution.issues,
        review: resolution.review,
        classifier: resolution.stats,
    };
    write_json_atomic(&job.output_path, &manifest)?;
    Ok(manifest)
}

fn collaborators(
    job: &BookJob,
    config: &MappingConfig,
    cache_root: &Path,
    book_id: &str,
) -> Result<(ConfiguredRenderer, ConfiguredClassifier)> {
    let replay_path = job.replay_path.clone().or_else(|| match config.classifier.kind {
        ClassifierKind::Replay => config.classifier.replay_path.clone(),
        ClassifierKind::Command => None,
    });

    if let Some(path) = replay_path {
        let replay = ReplayClassifier::from_path(&path)?;
        info!(
            path = %path.display(),
            recorded_pages = replay.recorded_pages(),
            "replaying recorded classifier answers"
        );
        return Ok((
            ConfiguredRenderer::Unrendered(UnrenderedPages),
            ConfiguredClassifier::Replay(replay),
        ));
    }
    if config.classifier.kind == ClassifierKind::Replay {
        anyhow::bail!(
            "classifier kind is replay but no replay file was given for {}",
            job.pdf_path.display()
        );
    }

    let program = config
        .classifier
        .program
        .clone()
        .context("classifier.program must be set for the command classifier")?;
    let renderer = PdftoppmRenderer::new(
        config.render.pdftoppm.clone(),
        &job.pdf_path,
        cache_root,
        book_id,
        config.render.dpi,
    );
    Ok((
        ConfiguredRenderer::Pdftoppm(renderer),
        ConfiguredClassifier::Command(CommandClassifier::new(
            program,
            config.classifier.args.clone(),
        )),
    ))
}

#[cfg(test)]
mod tests;
