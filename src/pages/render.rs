use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::debug;

use crate::error::PageCallError;
use crate::mapping::{PageImage, PageRenderer};

/// Renders single pages with poppler's `pdftoppm` into
/// `<cache_root>/pages/<book_id>/<dpi>/`. A page already on disk is reused.
#[derive(Debug, Clone)]
pub struct PdftoppmRenderer {
    program: String,
    pdf_path: PathBuf,
    cache_dir: PathBuf,
    dpi: u32,
}

impl PdftoppmRenderer {
    pub fn new(
        program: impl Into<String>,
        pdf_path: &Path,
        cache_root: &Path,
        book_id: &str,
        dpi: u32,
    ) -> Self {
        Self {
            program: program.into(),
            pdf_path: pdf_path.to_path_buf(),
            cache_dir: cache_root
                .join("pages")
                .join(book_id)
                .join(dpi.to_string()),
            dpi,
        }
    }

    pub fn cached_path(&self, pdf_index: usize) -> PathBuf {
        self.cache_dir.join(format!("{pdf_index:05}.png"))
    }

    async fn render_to_cache(&self, pdf_index: usize) -> Result<PathBuf, PageCallError> {
        let target = self.cached_path(pdf_index);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Ok(target);
        }

        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|error| PageCallError::render(pdf_index, error))?;

        // pdftoppm appends ".png" to the output root when -singlefile is set.
        let output_root = self
            .cache_dir
            .join(format!(".render-{pdf_index:05}-{}", std::process::id()));
        let produced = output_root.with_extension("png");
        let page_number = (pdf_index + 1).to_string();

        let output = Command::new(&self.program)
            .arg("-f")
            .arg(&page_number)
            .arg("-l")
            .arg(&page_number)
            .arg("-singlefile")
            .arg("-png")
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg(&self.pdf_path)
            .arg(&output_root)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|error| {
                PageCallError::render(
                    pdf_index,
                    format!("failed to execute {}: {error}", self.program),
                )
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PageCallError::render(
                pdf_index,
                format!("{} exited with {}: {}", self.program, output.status, stderr.trim()),
            ));
        }
        if !tokio::fs::try_exists(&produced).await.unwrap_or(false) {
            return Err(PageCallError::render(
                pdf_index,
                format!("{} did not produce {}", self.program, produced.display()),
            ));
        }

        tokio::fs::rename(&produced, &target)
            .await
            .map_err(|error| PageCallError::render(pdf_index, error))?;
        debug!(pdf_index, path = %target.display(), "page rendered");
        Ok(target)
    }
}

impl PageRenderer for PdftoppmRenderer {
    async fn render(&self, pdf_index: usize) -> Result<PageImage, PageCallError> {
        let path = self.render_to_cache(pdf_index).await?;
        Ok(PageImage { pdf_index, path })
    }
}

/// Stand-in for replay runs, where answers are keyed by page index and no
/// image is ever looked at.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnrenderedPages;

impl PageRenderer for UnrenderedPages {
    async fn render(&self, pdf_index: usize) -> Result<PageImage, PageCallError> {
        Ok(PageImage {
            pdf_index,
            path: PathBuf::new(),
        })
    }
}

#[derive(Debug, Clone)]
pub enum ConfiguredRenderer {
    Pdftoppm(PdftoppmRenderer),
    Unrendered(UnrenderedPages),
}

impl PageRenderer for ConfiguredRenderer {
    async fn render(&self, pdf_index: usize) -> Result<PageImage, PageCallError> {
        match self {
            Self::Pdftoppm(renderer) => renderer.render(pdf_index).await,
            Self::Unrendered(renderer) => renderer.render(pdf_index).await,
        }
    }
}

pub async fn probe_page_count(program: &str, pdf_path: &Path) -> Result<usize> {
    let output = Command::new(program)
        .arg(pdf_path)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to execute {program} for {}", pdf_path.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{program} returned non-zero exit status for {}: {}",
            pdf_path.display(),
            stderr.trim()
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_page_count(&stdout)
        .with_context(|| format!("{program} reported no page count for {}", pdf_path.display()))
}

fn parse_page_count(info: &str) -> Option<usize> {
    info.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("Pages:")?;
        rest.trim().parse::<usize>().ok()
    })
}
