use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{StreamExt, TryStreamExt, stream};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::{MappingError, PageCallError};
use crate::mapping::response::{PAGE_PROMPT, ReplyParser};
use crate::mapping::retry::{CancelSignal, RetryPolicy};
use crate::mapping::store::{ObservationKey, ObservationStore};
use crate::model::{ClassifierStats, PageObservation};
use crate::util::sha256_text;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub pdf_index: usize,
    pub path: PathBuf,
}

/// Turns one page of one book into an image. Implementations are bound to a
/// single document.
pub trait PageRenderer: Send + Sync {
    fn render(
        &self,
        pdf_index: usize,
    ) -> impl Future<Output = Result<PageImage, PageCallError>> + Send;
}

/// Noisy vision oracle: image plus question in, free text out.
pub trait PageClassifier: Send + Sync {
    fn classify(
        &self,
        image: &PageImage,
        prompt: &str,
    ) -> impl Future<Output = Result<String, PageCallError>> + Send;
}

pub struct StoreBinding {
    pub store: Arc<ObservationStore>,
    pub key: ObservationKey,
}

impl StoreBinding {
    pub fn new(
        store: Arc<ObservationStore>,
        book_id: impl Into<String>,
        dpi: u32,
        classifier_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            key: ObservationKey {
                book_id: book_id.into(),
                dpi,
                prompt_digest: sha256_text(PAGE_PROMPT),
                classifier_id: classifier_id.into(),
            },
        }
    }
}

/// Per-book, memoizing front door to the renderer and classifier. Every page
/// is asked at most once per run, even when callers race for it; answers are
/// shared by the offset estimator and the boundary resolver.
pub struct PageOracle<R, C> {
    renderer: R,
    classifier: C,
    retry: RetryPolicy,
    cancel: CancelSignal,
    parser: ReplyParser,
    store: Option<StoreBinding>,
    total_pages: usize,
    concurrency: usize,
    observed: Mutex<BTreeMap<usize, PageObservation>>,
    in_flight: Mutex<BTreeMap<usize, Arc<OnceCell<PageObservation>>>>,
    stats: Mutex<ClassifierStats>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<R: PageRenderer, C: PageClassifier> PageOracle<R, C> {
    pub fn new(
        renderer: R,
        classifier: C,
        retry: RetryPolicy,
        total_pages: usize,
    ) -> Result<Self, MappingError> {
        let parser = ReplyParser::new().map_err(|error| {
            MappingError::invalid_input(format!("reply patterns failed to compile: {error}"))
        })?;

        Ok(Self {
            renderer,
            classifier,
            retry,
            cancel: CancelSignal::never(),
            parser,
            store: None,
            total_pages,
            concurrency: 4,
            observed: Mutex::new(BTreeMap::new()),
            in_flight: Mutex::new(BTreeMap::new()),
            stats: Mutex::new(ClassifierStats::default()),
        })
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_store(mut self, store: StoreBinding) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    pub fn ensure_active(&self) -> Result<(), MappingError> {
        if self.cancel.is_cancelled() {
            return Err(MappingError::Cancelled);
        }
        Ok(())
    }

    pub fn stats(&self) -> ClassifierStats {
        let mut stats = lock(&self.stats).clone();
        stats.unavailable_pages.sort_unstable();
        stats
    }

    /// Already-answered pages inside `range`, without issuing new calls.
    pub fn cached(&self, range: RangeInclusive<usize>) -> Vec<PageObservation> {
        lock(&self.observed)
            .range(range)
            .map(|(_, observation)| observation.clone())
            .collect()
    }

    pub async fn observe(&self, pdf_index: usize) -> Result<PageObservation, MappingError> {
        if pdf_index >= self.total_pages {
            return Err(MappingError::invalid_input(format!(
                "page {pdf_index} is outside a {}-page document",
                self.total_pages
            )));
        }
        if let Some(hit) = lock(&self.observed).get(&pdf_index) {
            return Ok(hit.clone());
        }
        self.ensure_active()?;

        let cell = lock(&self.in_flight).entry(pdf_index).or_default().clone();
        let observation = cell.get_or_try_init(|| self.fetch(pdf_index)).await?;
        Ok(observation.clone())
    }

    async fn fetch(&self, pdf_index: usize) -> Result<PageObservation, MappingError> {
        if let Some(stored) = self.load_stored(pdf_index) {
            lock(&self.stats).store_hits += 1;
            return Ok(self.remember(stored));
        }

        let renderer = &self.renderer;
        let classifier = &self.classifier;
        let outcome = self
            .retry
            .run(&self.cancel, "classify_page", || async move {
                let image = renderer.render(pdf_index).await?;
                classifier.classify(&image, PAGE_PROMPT).await
            })
            .await;

        {
            let mut stats = lock(&self.stats);
            stats.classifier_calls += outcome.attempts as usize;
            stats.retries += outcome.attempts.saturating_sub(1) as usize;
        }

        let observation = match outcome.result {
            Ok(reply) => {
                let observation = self.parser.parse(pdf_index, &reply);
                debug!(
                    pdf_index,
                    printed_page = ?observation.printed_page,
                    is_song_start = ?observation.is_song_start,
                    title = ?observation.detected_title,
                    "page classified"
                );
                self.save_stored(&observation, &reply);
                observation
            }
            Err(PageCallError::Cancelled) => return Err(MappingError::Cancelled),
            Err(error) => {
                warn!(pdf_index, error = %error, "page unavailable after retries");
                lock(&self.stats).unavailable_pages.push(pdf_index);
                PageObservation::unavailable(pdf_index)
            }
        };

        Ok(self.remember(observation))
    }

    /// Observes `indices` with bounded concurrency. Out-of-range indices are
    /// skipped; the result is ordered by page index without duplicates.
    pub async fn observe_many(
        &self,
        indices: impl IntoIterator<Item = usize>,
    ) -> Result<Vec<PageObservation>, MappingError> {
        let wanted = indices
            .into_iter()
            .filter(|index| *index < self.total_pages)
            .collect::<BTreeSet<usize>>();

        stream::iter(wanted)
            .map(|index| self.observe(index))
            .buffered(self.concurrency)
            .try_collect()
            .await
    }

    fn remember(&self, observation: PageObservation) -> PageObservation {
        let mut observed = lock(&self.observed);
        let kept = observed
            .entry(observation.pdf_index)
            .or_insert(observation)
            .clone();
        lock(&self.stats).pages_observed = observed.len();
        kept
    }

    fn load_stored(&self, pdf_index: usize) -> Option<PageObservation> {
        let binding = self.store.as_ref()?;
        match binding.store.load(&binding.key, pdf_index) {
            Ok(found) => found,
            Err(error) => {
                warn!(pdf_index, error = %error, "observation store read failed");
                None
            }
        }
    }

    fn save_stored(&self, observation: &PageObservation, reply: &str) {
        let Some(binding) = self.store.as_ref() else {
            return;
        };
        if let Err(error) = binding.store.save(&binding.key, observation, reply) {
            warn!(
                pdf_index = observation.pdf_index,
                error = %error,
                "observation store write failed"
            );
        }
    }
}
