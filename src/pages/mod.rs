//! Concrete renderers and classifiers behind the mapping traits.

pub mod classifier;
pub mod render;

pub use classifier::{CommandClassifier, ConfiguredClassifier, ReplayClassifier};
pub use render::{ConfiguredRenderer, PdftoppmRenderer, UnrenderedPages, probe_page_count};
