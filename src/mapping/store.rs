use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::MappingError;
use crate::model::PageObservation;
use crate::util::now_utc_string;

/// Identifies which answers are interchangeable: same book bytes, same render
/// resolution, same question, same classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservationKey {
    pub book_id: String,
    pub dpi: u32,
    pub prompt_digest: String,
    pub classifier_id: String,
}

/// SQLite cache of parsed classifier answers. Only successful answers are
/// stored; unavailable pages are asked again on the next run.
pub struct ObservationStore {
    connection: Mutex<Connection>,
}

impl ObservationStore {
    pub fn open(path: &Path) -> Result<Self, MappingError> {
        let connection = Connection::open(path)
            .map_err(|error| MappingError::store("opening observation store", error))?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .map_err(|error| MappingError::store("setting journal_mode=WAL", error))?;
        connection
            .pragma_update(None, "synchronous", "NORMAL")
            .map_err(|error| MappingError::store("setting synchronous=NORMAL", error))?;
        Self::with_connection(connection)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, MappingError> {
        let connection = Connection::open_in_memory()
            .map_err(|error| MappingError::store("opening in-memory store", error))?;
        Self::with_connection(connection)
    }

    fn with_connection(connection: Connection) -> Result<Self, MappingError> {
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS page_observations (
                  book_id TEXT NOT NULL,
                  pdf_index INTEGER NOT NULL,
                  dpi INTEGER NOT NULL,
                  prompt_digest TEXT NOT NULL,
                  classifier_id TEXT NOT NULL,
                  printed_page INTEGER,
                  is_song_start INTEGER,
                  detected_title TEXT,
                  raw_reply TEXT NOT NULL,
                  observed_at TEXT NOT NULL,
                  PRIMARY KEY (book_id, pdf_index, dpi, prompt_digest, classifier_id)
                );

                CREATE INDEX IF NOT EXISTS idx_page_observations_book
                  ON page_observations(book_id);
                ",
            )
            .map_err(|error| MappingError::store("creating schema", error))?;

        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn load(
        &self,
        key: &ObservationKey,
        pdf_index: usize,
    ) -> Result<Option<PageObservation>, MappingError> {
        let connection = self.lock();
        connection
            .query_row(
                "
                SELECT printed_page, is_song_start, detected_title
                FROM page_observations
                WHERE book_id = ?1 AND pdf_index = ?2 AND dpi = ?3
                  AND prompt_digest = ?4 AND classifier_id = ?5
                ",
                params![
                    key.book_id,
                    pdf_index as i64,
                    key.dpi,
                    key.prompt_digest,
                    key.classifier_id
                ],
                |row| {
                    Ok(PageObservation {
                        pdf_index,
                        printed_page: row.get::<_, Option<i64>>(0)?,
                        is_song_start: row.get::<_, Option<i64>>(1)?.map(|flag| flag != 0),
                        detected_title: row.get::<_, Option<String>>(2)?,
                        unavailable: false,
                    })
                },
            )
            .optional()
            .map_err(|error| MappingError::store("loading observation", error))
    }

    pub fn save(
        &self,
        key: &ObservationKey,
        observation: &PageObservation,
        raw_reply: &str,
    ) -> Result<(), MappingError> {
        if observation.unavailable {
            return Ok(());
        }

        let connection = self.lock();
        connection
            .execute(
                "
                INSERT INTO page_observations(
                  book_id, pdf_index, dpi, prompt_digest, classifier_id,
                  printed_page, is_song_start, detected_title, raw_reply, observed_at
                )
                VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(book_id, pdf_index, dpi, prompt_digest, classifier_id) DO UPDATE SET
                  printed_page=excluded.printed_page,
                  is_song_start=excluded.is_song_start,
                  detected_title=excluded.detected_title,
                  raw_reply=excluded.raw_reply,
                  observed_at=excluded.observed_at
                ",
                params![
                    key.book_id,
                    observation.pdf_index as i64,
                    key.dpi,
                    key.prompt_digest,
                    key.classifier_id,
                    observation.printed_page,
                    observation.is_song_start.map(i64::from),
                    observation.detected_title,
                    raw_reply,
                    now_utc_string(),
                ],
            )
            .map_err(|error| MappingError::store("saving observation", error))?;
        Ok(())
    }

    pub fn count_for_book(&self, book_id: &str) -> Result<i64, MappingError> {
        let connection = self.lock();
        connection
            .query_row(
                "SELECT COUNT(*) FROM page_observations WHERE book_id = ?1",
                params![book_id],
                |row| row.get(0),
            )
            .map_err(|error| MappingError::store("counting observations", error))
    }

    pub fn count_books(&self) -> Result<i64, MappingError> {
        let connection = self.lock();
        connection
            .query_row(
                "SELECT COUNT(DISTINCT book_id) FROM page_observations",
                [],
                |row| row.get(0),
            )
            .map_err(|error| MappingError::store("counting books", error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(book_id: &str) -> ObservationKey {
        ObservationKey {
            book_id: book_id.to_string(),
            dpi: 150,
            prompt_digest: "digest".to_string(),
            classifier_id: "command:test".to_string(),
        }
    }

    #[test]
    fn save_then_load_round_trips_fields() {
        let store = ObservationStore::open_in_memory().expect("store");
        let observation = PageObservation {
            pdf_index: 7,
            printed_page: Some(15),
            is_song_start: Some(true),
            detected_title: Some("Piano Man".to_string()),
            unavailable: false,
        };

        store
            .save(&key("book-a"), &observation, "raw")
            .expect("save");

        assert_eq!(
            store.load(&key("book-a"), 7).expect("load"),
            Some(observation)
        );
        assert_eq!(store.load(&key("book-b"), 7).expect("load"), None);
        assert_eq!(store.count_for_book("book-a").expect("count"), 1);
    }

    #[test]
    fn unavailable_observations_are_not_persisted() {
        let store = ObservationStore::open_in_memory().expect("store");
        store
            .save(&key("book-a"), &PageObservation::unavailable(3), "")
            .expect("save");
        assert_eq!(store.load(&key("book-a"), 3).expect("load"), None);
    }

    #[test]
    fn different_dpi_is_a_different_key() {
        let store = ObservationStore::open_in_memory().expect("store");
        let observation = PageObservation {
            pdf_index: 1,
            ..PageObservation::default()
        };
        store.save(&key("book-a"), &observation, "").expect("save");

        let mut other = key("book-a");
        other.dpi = 300;
        assert_eq!(store.load(&other, 1).expect("load"), None);
    }

    #[test]
    fn different_classifier_is_a_different_key() {
        let store = ObservationStore::open_in_memory().expect("store");
        let observation = PageObservation {
            pdf_index: 6,
            detected_title: Some("Honesty".to_string()),
            ..PageObservation::default()
        };
        let mut replayed = key("book-a");
        replayed.classifier_id = "replay:abc".to_string();
        store.save(&replayed, &observation, "").expect("save");

        assert_eq!(store.load(&key("book-a"), 6).expect("load"), None);
        let mut rerecorded = key("book-a");
        rerecorded.classifier_id = "replay:def".to_string();
        assert_eq!(store.load(&rerecorded, 6).expect("load"), None);
        assert_eq!(
            store.load(&replayed, 6).expect("load"),
            Some(observation)
        );
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("observations.sqlite");
        let observation = PageObservation {
            pdf_index: 0,
            printed_page: None,
            is_song_start: Some(false),
            detected_title: None,
            unavailable: false,
        };

        {
            let store = ObservationStore::open(&path).expect("open");
            store.save(&key("book-a"), &observation, "").expect("save");
        }

        let reopened = ObservationStore::open(&path).expect("reopen");
        assert_eq!(
            reopened.load(&key("book-a"), 0).expect("load"),
            Some(observation)
        );
        assert_eq!(reopened.count_books().expect("books"), 1);
    }
}
