use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::PageCallError;
use crate::mapping::{PageClassifier, PageImage};
use crate::util::{read_json, sha256_file, sha256_text};

/// Runs an external program per page: prompt on stdin, image path as the
/// last argument, reply on stdout.
#[derive(Debug, Clone)]
pub struct CommandClassifier {
    program: String,
    args: Vec<String>,
}

impl CommandClassifier {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Stable identity of the program and its arguments.
    pub fn identity(&self) -> String {
        let mut invocation = self.program.clone();
        for arg in &self.args {
            invocation.push('\0');
            invocation.push_str(arg);
        }
        format!("command:{}", sha256_text(&invocation))
    }
}

impl PageClassifier for CommandClassifier {
    async fn classify(&self, image: &PageImage, prompt: &str) -> Result<String, PageCallError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&image.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| {
                PageCallError::unavailable(format!("failed to execute {}: {error}", self.program))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await.map_err(|error| {
                PageCallError::unavailable(format!("failed to send prompt: {error}"))
            })?;
        }

        let output = child.wait_with_output().await.map_err(|error| {
            PageCallError::unavailable(format!("failed to read {} output: {error}", self.program))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PageCallError::unavailable(format!(
                "{} exited with {} for page {}: {}",
                self.program,
                output.status,
                image.pdf_index,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Answers from a recorded file: `{"<pdf_index>": "<reply>" | {..} | null}`.
/// `null` replays an unavailable page; pages not in the file reply `none`.
#[derive(Debug, Clone, Default)]
pub struct ReplayClassifier {
    replies: BTreeMap<usize, Option<String>>,
    digest: String,
}

impl ReplayClassifier {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = read_json::<BTreeMap<String, Value>>(path)?;
        let mut replies = BTreeMap::new();
        for (key, value) in raw {
            let pdf_index = key
                .trim()
                .parse::<usize>()
                .with_context(|| format!("replay key '{key}' is not a page index"))?;
            let reply = match value {
                Value::Null => None,
                Value::String(text) => Some(text),
                Value::Object(_) => Some(value.to_string()),
                other => bail!("replay entry for page {pdf_index} has unsupported value {other}"),
            };
            replies.insert(pdf_index, reply);
        }
        let digest = sha256_file(path)?;
        Ok(Self { replies, digest })
    }

    /// Changes whenever the recorded file changes.
    pub fn identity(&self) -> String {
        format!("replay:{}", self.digest)
    }

    pub fn recorded_pages(&self) -> usize {
        self.replies.len()
    }
}

impl PageClassifier for ReplayClassifier {
    async fn classify(&self, image: &PageImage, _prompt: &str) -> Result<String, PageCallError> {
        match self.replies.get(&image.pdf_index) {
            Some(Some(reply)) => Ok(reply.clone()),
            Some(None) => Err(PageCallError::unavailable(format!(
                "page {} was recorded as unavailable",
                image.pdf_index
            ))),
            None => Ok("none".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConfiguredClassifier {
    Command(CommandClassifier),
    Replay(ReplayClassifier),
}

impl ConfiguredClassifier {
    /// Which answers a stored observation came from. Answers from different
    /// classifiers, or from different recordings, are never shared.
    pub fn identity(&self) -> String {
        match self {
            Self::Command(classifier) => classifier.identity(),
            Self::Replay(classifier) => classifier.identity(),
        }
    }
}

impl PageClassifier for ConfiguredClassifier {
    async fn classify(&self, image: &PageImage, prompt: &str) -> Result<String, PageCallError> {
        match self {
            Self::Command(classifier) => classifier.classify(image, prompt).await,
            Self::Replay(classifier) => classifier.classify(image, prompt).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn image(pdf_index: usize) -> PageImage {
        PageImage {
            pdf_index,
            path: PathBuf::from(format!("/tmp/page-{pdf_index}.png")),
        }
    }

    #[tokio::test]
    async fn replay_file_answers_by_page_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("replies.json");
        std::fs::write(
            &path,
            r#"{
                "2": "PRINTED_PAGE: 10\nIS_SONG_START: YES\nSONG_TITLE: Big Shot",
                "3": {"printed_page": 11, "is_song_start": false, "song_title": null},
                "4": null
            }"#,
        )
        .expect("write");

        let replay = ReplayClassifier::from_path(&path).expect("replay");
        assert_eq!(replay.recorded_pages(), 3);

        let text = replay.classify(&image(2), "prompt").await.expect("reply");
        assert!(text.contains("Big Shot"));
        let object = replay.classify(&image(3), "prompt").await.expect("reply");
        assert!(object.contains("\"printed_page\":11"));
        assert!(matches!(
            replay.classify(&image(4), "prompt").await,
            Err(PageCallError::ClassifierUnavailable { .. })
        ));
        assert_eq!(
            replay.classify(&image(9), "prompt").await.expect("reply"),
            "none"
        );
    }

    #[test]
    fn identity_follows_recording_and_invocation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("replies.json");
        std::fs::write(&path, r#"{"6": "SONG_TITLE: Honesty"}"#).expect("write");
        let before = ReplayClassifier::from_path(&path).expect("replay").identity();
        std::fs::write(&path, r#"{"8": "SONG_TITLE: Honesty"}"#).expect("write");
        let after = ReplayClassifier::from_path(&path).expect("replay").identity();
        assert_ne!(before, after);
        assert!(before.starts_with("replay:"));

        let plain = CommandClassifier::new("vision", Vec::new()).identity();
        let tuned = CommandClassifier::new("vision", vec!["--model=large".to_string()]);
        assert_ne!(plain, tuned.identity());
        assert_eq!(tuned.identity(), tuned.clone().identity());
    }

    #[test]
    fn replay_rejects_non_numeric_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("replies.json");
        std::fs::write(&path, r#"{"cover": "none"}"#).expect("write");
        assert!(ReplayClassifier::from_path(&path).is_err());
    }

    #[tokio::test]
    async fn command_receives_prompt_on_stdin_and_image_path_last() {
        let classifier = CommandClassifier::new(
            "sh",
            vec![
                "-c".to_string(),
                r#"read first; echo "PROMPT: $first"; echo "IMAGE: $0""#.to_string(),
            ],
        );

        let reply = classifier
            .classify(&image(7), "first line of prompt\nsecond")
            .await
            .expect("reply");
        assert!(reply.contains("PROMPT: first line of prompt"));
        assert!(reply.contains("IMAGE: /tmp/page-7.png"));
    }

    #[tokio::test]
    async fn failing_command_is_reported_unavailable() {
        let classifier = CommandClassifier::new(
            "sh",
            vec!["-c".to_string(), "cat >/dev/null; exit 3".to_string()],
        );
        let error = classifier
            .classify(&image(1), "prompt")
            .await
            .expect_err("should fail");
        assert!(matches!(error, PageCallError::ClassifierUnavailable { .. }));
    }
}
