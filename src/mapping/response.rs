use regex::Regex;
use serde_json::Value;

use crate::model::PageObservation;

/// Page-generic question sent with every page image. It does not mention any
/// TOC title, so one answer serves every entry that looks at the page.
pub const PAGE_PROMPT: &str = "You are looking at one scanned page of a sheet-music songbook.\n\
Answer with exactly three lines:\n\
PRINTED_PAGE: <the page number printed on the page, or none>\n\
IS_SONG_START: <YES if a new song begins on this page with its title shown, otherwise NO>\n\
SONG_TITLE: <the title of the song that begins on this page, or none>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    PrintedPage,
    SongStart,
    SongTitle,
}

pub struct ReplyParser {
    field_line: Regex,
    page_value: Regex,
}

impl ReplyParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            field_line: Regex::new(
                r"(?i)^\s*(?:[-*•]\s*)?\**\s*(printed[ _]?page(?:[ _]?number)?|page[ _]?number|is[ _]?song[ _]?start|song[ _]?start|song[ _]?title|title)\s*\**\s*[:=]\s*(.*?)\s*$",
            )?,
            page_value: Regex::new(r"(?i)^(?:p\.?|page)?\s*#?\s*([0-9]{1,4})\.?$")?,
        })
    }

    /// Never fails: anything unreadable becomes an unknown field.
    pub fn parse(&self, pdf_index: usize, reply: &str) -> PageObservation {
        let mut observation = PageObservation {
            pdf_index,
            ..PageObservation::default()
        };

        if let Some(object) = embedded_json_object(reply) {
            self.apply_json(&mut observation, &object);
            return observation;
        }

        for line in reply.lines() {
            let Some(captures) = self.field_line.captures(line) else {
                continue;
            };
            let (Some(key), Some(value)) = (captures.get(1), captures.get(2)) else {
                continue;
            };
            let Some(field) = field_for_key(key.as_str()) else {
                continue;
            };
            self.apply_text(&mut observation, field, value.as_str());
        }

        observation
    }

    fn apply_json(
        &self,
        observation: &mut PageObservation,
        object: &serde_json::Map<String, Value>,
    ) {
        for (key, value) in object {
            let Some(field) = field_for_key(key) else {
                continue;
            };
            match (field, value) {
                (Field::PrintedPage, Value::Number(number)) => {
                    observation.printed_page = number.as_i64().filter(|page| *page >= 0);
                }
                (Field::SongStart, Value::Bool(flag)) => {
                    observation.is_song_start = Some(*flag);
                }
                (_, Value::String(text)) => self.apply_text(observation, field, text),
                _ => {}
            }
        }
    }

    fn apply_text(&self, observation: &mut PageObservation, field: Field, raw: &str) {
        let value = clean_value(raw);
        match field {
            Field::PrintedPage => {
                observation.printed_page = self.parse_page(&value);
            }
            Field::SongStart => {
                observation.is_song_start = parse_flag(&value);
            }
            Field::SongTitle => {
                observation.detected_title = if is_absent(&value) { None } else { Some(value) };
            }
        }
    }

    fn parse_page(&self, value: &str) -> Option<i64> {
        if is_absent(value) {
            return None;
        }
        self.page_value
            .captures(value)
            .and_then(|captures| captures.get(1))
            .and_then(|digits| digits.as_str().parse::<i64>().ok())
    }
}

fn field_for_key(key: &str) -> Option<Field> {
    let key = key
        .chars()
        .filter(|character| character.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    match key.as_str() {
        "printedpage" | "printedpagenumber" | "pagenumber" | "page" => Some(Field::PrintedPage),
        "issongstart" | "songstart" => Some(Field::SongStart),
        "songtitle" | "title" => Some(Field::SongTitle),
        _ => None,
    }
}

fn embedded_json_object(reply: &str) -> Option<serde_json::Map<String, Value>> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&reply[start..=end]).ok()? {
        Value::Object(object) => Some(object),
        _ => None,
    }
}

fn clean_value(raw: &str) -> String {
    raw.trim()
        .trim_matches(|character: char| {
            character == '"' || character == '\'' || character == '*' || character == '`'
        })
        .trim()
        .to_string()
}

fn is_absent(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "" | "none" | "n/a" | "na" | "null" | "unknown" | "-" | "not visible"
    )
}

fn parse_flag(value: &str) -> Option<bool> {
    let lowered = value.to_ascii_lowercase();
    let word = lowered
        .split(|character: char| !character.is_ascii_alphabetic())
        .find(|part| !part.is_empty())?;
    match word {
        "yes" | "y" | "true" => Some(true),
        "no" | "n" | "false" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> ReplyParser {
        ReplyParser::new().expect("patterns compile")
    }

    #[test]
    fn parses_three_line_text_reply() {
        let reply = "PRINTED_PAGE: 10\nIS_SONG_START: YES\nSONG_TITLE: Big Shot";
        let observation = parser().parse(2, reply);
        assert_eq!(observation.pdf_index, 2);
        assert_eq!(observation.printed_page, Some(10));
        assert_eq!(observation.is_song_start, Some(true));
        assert_eq!(observation.detected_title.as_deref(), Some("Big Shot"));
        assert!(!observation.unavailable);
    }

    #[test]
    fn parses_markdown_decorated_reply() {
        let reply = "Here is what I see:\n\
                     - **Printed page:** 12.\n\
                     - **Is song start:** No, this continues the previous song\n\
                     - **Song title:** none";
        let observation = parser().parse(4, reply);
        assert_eq!(observation.printed_page, Some(12));
        assert_eq!(observation.is_song_start, Some(false));
        assert_eq!(observation.detected_title, None);
    }

    #[test]
    fn parses_structured_json_reply_with_mixed_types() {
        let reply = r#"```json
{"printed_page": "none", "is_song_start": "YES", "song_title": "Honesty"}
```"#;
        let observation = parser().parse(11, reply);
        assert_eq!(observation.printed_page, None);
        assert_eq!(observation.is_song_start, Some(true));
        assert_eq!(observation.detected_title.as_deref(), Some("Honesty"));

        let native = r#"{"page_number": 19, "song_start": false, "title": null}"#;
        let observation = parser().parse(11, native);
        assert_eq!(observation.printed_page, Some(19));
        assert_eq!(observation.is_song_start, Some(false));
        assert_eq!(observation.detected_title, None);
    }

    #[test]
    fn roman_and_garbage_page_values_are_unknown() {
        let observation = parser().parse(0, "PRINTED_PAGE: xiv\nIS_SONG_START: maybe");
        assert_eq!(observation.printed_page, None);
        assert_eq!(observation.is_song_start, None);

        let observation = parser().parse(0, "PRINTED_PAGE: Page 7");
        assert_eq!(observation.printed_page, Some(7));
    }

    #[test]
    fn malformed_reply_yields_unknown_fields() {
        let observation = parser().parse(3, "{not json at all");
        assert_eq!(observation.printed_page, None);
        assert_eq!(observation.is_song_start, None);
        assert_eq!(observation.detected_title, None);

        let observation = parser().parse(3, "");
        assert_eq!(observation, PageObservation {
            pdf_index: 3,
            ..PageObservation::default()
        });
    }
}
