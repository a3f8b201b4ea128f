use strsim::normalized_levenshtein;

const CONTAINMENT_SCORE: f64 = 0.9;
const MIN_CONTAINED_CHARS: usize = 4;

/// Lowercase, punctuation to spaces, whitespace collapsed.
pub fn normalize_title(input: &str) -> String {
    input
        .chars()
        .map(|character| {
            if character.is_alphanumeric() {
                character.to_lowercase().next().unwrap_or(character)
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
}

pub fn title_similarity(expected: &str, observed: &str) -> f64 {
    let expected = normalize_title(expected);
    let observed = normalize_title(observed);
    if expected.is_empty() || observed.is_empty() {
        return 0.0;
    }
    if expected == observed {
        return 1.0;
    }

    let (shorter, longer) = if expected.len() <= observed.len() {
        (&expected, &observed)
    } else {
        (&observed, &expected)
    };
    let fuzzy = normalized_levenshtein(&expected, &observed);
    if shorter.chars().count() >= MIN_CONTAINED_CHARS && contains_words(longer, shorter) {
        return fuzzy.max(CONTAINMENT_SCORE);
    }

    fuzzy
}

fn contains_words(haystack: &str, needle: &str) -> bool {
    format!(" {haystack} ").contains(&format!(" {needle} "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_title_folds_case_and_punctuation() {
        assert_eq!(normalize_title("  Big   Shot! "), "big shot");
        assert_eq!(normalize_title("Don't Ask Me Why"), "don t ask me why");
        assert_eq!(normalize_title("---"), "");
    }

    #[test]
    fn exact_after_normalization_scores_one() {
        assert_eq!(title_similarity("HONESTY", "honesty."), 1.0);
    }

    #[test]
    fn containment_scores_high_for_decorated_titles() {
        let score = title_similarity("Big Shot", "BIG SHOT (Words and Music by Billy Joel)");
        assert!(score >= 0.9, "score was {score}");
    }

    #[test]
    fn short_fragments_do_not_count_as_containment() {
        let score = title_similarity("Me", "Tell Me Why");
        assert!(score < 0.8, "score was {score}");
    }

    #[test]
    fn ocr_noise_still_matches_fuzzily() {
        let score = title_similarity("Piano Man", "Piano Mam");
        assert!(score >= 0.8, "score was {score}");
    }

    #[test]
    fn unrelated_titles_score_low() {
        assert!(title_similarity("Honesty", "Movin' Out") < 0.5);
        assert_eq!(title_similarity("Honesty", ""), 0.0);
    }
}
