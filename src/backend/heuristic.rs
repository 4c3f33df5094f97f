use super::RawPrediction;

/// Confidence assigned to a keyword match
pub const KEYWORD_CONFIDENCE: f64 = 0.75;

const NEGATIVE_WORDS: &[&str] = &[
    "terrible", "horrible", "awful", "hate", "mala", "fea", "boring", "ugly", "bad", "waste",
];

const POSITIVE_WORDS: &[&str] = &[
    "excellent", "great", "amazing", "fantastic", "love", "buena", "bonita", "awesome",
];

/// Outcome of the keyword classifier
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeywordVerdict {
    Negative,
    Positive,
    Neutral,
}

impl KeywordVerdict {
    /// Class distribution for a decided verdict, `None` when neutral
    pub fn raw_prediction(&self) -> Option<RawPrediction> {
        match self {
            KeywordVerdict::Negative => Some(RawPrediction::Distribution {
                negative: KEYWORD_CONFIDENCE,
                positive: 1.0 - KEYWORD_CONFIDENCE,
            }),
            KeywordVerdict::Positive => Some(RawPrediction::Distribution {
                negative: 1.0 - KEYWORD_CONFIDENCE,
                positive: KEYWORD_CONFIDENCE,
            }),
            KeywordVerdict::Neutral => None,
        }
    }
}

/// Last-resort classifier used when no model can be loaded.
///
/// Matches substrings of the lowercased text; negative words win over positive ones.
pub fn classify_keywords(text: &str) -> KeywordVerdict {
    let lower = text.to_lowercase();

    if NEGATIVE_WORDS.iter().any(|w| lower.contains(w)) {
        KeywordVerdict::Negative
    } else if POSITIVE_WORDS.iter().any(|w| lower.contains(w)) {
        KeywordVerdict::Positive
    } else {
        KeywordVerdict::Neutral
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_words_win() {
        assert_eq!(classify_keywords("Great cast, boring plot"), KeywordVerdict::Negative);
        assert_eq!(classify_keywords("I HATE this film"), KeywordVerdict::Negative);
    }

    #[test]
    fn test_positive_words() {
        assert_eq!(classify_keywords("An amazing journey"), KeywordVerdict::Positive);
        assert_eq!(classify_keywords("Una película muy bonita"), KeywordVerdict::Positive);
    }

    #[test]
    fn test_no_keywords_is_neutral() {
        assert_eq!(classify_keywords("It was a film with actors"), KeywordVerdict::Neutral);
        assert_eq!(KeywordVerdict::Neutral.raw_prediction(), None);
    }

    #[test]
    fn test_verdict_distribution() {
        assert_eq!(
            KeywordVerdict::Negative.raw_prediction(),
            Some(RawPrediction::Distribution { negative: 0.75, positive: 0.25 })
        );
    }
}
