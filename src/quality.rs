use crate::config::QualityConfig;

/// Vowels counted by the vowel-ratio rule, including common accented Latin vowels.
const VOWELS: &str = "aeiouáéíóúàèìòùäëïöü";

/// Short English function words that make a run of short tokens look like language.
const COMMON_SHORT_WORDS: &[&str] = &[
    "the", "and", "but", "for", "not", "are", "was", "you", "all", "can", "had", "her", "him",
    "his", "how", "its", "may", "new", "now", "old", "one", "our", "out", "say", "she", "too",
    "two", "use", "way", "who", "yes", "yet",
];

/// Why a text was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    TooShort,
    RepeatedCharacters,
    LowVowelRatio,
    SingleCharacterTokens,
    ShortFragments,
}

/// Rejects inputs that are not meaningful natural-language text before they reach a model
#[derive(Debug, Clone)]
pub struct QualityFilter {
    min_length: usize,
    max_char_run: usize,
    min_vowel_ratio: f64,
    max_single_char_ratio: f64,
    max_short_token_ratio: f64,
    short_token_length: usize,
    min_recognizable: usize,
}

impl Default for QualityFilter {
    fn default() -> Self {
        Self {
            min_length: 5,
            max_char_run: 5,
            min_vowel_ratio: 0.15,
            max_single_char_ratio: 0.5,
            max_short_token_ratio: 0.7,
            short_token_length: 3,
            min_recognizable: 2,
        }
    }
}

impl From<&QualityConfig> for QualityFilter {
    fn from(config: &QualityConfig) -> Self {
        Self {
            min_length: config.min_length,
            max_char_run: config.max_char_run,
            min_vowel_ratio: config.min_vowel_ratio,
            max_single_char_ratio: config.max_single_char_ratio,
            max_short_token_ratio: config.max_short_token_ratio,
            short_token_length: config.short_token_length,
            min_recognizable: config.min_recognizable,
        }
    }
}

impl QualityFilter {
    pub fn is_garbage(&self, text: &str) -> bool {
        self.check(text).is_some()
    }

    /// Apply the rules in order and return the first one that rejects the text
    pub fn check(&self, text: &str) -> Option<Rejection> {
        let cleaned = text.trim();

        if cleaned.chars().count() < self.min_length {
            return Some(Rejection::TooShort);
        }

        if longest_char_run(cleaned) >= self.max_char_run {
            return Some(Rejection::RepeatedCharacters);
        }

        // Only literal spaces are stripped here, tabs and newlines still count
        let no_space: Vec<char> = cleaned.chars().filter(|c| *c != ' ').collect();
        if no_space.len() > 5 {
            let vowel_count = no_space
                .iter()
                .flat_map(|c| c.to_lowercase())
                .filter(|c| VOWELS.contains(*c))
                .count();
            let vowel_ratio = vowel_count as f64 / no_space.len() as f64;
            if vowel_ratio < self.min_vowel_ratio {
                return Some(Rejection::LowVowelRatio);
            }
        }

        let words: Vec<&str> = cleaned.split_whitespace().collect();
        if words.len() >= 4 {
            let total = words.len() as f64;

            let single_char_words = words.iter().filter(|w| w.chars().count() == 1).count();
            if single_char_words as f64 / total > self.max_single_char_ratio {
                return Some(Rejection::SingleCharacterTokens);
            }

            let short_words = words
                .iter()
                .filter(|w| w.chars().count() <= self.short_token_length)
                .count();
            if short_words as f64 / total > self.max_short_token_ratio {
                let recognizable = words
                    .iter()
                    .filter(|w| COMMON_SHORT_WORDS.contains(&w.to_lowercase().as_str()))
                    .count();
                if recognizable < self.min_recognizable {
                    return Some(Rejection::ShortFragments);
                }
            }
        }

        None
    }
}

/// Check a text against the default rules
pub fn is_garbage(text: &str) -> bool {
    QualityFilter::default().is_garbage(text)
}

fn longest_char_run(text: &str) -> usize {
    let mut longest = 0;
    let mut current = 0;
    let mut previous: Option<char> = None;

    for c in text.chars() {
        // Line breaks never form a run
        if c == '\n' {
            current = 0;
            previous = None;
            continue;
        }
        if previous == Some(c) {
            current += 1;
        } else {
            current = 1;
            previous = Some(c);
        }
        longest = longest.max(current);
    }

    longest
}
