use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Predict the sentiment of English text
    Predict {
        /// Review text
        #[arg(short, long)]
        text: String,

        /// Backend: transformer, recurrent, linear or ensemble
        #[arg(short, long)]
        model: Option<String>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Detect the language of text
    Detect {
        /// Text to inspect
        #[arg(short, long)]
        text: String,
    },

    /// Translate text to English
    Translate {
        /// Text to translate
        #[arg(short, long)]
        text: String,

        /// Source language code, detected when omitted
        #[arg(short, long)]
        lang: Option<String>,
    },

    /// Detect, translate and predict a review in any language
    Analyze {
        /// Review text
        #[arg(short, long)]
        text: String,

        /// Backend: transformer, recurrent, linear or ensemble
        #[arg(short, long)]
        model: Option<String>,

        /// Movie identifier
        #[arg(long)]
        movie_id: Option<u64>,

        /// Movie title
        #[arg(long)]
        movie_title: Option<String>,

        /// User rating
        #[arg(long)]
        rating: Option<f64>,

        /// Append the review record to the local store
        #[arg(long)]
        save: bool,
    },

    /// List backends and the state of their artifacts
    Models,

    /// Re-analyze stored reviews with an undecided sentiment
    Recompute {
        /// Review store, defaults to the configured backup file
        #[arg(short, long)]
        store: Option<PathBuf>,

        /// Backend: transformer, recurrent, linear or ensemble
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Manage the translation cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
pub enum CacheAction {
    /// List cached translations
    List,

    /// Clear all cached translations
    Clear,

    /// Show cache statistics and size
    Info,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_predict() {
        let args = Args::try_parse_from([
            "critic", "-v", "predict", "--text", "Loved it", "--model", "lstm", "--json",
        ])
        .unwrap();
        assert!(args.verbose);
        match args.command {
            Commands::Predict { text, model, json } => {
                assert_eq!(text, "Loved it");
                assert_eq!(model.as_deref(), Some("lstm"));
                assert!(json);
            }
            _ => panic!("expected predict"),
        }
    }

    #[test]
    fn test_parse_analyze_metadata() {
        let args = Args::try_parse_from([
            "critic", "analyze", "--text", "la odio", "--movie-id", "603", "--rating", "2.5", "--save",
        ])
        .unwrap();
        match args.command {
            Commands::Analyze { movie_id, rating, save, model, .. } => {
                assert_eq!(movie_id, Some(603));
                assert_eq!(rating, Some(2.5));
                assert!(save);
                assert!(model.is_none());
            }
            _ => panic!("expected analyze"),
        }
    }

    #[test]
    fn test_cache_requires_action() {
        assert!(Args::try_parse_from(["critic", "cache"]).is_err());
        assert!(Args::try_parse_from(["critic", "cache", "info"]).is_ok());
    }
}
