//! Trainer configuration from environment variables

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::error::TrainerError;

#[derive(Clone, Debug)]
pub struct TrainerConfig {
    /// Path to Stockfish binary
    pub stockfish_path: String,

    /// Base URL of the move-probability / opponent service
    pub maia_url: Option<String>,

    /// Depth at which a background search is considered done
    pub search_target_depth: u32,

    /// Wall-clock budget for one background search
    pub search_timeout_ms: u64,

    /// Strength the probability model is queried at
    pub model_rating: u32,

    /// Confidence threshold passed to the probability model
    pub model_threshold: f32,

    /// Opponent "thinking" delay
    pub opponent_delay_ms: u64,

    /// Grace period between the last player move and drill completion
    pub completion_delay_ms: u64,

    /// Whether new positions are analyzed in the background
    pub analysis_enabled: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            stockfish_path: "/usr/local/bin/stockfish".to_string(),
            maia_url: None,
            search_target_depth: 15,
            search_timeout_ms: 5000,
            model_rating: 1500,
            model_threshold: 0.1,
            opponent_delay_ms: 1000,
            completion_delay_ms: 1500,
            analysis_enabled: true,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl TrainerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, TrainerError> {
        let defaults = Self::default();

        let stockfish_path = env::var("STOCKFISH_PATH").unwrap_or(defaults.stockfish_path);
        let maia_url = env::var("MAIA_URL")
            .ok()
            .map(|url| url.trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());

        let model_threshold = env_or("MODEL_THRESHOLD", defaults.model_threshold);
        if !(0.0..=1.0).contains(&model_threshold) {
            return Err(TrainerError::Config("MODEL_THRESHOLD must be within 0..=1"));
        }

        let search_target_depth = env_or("SEARCH_TARGET_DEPTH", defaults.search_target_depth);
        if search_target_depth == 0 {
            return Err(TrainerError::Config("SEARCH_TARGET_DEPTH must be positive"));
        }

        let config = Self {
            stockfish_path,
            maia_url,
            search_target_depth,
            search_timeout_ms: env_or("SEARCH_TIMEOUT_MS", defaults.search_timeout_ms),
            model_rating: env_or("MODEL_RATING", defaults.model_rating),
            model_threshold,
            opponent_delay_ms: env_or("OPPONENT_DELAY_MS", defaults.opponent_delay_ms),
            completion_delay_ms: env_or("COMPLETION_DELAY_MS", defaults.completion_delay_ms),
            analysis_enabled: env_or("ANALYSIS_ENABLED", defaults.analysis_enabled),
        };

        info!(
            stockfish_path = %config.stockfish_path,
            depth = config.search_target_depth,
            model_rating = config.model_rating,
            "Trainer config loaded"
        );
        Ok(config)
    }

    pub fn analysis_settings(&self) -> AnalysisSettings {
        AnalysisSettings {
            target_depth: self.search_target_depth,
            timeout: Duration::from_millis(self.search_timeout_ms),
            model_rating: self.model_rating,
            model_threshold: self.model_threshold,
        }
    }

    pub fn timing(&self) -> DrillTiming {
        DrillTiming {
            opponent_delay: Duration::from_millis(self.opponent_delay_ms),
            completion_delay: Duration::from_millis(self.completion_delay_ms),
        }
    }
}

/// Budget for one background analysis.
#[derive(Clone, Copy, Debug)]
pub struct AnalysisSettings {
    pub target_depth: u32,
    pub timeout: Duration,
    pub model_rating: u32,
    pub model_threshold: f32,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        TrainerConfig::default().analysis_settings()
    }
}

/// Fixed delays used by the session controller.
#[derive(Clone, Copy, Debug)]
pub struct DrillTiming {
    pub opponent_delay: Duration,
    pub completion_delay: Duration,
}

impl Default for DrillTiming {
    fn default() -> Self {
        TrainerConfig::default().timing()
    }
}
