//! Background position analysis.
//!
//! Each position gets one bounded search from the engine and one policy from
//! the human-move model. The two run side by side and fail independently;
//! whatever arrived is cached under the position fingerprint.

use std::sync::Arc;
use std::time::Duration;

use chess_core::rules;
use futures::StreamExt;
use tokio::runtime::Handle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::cache::{AnalysisCache, AnalysisEntry, InFlightGuard, SearchEval};
use crate::config::AnalysisSettings;
use crate::engines::{MoveProbabilityModel, PositionPolicy, SearchEngine, SearchInfo};

/// Extra time `fetch` allows an in-flight run to finish before giving up.
const FETCH_GRACE: Duration = Duration::from_millis(1000);

#[derive(Clone)]
pub struct BackgroundAnalyzer {
    cache: Arc<AnalysisCache>,
    search: Arc<dyn SearchEngine>,
    model: Arc<dyn MoveProbabilityModel>,
    settings: AnalysisSettings,
    runtime: Handle,
}

impl BackgroundAnalyzer {
    /// Must be called inside a Tokio runtime. Background work is spawned on
    /// that runtime, so later calls may come from any thread.
    pub fn new(
        cache: Arc<AnalysisCache>,
        search: Arc<dyn SearchEngine>,
        model: Arc<dyn MoveProbabilityModel>,
        settings: AnalysisSettings,
    ) -> Self {
        Self {
            cache,
            search,
            model,
            settings,
            runtime: Handle::current(),
        }
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn cache(&self) -> &Arc<AnalysisCache> {
        &self.cache
    }

    pub fn settings(&self) -> AnalysisSettings {
        self.settings
    }

    /// Queue analysis of `fen` without waiting for it.
    ///
    /// Returns `false` when nothing was started: the position is terminal,
    /// already cached, or already being analyzed.
    pub fn spawn_analysis(&self, fen: &str, label: Option<String>) -> bool {
        if !rules::has_legal_moves(fen) {
            debug!(fen = %fen, "Terminal position, skipping analysis");
            return false;
        }
        let fingerprint = rules::fingerprint(fen);
        let Some(guard) = self.cache.try_begin(&fingerprint, label) else {
            return false;
        };

        let analyzer = self.clone();
        let fen = fen.to_string();
        self.runtime.spawn(async move {
            analyzer.run(&fen, guard).await;
        });
        true
    }

    /// Analysis for `fen`, waiting for it if needed.
    ///
    /// Serves the cache first, then waits on a run already in flight, and
    /// only starts its own run when nobody else is working on the position.
    /// `None` means no data could be obtained within the budget.
    pub async fn fetch(&self, fen: &str) -> Option<AnalysisEntry> {
        let fingerprint = rules::fingerprint(fen);
        let mut finished = self.cache.subscribe();
        let deadline = Instant::now() + self.settings.timeout + FETCH_GRACE;

        loop {
            if let Some(entry) = self.cache.get(&fingerprint) {
                return Some(entry);
            }
            if !rules::has_legal_moves(fen) {
                return None;
            }
            if let Some(guard) = self.cache.try_begin(&fingerprint, None) {
                let entry = self.run(fen, guard).await;
                return (!entry.is_empty()).then_some(entry);
            }

            match timeout_at(deadline, finished.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => {
                    debug!(fen = %fen, "Gave up waiting for in-flight analysis");
                    return self.cache.get(&fingerprint);
                }
            }
        }
    }

    async fn run(&self, fen: &str, guard: InFlightGuard) -> AnalysisEntry {
        let started = Instant::now();
        let (search, policy) = tokio::join!(self.deepest_search(fen), self.model_policy(fen));
        let entry = AnalysisEntry::new(search, policy);

        // Empty results stay uncached so a later request can retry.
        if !entry.is_empty() {
            self.cache.store(guard.fingerprint(), entry.clone());
        }
        debug!(
            fen = %fen,
            depth = entry.search.as_ref().map(|s| s.depth),
            has_policy = entry.policy.is_some(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Position analyzed"
        );
        entry
    }

    /// Consume the engine's stream until the target depth or the deadline.
    async fn deepest_search(&self, fen: &str) -> Option<SearchEval> {
        let deadline = Instant::now() + self.settings.timeout;

        let mut stream = match timeout_at(deadline, self.search.evaluation_stream(fen, move_hint(fen))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(fen = %fen, error = %e, "Search engine unavailable");
                return None;
            }
            Err(_) => {
                warn!(fen = %fen, "Search engine did not start in time");
                return None;
            }
        };

        let mut deepest: Option<SearchInfo> = None;
        loop {
            match timeout_at(deadline, stream.next()).await {
                Ok(Some(Ok(info))) => {
                    let reached = info.depth >= self.settings.target_depth;
                    if deepest.as_ref().map_or(true, |d| info.depth >= d.depth) {
                        deepest = Some(info);
                    }
                    if reached {
                        break;
                    }
                }
                Ok(Some(Err(e))) => {
                    warn!(fen = %fen, error = %e, "Search failed mid-stream");
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(
                        fen = %fen,
                        depth = deepest.as_ref().map(|d| d.depth),
                        "Search budget exhausted"
                    );
                    break;
                }
            }
        }

        deepest.map(SearchEval::from)
    }

    /// Single-position policy from the model, within the same budget as the search.
    async fn model_policy(&self, fen: &str) -> Option<PositionPolicy> {
        let deadline = Instant::now() + self.settings.timeout;
        let fens = [fen.to_string()];
        let ratings = [self.settings.model_rating];
        let thresholds = [self.settings.model_threshold];
        let request = self.model.evaluate_batch(&fens, &ratings, &thresholds);

        match timeout_at(deadline, request).await {
            Ok(Ok(batch)) => batch.results.into_iter().next(),
            Ok(Err(e)) => {
                warn!(fen = %fen, error = %e, "Move-probability model unavailable");
                None
            }
            Err(_) => {
                warn!(fen = %fen, "Move-probability model did not answer in time");
                None
            }
        }
    }
}

/// Full-move number from the FEN, used as the engine's move-count hint.
fn move_hint(fen: &str) -> usize {
    fen.split_whitespace()
        .nth(5)
        .and_then(|n| n.parse().ok())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::{MoveProbability, ProbabilityBatch, SearchStream};
    use crate::error::TrainerError;
    use async_trait::async_trait;
    use chess_core::STANDARD_START_FEN;

    /// Emits depths 1..=max immediately, then optionally hangs.
    struct DepthSearch {
        max: u32,
        hang: bool,
    }

    #[async_trait]
    impl SearchEngine for DepthSearch {
        async fn evaluation_stream(&self, _fen: &str, _hint: usize) -> Result<SearchStream, TrainerError> {
            let infos = (1..=self.max).map(|depth| {
                Ok(SearchInfo {
                    depth,
                    cp: Some(depth as i32),
                    mate: None,
                    best_move: Some("e2e4".into()),
                    pv: vec!["e2e4".into()],
                })
            });
            let head = futures::stream::iter(infos);
            Ok(if self.hang {
                head.chain(futures::stream::pending()).boxed()
            } else {
                head.boxed()
            })
        }
    }

    struct BrokenSearch;

    #[async_trait]
    impl SearchEngine for BrokenSearch {
        async fn evaluation_stream(&self, _fen: &str, _hint: usize) -> Result<SearchStream, TrainerError> {
            Err(TrainerError::Stockfish("not running".into()))
        }
    }

    struct FixedModel;

    #[async_trait]
    impl MoveProbabilityModel for FixedModel {
        async fn evaluate_batch(
            &self,
            fens: &[String],
            ratings: &[u32],
            _thresholds: &[f32],
        ) -> Result<ProbabilityBatch, TrainerError> {
            Ok(ProbabilityBatch {
                results: vec![PositionPolicy {
                    fen: fens[0].clone(),
                    rating: ratings[0],
                    moves: vec![MoveProbability { uci: "e2e4".into(), probability: 0.5 }],
                }],
                elapsed_ms: 3,
            })
        }
    }

    struct BrokenModel;

    #[async_trait]
    impl MoveProbabilityModel for BrokenModel {
        async fn evaluate_batch(&self, _: &[String], _: &[u32], _: &[f32]) -> Result<ProbabilityBatch, TrainerError> {
            Err(TrainerError::MoveService("offline".into()))
        }
    }

    struct SilentModel;

    #[async_trait]
    impl MoveProbabilityModel for SilentModel {
        async fn evaluate_batch(&self, _: &[String], _: &[u32], _: &[f32]) -> Result<ProbabilityBatch, TrainerError> {
            futures::future::pending::<Result<ProbabilityBatch, TrainerError>>().await
        }
    }

    fn analyzer(search: impl SearchEngine + 'static, model: impl MoveProbabilityModel + 'static) -> BackgroundAnalyzer {
        BackgroundAnalyzer::new(
            Arc::new(AnalysisCache::new()),
            Arc::new(search),
            Arc::new(model),
            AnalysisSettings::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_at_target_depth() {
        let analyzer = analyzer(DepthSearch { max: 30, hang: false }, FixedModel);
        let entry = analyzer.fetch(STANDARD_START_FEN).await.unwrap();
        assert_eq!(entry.search.unwrap().depth, 15);
        assert_eq!(entry.policy.unwrap().rating, 1500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_deepest_result() {
        let analyzer = analyzer(DepthSearch { max: 9, hang: true }, FixedModel);
        let started = Instant::now();
        let entry = analyzer.fetch(STANDARD_START_FEN).await.unwrap();
        assert_eq!(entry.search.unwrap().depth, 9);
        assert!(started.elapsed() >= Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_model_is_cut_off() {
        let analyzer = analyzer(DepthSearch { max: 30, hang: false }, SilentModel);
        let started = Instant::now();
        let entry = tokio::time::timeout(Duration::from_secs(60), analyzer.fetch(STANDARD_START_FEN))
            .await
            .expect("fetch is bounded")
            .unwrap();
        assert_eq!(entry.search.unwrap().depth, 15);
        assert!(entry.policy.is_none());
        assert!(started.elapsed() <= Duration::from_millis(5000));
        assert!(!analyzer.cache().is_in_flight(&rules::fingerprint(STANDARD_START_FEN)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_results_are_cached() {
        let analyzer = analyzer(BrokenSearch, FixedModel);
        let entry = analyzer.fetch(STANDARD_START_FEN).await.unwrap();
        assert!(entry.search.is_none());
        assert!(entry.policy.is_some());
        assert_eq!(analyzer.cache().len(), 1);
        assert!(!analyzer.cache().is_in_flight(&rules::fingerprint(STANDARD_START_FEN)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_failure_releases_and_caches_nothing() {
        let analyzer = analyzer(BrokenSearch, BrokenModel);
        assert!(analyzer.fetch(STANDARD_START_FEN).await.is_none());
        assert!(analyzer.cache().is_empty());
        assert!(analyzer.cache().should_analyze(&rules::fingerprint(STANDARD_START_FEN)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_position_is_skipped() {
        let mated = "rnb1kbnr/pppp1ppp/8/4p3/6Pq/5P2/PPPPP2P/RNBQKBNR w KQkq - 1 3";
        let analyzer = analyzer(DepthSearch { max: 30, hang: false }, FixedModel);
        assert!(!analyzer.spawn_analysis(mated, None));
        assert_eq!(analyzer.cache().progress().requested, 0);
    }

    #[test]
    fn test_move_hint() {
        assert_eq!(move_hint(STANDARD_START_FEN), 1);
        assert_eq!(move_hint("8/8/8/8/8/8/8/8 w - - 0 23"), 23);
    }
}
