//! HTTP client for the human-move model service.
//!
//! One service answers both questions the trainer asks of it: the move
//! distribution at a given strength (`POST /analyze`) and a sampled opponent
//! reply (`POST /move`).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engines::{
    MoveProbabilityModel, OpponentMoveRequest, OpponentService, PositionPolicy, ProbabilityBatch,
};
use crate::error::TrainerError;

#[derive(Clone)]
pub struct MaiaClient {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
struct AnalyzeBody<'a> {
    positions: &'a [String],
    ratings: &'a [u32],
    thresholds: &'a [f32],
}

#[derive(Deserialize)]
struct MoveResponse {
    top_move: Option<String>,
}

impl MaiaClient {
    pub fn new(base_url: &str) -> Result<Self, TrainerError> {
        let client = Client::builder()
            .user_agent("OpeningDrills/1.0")
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl MoveProbabilityModel for MaiaClient {
    async fn evaluate_batch(
        &self,
        fens: &[String],
        ratings: &[u32],
        thresholds: &[f32],
    ) -> Result<ProbabilityBatch, TrainerError> {
        let resp = self
            .client
            .post(self.url("/analyze"))
            .json(&AnalyzeBody {
                positions: fens,
                ratings,
                thresholds,
            })
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(TrainerError::MoveService(format!("analyze HTTP {}", resp.status())));
        }

        let mut batch: ProbabilityBatch = resp.json().await?;
        for policy in &mut batch.results {
            sort_policy(policy);
        }
        debug!(positions = fens.len(), elapsed_ms = batch.elapsed_ms, "Model batch evaluated");
        Ok(batch)
    }
}

#[async_trait]
impl OpponentService for MaiaClient {
    async fn request_move(&self, request: &OpponentMoveRequest) -> Result<Option<String>, TrainerError> {
        let resp = self.client.post(self.url("/move")).json(request).send().await?;

        if !resp.status().is_success() {
            return Err(TrainerError::MoveService(format!("move HTTP {}", resp.status())));
        }

        let body: MoveResponse = resp.json().await?;
        Ok(body.top_move.filter(|m| !m.is_empty()))
    }
}

fn sort_policy(policy: &mut PositionPolicy) {
    policy
        .moves
        .sort_by(|a, b| b.probability.total_cmp(&a.probability));
}
