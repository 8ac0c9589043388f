//! Pipeline stage contract.
//!
//! Stages are external collaborators (splitting, rewriting, quiz and artifact
//! generation). The executor only knows the call contract below; the
//! production implementation forwards each call to the generation backend
//! over HTTP.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::TaskType;
use crate::{Error, Result};

/// One step of a generation plan.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Split,
    Enhance,
    Quiz,
    Flashcards,
    Images,
    Svg,
    PastPapers,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Split => "split",
            Self::Enhance => "enhance",
            Self::Quiz => "quiz",
            Self::Flashcards => "flashcards",
            Self::Images => "images",
            Self::Svg => "svg",
            Self::PastPapers => "past_papers",
        }
    }

    /// Human-readable label used in task messages.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Split => "Splitting source text",
            Self::Enhance => "Enhancing content",
            Self::Quiz => "Generating quiz",
            Self::Flashcards => "Generating flashcards",
            Self::Images => "Generating images",
            Self::Svg => "Generating SVG diagrams",
            Self::PastPapers => "Processing past papers",
        }
    }
}

/// Fixed stage order for a task type.
pub fn plan_for(task_type: TaskType) -> &'static [StageKind] {
    use StageKind::*;

    match task_type {
        TaskType::FullGeneration => &[Split, Enhance, Quiz, Flashcards, Images],
        TaskType::SvgOnly => &[Svg],
        TaskType::QuizOnly => &[Quiz],
        TaskType::FlashcardsOnly => &[Flashcards],
        TaskType::ImagesOnly => &[Images],
        TaskType::PastPapersOnly => &[PastPapers],
    }
}

/// Progress after `completed` of `total` stages, rounded down.
pub fn progress_after(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((completed.min(total) * 100) / total) as u8
}

/// Everything a stage is told about the job it runs for.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub task_id: String,
    pub resource_ref: String,
    pub task_type: TaskType,
    pub stage: StageKind,
    /// 1-based.
    pub attempt: u32,
    /// Cancelled when the task is cancelled or the pool shuts down. Stages may
    /// observe it; the executor itself only looks at stage boundaries.
    pub cancellation: CancellationToken,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

/// Stage failure classification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    /// Worth retrying: timeouts, unreachable backend, overload.
    #[error("transient: {0}")]
    Transient(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl StageError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Fatal(m) => m,
        }
    }

    /// Convert into the crate error once retries are settled.
    pub fn into_error(self, stage: StageKind, attempts: u32) -> Error {
        match self {
            Self::Transient(message) => Error::TransientStage {
                stage: stage.to_string(),
                attempts,
                message,
            },
            Self::Fatal(message) => Error::FatalStage {
                stage: stage.to_string(),
                message,
            },
        }
    }
}

/// A pipeline stage.
#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    async fn run(&self, ctx: &StageContext) -> std::result::Result<StageOutput, StageError>;
}

/// Stage implementations keyed by kind.
#[derive(Clone, Default)]
pub struct StageSet {
    stages: HashMap<StageKind, Arc<dyn Stage>>,
}

impl StageSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.register(stage);
        self
    }

    pub fn register(&mut self, stage: Arc<dyn Stage>) {
        self.stages.insert(stage.kind(), stage);
    }

    pub fn get(&self, kind: StageKind) -> Option<Arc<dyn Stage>> {
        self.stages.get(&kind).cloned()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// One [`HttpStage`] per stage kind, sharing a single client.
    pub fn http(backend_url: &str, connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to build generation backend client: {e}")))?;

        let mut set = Self::new();
        for kind in <StageKind as strum::IntoEnumIterator>::iter() {
            set.register(Arc::new(HttpStage::new(kind, client.clone(), backend_url)));
        }
        Ok(set)
    }
}

impl std::fmt::Debug for StageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.stages.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("StageSet").field("stages", &kinds).finish()
    }
}

#[derive(Debug, Serialize)]
struct StageRequest<'a> {
    task_id: &'a str,
    resource_ref: &'a str,
    task_type: TaskType,
    stage: StageKind,
    attempt: u32,
}

/// Runs a stage on the generation backend: `POST {backend_url}/{stage}`.
pub struct HttpStage {
    kind: StageKind,
    client: Client,
    endpoint: String,
}

impl HttpStage {
    pub fn new(kind: StageKind, client: Client, backend_url: &str) -> Self {
        let endpoint = format!("{}/{}", backend_url.trim_end_matches('/'), kind.as_str());
        Self {
            kind,
            client,
            endpoint,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Map an HTTP status to a stage failure; `None` means success.
fn classify_status(status: StatusCode, body: &str) -> Option<StageError> {
    if status.is_success() {
        return None;
    }
    let msg = if body.is_empty() {
        format!("backend returned {status}")
    } else {
        format!("backend returned {status}: {body}")
    };
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Some(StageError::Transient(msg))
    } else {
        Some(StageError::Fatal(msg))
    }
}

fn classify_request_error(err: &reqwest::Error) -> StageError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        StageError::transient(format!("backend unreachable: {err}"))
    } else {
        StageError::fatal(format!("backend request failed: {err}"))
    }
}

#[async_trait]
impl Stage for HttpStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn run(&self, ctx: &StageContext) -> std::result::Result<StageOutput, StageError> {
        let request = StageRequest {
            task_id: &ctx.task_id,
            resource_ref: &ctx.resource_ref,
            task_type: ctx.task_type,
            stage: self.kind,
            attempt: ctx.attempt,
        };

        debug!(task_id = %ctx.task_id, stage = %self.kind, endpoint = %self.endpoint, "Calling generation backend");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_request_error(&e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| classify_request_error(&e))?;

        if let Some(err) = classify_status(status, body.trim()) {
            return Err(err);
        }

        if body.trim().is_empty() {
            return Ok(StageOutput::default());
        }
        serde_json::from_str(&body)
            .map_err(|e| StageError::fatal(format!("malformed backend response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_generation_plan_order() {
        assert_eq!(
            plan_for(TaskType::FullGeneration),
            &[
                StageKind::Split,
                StageKind::Enhance,
                StageKind::Quiz,
                StageKind::Flashcards,
                StageKind::Images
            ]
        );
        assert_eq!(plan_for(TaskType::PastPapersOnly), &[StageKind::PastPapers]);
    }

    #[test]
    fn test_progress_rounds_down() {
        assert_eq!(progress_after(0, 5), 0);
        assert_eq!(progress_after(3, 5), 60);
        assert_eq!(progress_after(1, 3), 33);
        assert_eq!(progress_after(2, 3), 66);
        assert_eq!(progress_after(5, 5), 100);
        assert_eq!(progress_after(7, 5), 100);
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::OK, "").is_none());
        assert!(
            classify_status(StatusCode::BAD_GATEWAY, "")
                .unwrap()
                .is_transient()
        );
        assert!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down")
                .unwrap()
                .is_transient()
        );
        let fatal = classify_status(StatusCode::UNPROCESSABLE_ENTITY, "bad markdown").unwrap();
        assert!(!fatal.is_transient());
        assert!(fatal.message().contains("bad markdown"));
    }

    #[test]
    fn test_endpoint_joins_stage_name() {
        let stage = HttpStage::new(
            StageKind::PastPapers,
            Client::new(),
            "http://127.0.0.1:8700/generate/",
        );
        assert_eq!(stage.endpoint(), "http://127.0.0.1:8700/generate/past_papers");
    }

    #[test]
    fn test_http_set_covers_every_plan() {
        let set = StageSet::http("http://127.0.0.1:8700/generate", Duration::from_secs(1)).unwrap();
        for task_type in [
            TaskType::FullGeneration,
            TaskType::SvgOnly,
            TaskType::QuizOnly,
            TaskType::FlashcardsOnly,
            TaskType::ImagesOnly,
            TaskType::PastPapersOnly,
        ] {
            for kind in plan_for(task_type) {
                assert!(set.get(*kind).is_some(), "missing {kind}");
            }
        }
    }

    #[test]
    fn test_stage_error_conversion() {
        let err = StageError::transient("timeout").into_error(StageKind::Quiz, 4);
        assert!(matches!(err, Error::TransientStage { attempts: 4, .. }));
        assert_eq!(err.to_string(), "Stage quiz failed after 4 attempt(s): timeout");
    }
}
