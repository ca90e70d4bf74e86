/// Re-embed pipeline.
///
/// Lists every record with content, asks the embedding service for a fresh vector per record
/// and writes it back by id. A failure on one record (transport error, non-2xx status, bad
/// payload, failed update) is recorded in the [`RunReport`] and the run moves on to the next
/// record. Only missing configuration and store-level failures (connect, extension, listing)
/// abort the run.
///
/// Nothing marks a record as done, so re-running after a partial run simply recomputes and
/// overwrites every embedding.
use std::future::Future;

use futures::StreamExt;
use tracing::{debug, info, warn};

use embed_common::client::{EmbedApiClient, EmbedClientError};

use crate::error::AppError;
use crate::store::{RecordStore, StoredRecord};

/// Embedding service as seen by the pipeline.
#[allow(async_fn_in_trait)]
pub trait RemoteEmbedder {
    fn has_credential(&self) -> bool;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedClientError>;
}

impl RemoteEmbedder for EmbedApiClient {
    fn has_credential(&self) -> bool {
        EmbedApiClient::has_credential(self)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedClientError> {
        EmbedApiClient::embed(self, text).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transport-level failure (connect, timeout) calling the service.
    Request,
    /// The service answered with a non-success status.
    Status,
    /// Anything else: unreadable payload, empty vector, failed update.
    Unexpected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordFailure {
    pub id: i64,
    pub kind: FailureKind,
    pub status: Option<u16>,
    pub message: String,
}

/// Aggregate outcome of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    /// Records fetched (non-null content).
    pub seen: usize,
    pub succeeded: usize,
    /// Empty or blank content; the service was not called.
    pub skipped: usize,
    pub request_failed: usize,
    pub status_errors: usize,
    pub unexpected_errors: usize,
    pub failures: Vec<RecordFailure>,
}

impl RunReport {
    pub fn failed(&self) -> usize {
        self.request_failed + self.status_errors + self.unexpected_errors
    }

    pub fn is_clean(&self) -> bool {
        self.failed() == 0
    }

    fn record(&mut self, outcome: RecordOutcome) {
        self.seen += 1;
        match outcome {
            RecordOutcome::Updated => self.succeeded += 1,
            RecordOutcome::Skipped => self.skipped += 1,
            RecordOutcome::Failed(failure) => {
                match failure.kind {
                    FailureKind::Request => self.request_failed += 1,
                    FailureKind::Status => self.status_errors += 1,
                    FailureKind::Unexpected => self.unexpected_errors += 1,
                }
                self.failures.push(failure);
            }
        }
    }
}

enum RecordOutcome {
    Updated,
    Skipped,
    Failed(RecordFailure),
}

pub struct ReEmbedPipeline<E> {
    embedder: E,
    concurrency: usize,
}

impl<E: RemoteEmbedder> ReEmbedPipeline<E> {
    /// `concurrency` caps the records in flight at once; 1 processes them sequentially.
    pub fn new(embedder: E, concurrency: usize) -> Self {
        Self {
            embedder,
            concurrency: concurrency.max(1),
        }
    }

    /// Run one full pass.
    ///
    /// `connect` is only awaited once the credential check has passed, so a misconfigured
    /// run performs no store or network I/O. Once connected, the store is closed on every
    /// exit path.
    pub async fn run<S, F>(&self, connect: F) -> Result<RunReport, AppError>
    where
        S: RecordStore,
        F: Future<Output = Result<S, AppError>>,
    {
        if !self.embedder.has_credential() {
            return Err(AppError::Config(
                "EMBED_API_KEY is not set, refusing to start".to_string(),
            ));
        }

        let store = connect.await?;
        let result = self.process(&store).await;
        store.close().await;
        result
    }

    async fn process<S: RecordStore>(&self, store: &S) -> Result<RunReport, AppError> {
        store.ensure_vector_extension().await?;

        let records = store.fetch_candidates().await?;
        info!(
            count = records.len(),
            concurrency = self.concurrency,
            "found records to re-embed"
        );

        let mut report = RunReport::default();
        let mut outcomes = futures::stream::iter(records)
            .map(|record| self.process_record(store, record))
            .buffer_unordered(self.concurrency);
        while let Some(outcome) = outcomes.next().await {
            report.record(outcome);
        }

        info!(
            seen = report.seen,
            succeeded = report.succeeded,
            skipped = report.skipped,
            request_failed = report.request_failed,
            status_errors = report.status_errors,
            unexpected_errors = report.unexpected_errors,
            "re-embed pass finished"
        );
        Ok(report)
    }

    async fn process_record<S: RecordStore>(
        &self,
        store: &S,
        record: StoredRecord,
    ) -> RecordOutcome {
        let id = record.id;
        let Some(content) = record.content.filter(|c| !c.trim().is_empty()) else {
            info!(id, "skipping record with empty content");
            return RecordOutcome::Skipped;
        };

        let embedding = match self.embedder.embed(&content).await {
            Ok(embedding) => embedding,
            Err(EmbedClientError::Request(e)) => {
                warn!(id, error = %e, "embedding request failed");
                return failure(id, FailureKind::Request, None, e.to_string());
            }
            Err(EmbedClientError::Status { status, body }) => {
                warn!(id, status = status.as_u16(), body = %body, "embedding service returned an error");
                return failure(id, FailureKind::Status, Some(status.as_u16()), body);
            }
            Err(e) => {
                warn!(id, error = %e, "unexpected error while embedding");
                return failure(id, FailureKind::Unexpected, None, e.to_string());
            }
        };

        if embedding.is_empty() {
            warn!(id, "embedding service returned an empty vector");
            return failure(
                id,
                FailureKind::Unexpected,
                None,
                "empty embedding".to_string(),
            );
        }

        if let Err(e) = store.update_embedding(id, &embedding).await {
            warn!(id, error = %e, "failed to store embedding");
            return failure(id, FailureKind::Unexpected, None, e.to_string());
        }

        debug!(id, dimension = embedding.len(), "embedding written");
        info!(id, "re-embedded record");
        RecordOutcome::Updated
    }
}

fn failure(id: i64, kind: FailureKind, status: Option<u16>, message: String) -> RecordOutcome {
    RecordOutcome::Failed(RecordFailure {
        id,
        kind,
        status,
        message,
    })
}
