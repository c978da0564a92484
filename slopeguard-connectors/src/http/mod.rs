//! HTTP Intake Adapter
//!
//! ## Routes
//!
//! | Route                         | Body                       | Success |
//! |-------------------------------|----------------------------|---------|
//! | `POST /sensor-reading`        | one candidate record       | `201`   |
//! | `POST /sensor-readings/batch` | `{"readings": [...]}`      | `200`   |
//! | `POST /upload`                | multipart, CSV or JSON     | `200`   |
//! | `POST /upload/csv`            | multipart, CSV only        | `200`   |
//! | `POST /upload/json`           | multipart, JSON only       | `200`   |
//! | `GET  /stats`                 |                            | `200`   |
//!
//! A single record failing validation answers `400` with the validator's
//! `errors`, `warnings` and `qualityScore`. Batches and uploads always answer
//! with the accepted subset published and the rejected records listed by
//! input index; only request-level problems fail them outright:
//!
//! - more than `max_batch_size` readings: `413`, nothing validated
//! - a file with a disallowed extension or content type: `415`
//! - a file over `max_file_size`: `413`
//!
//! Every request is timed into the stats aggregator, under `http` for single
//! records and `batch` for batches and uploads.

mod upload;

use std::ffi::OsStr;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info_span, warn, Instrument};

use slopeguard_core::constants::{DEFAULT_MAX_BATCH_SIZE, DEFAULT_MAX_FILE_SIZE};
use slopeguard_core::{DataQualityMetrics, Source, StatsSummary, ValidationResult};

use crate::bus::BatchResult;
use crate::{ConnectorError, ConnectorResult, IngestContext};

pub use upload::{parse_csv, parse_json, UploadFormat, MEASUREMENT_PREFIX};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    pub max_batch_size: usize,
    /// Per uploaded file, in bytes
    pub max_file_size: usize,
    /// Whole request body, in bytes
    pub max_request_bytes: usize,
    pub allowed_extensions: Vec<String>,
    pub allowed_content_types: Vec<String>,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_request_bytes: 32 * 1024 * 1024,
            allowed_extensions: vec!["csv".into(), "json".into()],
            allowed_content_types: [
                "text/csv",
                "application/csv",
                "application/vnd.ms-excel",
                "text/plain",
                "application/json",
                "application/octet-stream",
            ]
            .iter()
            .map(|ct| ct.to_string())
            .collect(),
        }
    }
}

impl IntakeConfig {
    pub fn validate(&self) -> ConnectorResult<()> {
        if self.max_batch_size == 0 {
            return Err(ConnectorError::Config("intake.max_batch_size must be positive".into()));
        }
        if self.max_file_size == 0 {
            return Err(ConnectorError::Config("intake.max_file_size must be positive".into()));
        }
        if self.max_request_bytes < self.max_file_size {
            return Err(ConnectorError::Config(
                "intake.max_request_bytes must be at least max_file_size".into(),
            ));
        }
        if self.allowed_extensions.is_empty() {
            return Err(ConnectorError::Config("intake.allowed_extensions is empty".into()));
        }
        Ok(())
    }

    /// Format of an uploaded file, if its name and content type are allowed
    pub fn check_file(
        &self,
        name: &str,
        content_type: Option<&str>,
        only: Option<UploadFormat>,
    ) -> ConnectorResult<UploadFormat> {
        let extension = Path::new(name)
            .extension()
            .and_then(OsStr::to_str)
            .unwrap_or("");

        let format = UploadFormat::from_extension(extension)
            .filter(|_| {
                self.allowed_extensions
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(extension))
            })
            .filter(|format| only.map_or(true, |only| only == *format))
            .ok_or_else(|| {
                ConnectorError::UnsupportedFile(format!("{}: file type not accepted here", name))
            })?;

        if let Some(content_type) = content_type {
            let essence = content_type.split(';').next().unwrap_or(content_type).trim();
            let allowed = self
                .allowed_content_types
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(essence));
            if !allowed {
                return Err(ConnectorError::UnsupportedFile(format!(
                    "{}: content type {} not accepted",
                    name, essence
                )));
            }
        }

        Ok(format)
    }
}

#[derive(Clone)]
struct IntakeState {
    ctx: IngestContext,
    config: Arc<IntakeConfig>,
}

/// Intake routes over the shared services
pub fn routes(ctx: IngestContext, config: IntakeConfig) -> Router {
    let body_limit = config.max_request_bytes;
    let state = IntakeState {
        ctx,
        config: Arc::new(config),
    };

    Router::new()
        .route("/sensor-reading", post(single))
        .route("/sensor-readings/batch", post(batch))
        .route("/upload", post(upload_any))
        .route("/upload/csv", post(upload_csv))
        .route("/upload/json", post(upload_json))
        .route("/stats", get(stats))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Counts recorded for one request
#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    received: u64,
    processed: u64,
    metrics: DataQualityMetrics,
}

impl Tally {
    fn failed(received: u64) -> Self {
        Self {
            received,
            ..Self::default()
        }
    }
}

type Handled = (Tally, ConnectorResult<(StatusCode, Value)>);

async fn timed<F>(ctx: &IngestContext, source: Source, route: &'static str, work: F) -> Response
where
    F: Future<Output = Handled>,
{
    let span = info_span!("http_intake", route, source = %source);
    async {
        let timer = ctx.stats.start(source);
        let (tally, outcome) = work.await;
        ctx.stats.record(timer.finish(
            tally.received,
            tally.processed,
            tally.received.saturating_sub(tally.processed),
            tally.metrics,
        ));

        match outcome {
            Ok((status, body)) => (status, Json(body)).into_response(),
            Err(err) => {
                debug!(error = %err, "request failed");
                err.into_response()
            }
        }
    }
    .instrument(span)
    .await
}

async fn single(State(state): State<IntakeState>, body: Bytes) -> Response {
    timed(&state.ctx, Source::Http, "single", submit_single(&state.ctx, &body)).await
}

async fn submit_single(ctx: &IngestContext, body: &[u8]) -> Handled {
    let mut raw: Value = match serde_json::from_slice(body) {
        Ok(raw) => raw,
        Err(err) => return (Tally::failed(1), Err(err.into())),
    };

    if let Value::Object(map) = &mut raw {
        if map.get("timestamp").map_or(true, Value::is_null) {
            map.insert("timestamp".into(), Value::String(ctx.validator.now().to_rfc3339()));
        }
    }

    let mut validated = ctx.validator.validate_batch(std::slice::from_ref(&raw));
    let mut tally = Tally {
        received: 1,
        processed: 0,
        metrics: validated.metrics,
    };

    let Some(accepted) = validated.valid.pop() else {
        let result = validated
            .invalid
            .pop()
            .map(|invalid| invalid.result)
            .unwrap_or_else(|| ValidationResult::rejected("record was not scored"));
        return (
            tally,
            Ok((
                StatusCode::BAD_REQUEST,
                json!({
                    "success": false,
                    "errors": result.errors,
                    "warnings": result.warnings,
                    "qualityScore": result.quality_score,
                }),
            )),
        );
    };

    if let Err(err) = ctx
        .publisher
        .publish_reading(&accepted.reading, accepted.quality_score, Source::Http)
        .await
    {
        warn!(sensor_id = %accepted.reading.sensor_id, error = %err, "publish failed");
        return (tally, Err(err));
    }
    tally.processed = 1;

    (
        tally,
        Ok((
            StatusCode::CREATED,
            json!({
                "success": true,
                "sensorId": accepted.reading.sensor_id,
                "qualityScore": accepted.quality_score,
                "warnings": accepted.warnings,
            }),
        )),
    )
}

#[derive(Deserialize)]
struct BatchRequest {
    readings: Vec<Value>,
}

async fn batch(State(state): State<IntakeState>, body: Bytes) -> Response {
    let work = async {
        let request: BatchRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(err) => return (Tally::failed(1), Err(err.into())),
        };

        let size = request.readings.len();
        let max = state.config.max_batch_size;
        if size > max {
            return (
                Tally::failed(size as u64),
                Err(ConnectorError::BatchTooLarge { size, max }),
            );
        }

        ingest_batch(&state.ctx, &request.readings).await
    };
    timed(&state.ctx, Source::Batch, "batch", work).await
}

/// Validate, publish the accepted subset in one transaction, then report
async fn ingest_batch(ctx: &IngestContext, records: &[Value]) -> Handled {
    let validated = ctx.validator.validate_batch(records);
    let mut tally = Tally {
        received: records.len() as u64,
        processed: 0,
        metrics: validated.metrics,
    };

    if let Err(err) = ctx
        .publisher
        .publish_readings(&validated.valid, Source::Batch)
        .await
    {
        warn!(records = validated.valid.len(), error = %err, "batch publish failed");
        return (tally, Err(err));
    }
    tally.processed = validated.valid.len() as u64;

    let result = BatchResult::new(Source::Batch, validated.metrics, ctx.validator.now());
    if let Err(err) = ctx.publisher.publish_batch_result(&result).await {
        warn!(batch_id = %result.batch_id, error = %err, "batch result not published");
    }
    if let Err(err) = ctx
        .publisher
        .publish_quality_metrics(Source::Batch, &validated.metrics)
        .await
    {
        warn!(batch_id = %result.batch_id, error = %err, "quality metrics not published");
    }

    let errors: Vec<Value> = validated
        .invalid
        .iter()
        .map(|invalid| {
            json!({
                "index": invalid.index,
                "sensorId": invalid.raw.get("sensor_id"),
                "errors": invalid.result.errors,
                "warnings": invalid.result.warnings,
            })
        })
        .collect();

    (
        tally,
        Ok((
            StatusCode::OK,
            json!({
                "success": true,
                "batchId": result.batch_id,
                "validCount": validated.valid.len(),
                "invalidCount": validated.invalid.len(),
                "metrics": validated.metrics,
                "errors": errors,
            }),
        )),
    )
}

async fn upload_any(
    State(state): State<IntakeState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    upload(&state, None, "upload", multipart).await
}

async fn upload_csv(
    State(state): State<IntakeState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    upload(&state, Some(UploadFormat::Csv), "upload_csv", multipart).await
}

async fn upload_json(
    State(state): State<IntakeState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    upload(&state, Some(UploadFormat::Json), "upload_json", multipart).await
}

async fn upload(
    state: &IntakeState,
    only: Option<UploadFormat>,
    route: &'static str,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let work = async {
        let records = match collect_files(&state.config, only, multipart).await {
            Ok(records) => records,
            Err(err) => return (Tally::failed(1), Err(err)),
        };

        // parsed files share the batch bound
        let size = records.len();
        let max = state.config.max_batch_size;
        if size > max {
            return (
                Tally::failed(size as u64),
                Err(ConnectorError::BatchTooLarge { size, max }),
            );
        }

        ingest_batch(&state.ctx, &records).await
    };
    timed(&state.ctx, Source::Batch, route, work).await
}

/// Every record of every file part, in upload order
async fn collect_files(
    config: &IntakeConfig,
    only: Option<UploadFormat>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ConnectorResult<Vec<Value>> {
    let mut multipart = multipart.map_err(|e| ConnectorError::Malformed(e.body_text()))?;
    let mut records = Vec::new();
    let mut files = 0usize;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ConnectorError::Malformed(e.to_string()))?
    {
        let Some(name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let format = config.check_file(&name, field.content_type(), only)?;

        let bytes = field
            .bytes()
            .await
            .map_err(|e| ConnectorError::Malformed(format!("{}: {}", name, e)))?;
        if bytes.len() > config.max_file_size {
            return Err(ConnectorError::FileTooLarge {
                name,
                size: bytes.len(),
                max: config.max_file_size,
            });
        }

        let parsed = format.parse(&name, &bytes)?;
        debug!(file = %name, records = parsed.len(), "upload file parsed");
        records.extend(parsed);
        files += 1;
    }

    if files == 0 {
        return Err(ConnectorError::Malformed("upload carries no file".into()));
    }
    Ok(records)
}

async fn stats(State(state): State<IntakeState>) -> Json<StatsSummary> {
    Json(state.ctx.stats.summary())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_file_filters() {
        let config = IntakeConfig::default();

        assert_eq!(config.check_file("a.csv", Some("text/csv"), None).unwrap(), UploadFormat::Csv);
        assert_eq!(
            config
                .check_file("a.JSON", Some("application/json; charset=utf-8"), None)
                .unwrap(),
            UploadFormat::Json
        );
        assert_eq!(config.check_file("a.csv", None, Some(UploadFormat::Csv)).unwrap(), UploadFormat::Csv);

        for (name, ct, only) in [
            ("a.txt", None, None),
            ("noext", None, None),
            ("a.csv", Some("image/png"), None),
            ("a.json", None, Some(UploadFormat::Csv)),
        ] {
            assert!(
                matches!(config.check_file(name, ct, only), Err(ConnectorError::UnsupportedFile(_))),
                "{} accepted",
                name
            );
        }
    }

    #[test]
    fn test_check_file_respects_allow_list() {
        let config = IntakeConfig {
            allowed_extensions: vec!["json".into()],
            ..IntakeConfig::default()
        };
        assert!(config.check_file("a.csv", None, None).is_err());
        assert!(config.check_file("a.json", None, None).is_ok());
    }

    #[test]
    fn test_config_validate() {
        assert!(IntakeConfig::default().validate().is_ok());

        let zero_batch = IntakeConfig {
            max_batch_size: 0,
            ..IntakeConfig::default()
        };
        assert!(matches!(zero_batch.validate(), Err(ConnectorError::Config(_))));

        let tight_body = IntakeConfig {
            max_request_bytes: 10,
            ..IntakeConfig::default()
        };
        assert!(tight_body.validate().is_err());
    }
}
