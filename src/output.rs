//! Data carried between pipeline stages and returned to the caller.

use crate::error::UnitFailure;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One scene slated for one image-generation call.
///
/// `index` is 0-based and defines output ordering everywhere: outcomes,
/// archive members, and reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub index: usize,
    pub source_text: String,
    pub prompt: String,
}

/// Binary image returned by a provider.
///
/// Bytes are reference-counted so the archive writer and the outcome list
/// share one copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub bytes: Arc<[u8]>,
    /// MIME type declared by the provider, if any.
    pub mime_type: Option<String>,
}

impl ImagePayload {
    pub fn new(bytes: impl Into<Vec<u8>>, mime_type: Option<String>) -> Self {
        Self {
            bytes: Arc::from(bytes.into()),
            mime_type,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// File extension matching the payload's actual content.
    ///
    /// Magic bytes win over the declared MIME type; providers have been seen
    /// labelling WebP as PNG.
    pub fn extension(&self) -> &'static str {
        if let Ok(format) = image::guess_format(&self.bytes) {
            if let Some(ext) = format.extensions_str().first() {
                return *ext;
            }
        }
        self.mime_type
            .as_deref()
            .and_then(image::ImageFormat::from_mime_type)
            .and_then(|f| f.extensions_str().first().copied())
            .unwrap_or("bin")
    }
}

/// Terminal state of one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeStatus {
    Success(ImagePayload),
    Failed(UnitFailure),
}

/// Result of running one [`WorkUnit`] through the job runner.
///
/// Produced exactly once per submitted unit. `attempts_used` is always in
/// `1..=max_retries + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutcome {
    pub unit_index: usize,
    pub attempts_used: u32,
    pub status: OutcomeStatus,
    /// Wall-clock time from the unit's first gate wait to its terminal state.
    pub duration_ms: u64,
}

impl GenerationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, OutcomeStatus::Success(_))
    }

    pub fn payload(&self) -> Option<&ImagePayload> {
        match &self.status {
            OutcomeStatus::Success(p) => Some(p),
            OutcomeStatus::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&UnitFailure> {
        match &self.status {
            OutcomeStatus::Success(_) => None,
            OutcomeStatus::Failed(f) => Some(f),
        }
    }
}

/// Serialisable per-unit metadata for a caller-facing report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitReport {
    pub index: usize,
    pub source_text: String,
    pub prompt: String,
    pub status: UnitStatus,
    /// 0 when the unit was never submitted.
    pub attempts: u32,
    /// Archive member name for successful units.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<UnitFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Success,
    Failed,
    /// Never submitted because the run was cancelled first.
    Skipped,
}

/// Timing and count statistics for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub total_units: usize,
    pub success_count: usize,
    pub failure_count: usize,
    /// Units never submitted because the run was cancelled.
    pub skipped_count: usize,
    /// Provider submissions across all units.
    pub total_attempts: u32,
    /// Throttling responses observed across the batch.
    pub throttle_events: u32,
    pub cancelled: bool,
    pub segment_duration_ms: u64,
    pub generation_duration_ms: u64,
    pub archive_duration_ms: u64,
    pub total_duration_ms: u64,
}

/// Terminal value of a successful (possibly partial) run.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    /// The work units in index order.
    pub units: Vec<WorkUnit>,
    /// Outcomes of every submitted unit, ordered by `unit_index`.
    pub outcomes: Vec<GenerationOutcome>,
    /// Zip archive of every successful image.
    pub archive: Vec<u8>,
    pub stats: RunStats,
}

impl PipelineResult {
    pub fn success_count(&self) -> usize {
        self.stats.success_count
    }

    pub fn failure_count(&self) -> usize {
        self.stats.failure_count
    }

    pub fn is_partial(&self) -> bool {
        self.stats.success_count < self.stats.total_units
    }

    /// Per-unit metadata in index order, including units never submitted.
    pub fn reports(&self) -> Vec<UnitReport> {
        unit_reports(&self.units, &self.outcomes)
    }

    /// Package the archive and metadata for a caller.
    pub fn into_response(self) -> ArchiveResponse {
        let units = self.reports();
        ArchiveResponse {
            body: self.archive,
            content_type: crate::pipeline::archive::ARCHIVE_CONTENT_TYPE,
            filename: crate::pipeline::archive::ARCHIVE_FILENAME,
            success_count: self.stats.success_count,
            failure_count: self.stats.failure_count,
            units,
        }
    }
}

/// `outcomes` must be sorted by `unit_index`, as the runner returns them.
pub(crate) fn unit_reports(units: &[WorkUnit], outcomes: &[GenerationOutcome]) -> Vec<UnitReport> {
    units
        .iter()
        .map(|unit| {
            let outcome = outcomes
                .binary_search_by_key(&unit.index, |o| o.unit_index)
                .ok()
                .map(|i| &outcomes[i]);
            let (status, attempts, member, bytes, failure) = match outcome {
                Some(o) => match &o.status {
                    OutcomeStatus::Success(p) => (
                        UnitStatus::Success,
                        o.attempts_used,
                        Some(crate::pipeline::archive::member_name(unit.index, p)),
                        Some(p.len()),
                        None,
                    ),
                    OutcomeStatus::Failed(f) => {
                        (UnitStatus::Failed, o.attempts_used, None, None, Some(f.clone()))
                    }
                },
                None => (UnitStatus::Skipped, 0, None, None, None),
            };
            UnitReport {
                index: unit.index,
                source_text: unit.source_text.clone(),
                prompt: unit.prompt.clone(),
                status,
                attempts,
                member,
                bytes,
                failure,
            }
        })
        .collect()
}

/// A caller-facing archive response: body, headers, and per-unit metadata.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveResponse {
    #[serde(skip)]
    pub body: Vec<u8>,
    pub content_type: &'static str,
    pub filename: &'static str,
    pub success_count: usize,
    pub failure_count: usize,
    pub units: Vec<UnitReport>,
}

impl ArchiveResponse {
    /// `Content-Disposition` header value for the archive.
    pub fn content_disposition(&self) -> String {
        format!("attachment; filename=\"{}\"", self.filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;

    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";
    const JPEG_MAGIC: &[u8] = b"\xFF\xD8\xFF\xE0\0\x10JFIF\0";
    const WEBP_MAGIC: &[u8] = b"RIFF\0\0\0\0WEBPVP8 ";

    #[test]
    fn extension_follows_magic_bytes() {
        assert_eq!(ImagePayload::new(PNG_MAGIC, None).extension(), "png");
        assert_eq!(ImagePayload::new(JPEG_MAGIC, None).extension(), "jpg");
        assert_eq!(
            ImagePayload::new(WEBP_MAGIC, Some("image/png".into())).extension(),
            "webp"
        );
    }

    #[test]
    fn extension_falls_back_to_mime_then_bin() {
        assert_eq!(
            ImagePayload::new(b"????".to_vec(), Some("image/jpeg".into())).extension(),
            "jpg"
        );
        assert_eq!(ImagePayload::new(b"????".to_vec(), None).extension(), "bin");
    }

    #[test]
    fn reports_cover_skipped_units() {
        let units: Vec<WorkUnit> = (0..3)
            .map(|i| WorkUnit {
                index: i,
                source_text: format!("scene {i}"),
                prompt: format!("prompt {i}"),
            })
            .collect();
        let outcomes = vec![
            GenerationOutcome {
                unit_index: 0,
                attempts_used: 1,
                status: OutcomeStatus::Success(ImagePayload::new(PNG_MAGIC, None)),
                duration_ms: 5,
            },
            GenerationOutcome {
                unit_index: 1,
                attempts_used: 2,
                status: OutcomeStatus::Failed(UnitFailure::RetriesExhausted {
                    attempts: 2,
                    last_error: ProviderError::Throttled {
                        retry_after_ms: None,
                    },
                }),
                duration_ms: 5,
            },
        ];
        let reports = unit_reports(&units, &outcomes);
        assert_eq!(reports[0].status, UnitStatus::Success);
        assert_eq!(reports[0].member.as_deref(), Some("scene-1.png"));
        assert_eq!(reports[1].status, UnitStatus::Failed);
        assert_eq!(reports[1].attempts, 2);
        assert_eq!(reports[2].status, UnitStatus::Skipped);
        assert_eq!(reports[2].attempts, 0);
    }

    #[test]
    fn reports_match_outcomes_by_index_across_gaps() {
        let units: Vec<WorkUnit> = (0..4)
            .map(|i| WorkUnit {
                index: i,
                source_text: format!("scene {i}"),
                prompt: format!("prompt {i}"),
            })
            .collect();
        let outcomes: Vec<GenerationOutcome> = [0usize, 2]
            .into_iter()
            .map(|i| GenerationOutcome {
                unit_index: i,
                attempts_used: i as u32 + 1,
                status: OutcomeStatus::Success(ImagePayload::new(PNG_MAGIC, None)),
                duration_ms: 1,
            })
            .collect();

        let reports = unit_reports(&units, &outcomes);
        let statuses: Vec<UnitStatus> = reports.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                UnitStatus::Success,
                UnitStatus::Skipped,
                UnitStatus::Success,
                UnitStatus::Skipped
            ]
        );
        assert_eq!(reports[2].attempts, 3);
        assert_eq!(reports[2].member.as_deref(), Some("scene-3.png"));
    }
}
