//! Zip assembly for successful outcomes.
//!
//! Outcomes arrive in completion order; members must land in index order.
//! [`ArchiveAssembler`] buffers out-of-order outcomes and writes each
//! contiguous run as soon as the next expected index shows up, so a long
//! sequential batch never holds more than the out-of-order tail in memory
//! twice. Failed outcomes advance the cursor without writing a member.

use crate::error::StoryboardError;
use crate::output::{GenerationOutcome, ImagePayload, OutcomeStatus};
use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const ARCHIVE_CONTENT_TYPE: &str = "application/zip";
pub const ARCHIVE_FILENAME: &str = "storyboard.zip";
pub const MANIFEST_NAME: &str = "manifest.json";

/// Archive member name for the image of unit `index`: `scene-{n}.{ext}`
/// with `n` 1-based.
pub fn member_name(index: usize, payload: &ImagePayload) -> String {
    format!("scene-{}.{}", index + 1, payload.extension())
}

fn zip_error(e: impl std::fmt::Display) -> StoryboardError {
    StoryboardError::Archive(e.to_string())
}

/// Incremental, order-preserving zip writer.
pub struct ArchiveAssembler {
    writer: ZipWriter<Cursor<Vec<u8>>>,
    options: SimpleFileOptions,
    next_index: usize,
    pending: BTreeMap<usize, GenerationOutcome>,
    members: Vec<String>,
}

impl Default for ArchiveAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveAssembler {
    pub fn new() -> Self {
        Self {
            writer: ZipWriter::new(Cursor::new(Vec::new())),
            options: SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(9)),
            next_index: 0,
            pending: BTreeMap::new(),
            members: Vec::new(),
        }
    }

    /// Names of the image members written so far, in archive order.
    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// Accept one outcome. Each `unit_index` may be pushed once.
    pub fn push(&mut self, outcome: GenerationOutcome) -> Result<(), StoryboardError> {
        let index = outcome.unit_index;
        if index < self.next_index || self.pending.contains_key(&index) {
            return Err(StoryboardError::Internal(format!(
                "duplicate outcome for scene {}",
                index + 1
            )));
        }
        self.pending.insert(index, outcome);
        self.drain_ready()
    }

    fn drain_ready(&mut self) -> Result<(), StoryboardError> {
        while let Some(outcome) = self.pending.remove(&self.next_index) {
            self.write_outcome(&outcome)?;
            self.next_index += 1;
        }
        Ok(())
    }

    fn write_outcome(&mut self, outcome: &GenerationOutcome) -> Result<(), StoryboardError> {
        if let OutcomeStatus::Success(ref payload) = outcome.status {
            let name = member_name(outcome.unit_index, payload);
            self.writer
                .start_file(name.as_str(), self.options)
                .map_err(zip_error)?;
            self.writer.write_all(&payload.bytes).map_err(zip_error)?;
            debug!("Archived {} ({} bytes)", name, payload.len());
            self.members.push(name);
        }
        Ok(())
    }

    /// Flush any remaining outcomes in index order, append the manifest if
    /// given, and return the archive bytes.
    ///
    /// Gaps left by cancelled units are skipped. Fails with
    /// [`StoryboardError::EmptyArchive`] when no image was written.
    pub fn finish(mut self, manifest: Option<Vec<u8>>) -> Result<Vec<u8>, StoryboardError> {
        let rest = std::mem::take(&mut self.pending);
        for (_, outcome) in rest {
            self.write_outcome(&outcome)?;
        }
        if self.members.is_empty() {
            return Err(StoryboardError::EmptyArchive);
        }
        if let Some(bytes) = manifest {
            self.writer
                .start_file(MANIFEST_NAME, self.options)
                .map_err(zip_error)?;
            self.writer.write_all(&bytes).map_err(zip_error)?;
        }
        let cursor = self.writer.finish().map_err(zip_error)?;
        Ok(cursor.into_inner())
    }
}

/// Assemble a complete set of outcomes in one call, without a manifest.
pub fn assemble(outcomes: &[GenerationOutcome]) -> Result<Vec<u8>, StoryboardError> {
    let mut assembler = ArchiveAssembler::new();
    for outcome in outcomes {
        assembler.push(outcome.clone())?;
    }
    assembler.finish(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ProviderError, UnitFailure};
    use std::io::Read;
    use zip::ZipArchive;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDRfake";
    const JPEG: &[u8] = b"\xFF\xD8\xFF\xE0\0\x10JFIF\0fake";

    fn ok(index: usize, bytes: &[u8]) -> GenerationOutcome {
        GenerationOutcome {
            unit_index: index,
            attempts_used: 1,
            status: OutcomeStatus::Success(ImagePayload::new(bytes, None)),
            duration_ms: 0,
        }
    }

    fn failed(index: usize) -> GenerationOutcome {
        GenerationOutcome {
            unit_index: index,
            attempts_used: 4,
            status: OutcomeStatus::Failed(UnitFailure::RetriesExhausted {
                attempts: 4,
                last_error: ProviderError::Throttled {
                    retry_after_ms: None,
                },
            }),
            duration_ms: 0,
        }
    }

    fn names(bytes: Vec<u8>) -> Vec<String> {
        let mut zip = ZipArchive::new(Cursor::new(bytes)).unwrap();
        (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn out_of_order_pushes_land_in_index_order() {
        let mut a = ArchiveAssembler::new();
        a.push(ok(2, PNG)).unwrap();
        a.push(ok(1, JPEG)).unwrap();
        assert!(a.members().is_empty(), "index 0 not seen yet");
        a.push(ok(0, PNG)).unwrap();
        assert_eq!(a.members().len(), 3);
        let bytes = a.finish(None).unwrap();
        assert_eq!(names(bytes), vec!["scene-1.png", "scene-2.jpg", "scene-3.png"]);
    }

    #[test]
    fn failures_leave_gaps_in_numbering() {
        let bytes = assemble(&[ok(0, PNG), failed(1), ok(2, PNG)]).unwrap();
        assert_eq!(names(bytes), vec!["scene-1.png", "scene-3.png"]);
    }

    #[test]
    fn skipped_tail_is_flushed_on_finish() {
        let mut a = ArchiveAssembler::new();
        a.push(ok(0, PNG)).unwrap();
        a.push(ok(3, PNG)).unwrap();
        let bytes = a.finish(Some(b"{}".to_vec())).unwrap();
        assert_eq!(names(bytes), vec!["scene-1.png", "scene-4.png", "manifest.json"]);
    }

    #[test]
    fn member_bytes_are_unchanged() {
        let bytes = assemble(&[ok(0, PNG)]).unwrap();
        let mut zip = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut member = zip.by_index(0).unwrap();
        let mut out = Vec::new();
        member.read_to_end(&mut out).unwrap();
        assert_eq!(out, PNG);
    }

    #[test]
    fn no_successes_is_an_error() {
        let err = assemble(&[failed(0), failed(1)]).unwrap_err();
        assert!(matches!(err, StoryboardError::EmptyArchive));
        assert!(matches!(
            ArchiveAssembler::new().finish(Some(b"{}".to_vec())),
            Err(StoryboardError::EmptyArchive)
        ));
    }

    #[test]
    fn duplicate_index_is_rejected() {
        let mut a = ArchiveAssembler::new();
        a.push(ok(0, PNG)).unwrap();
        assert!(a.push(ok(0, PNG)).is_err());
        a.push(ok(2, PNG)).unwrap();
        assert!(a.push(ok(2, PNG)).is_err());
    }
}
