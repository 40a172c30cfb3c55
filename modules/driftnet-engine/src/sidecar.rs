// Sidecar emission: one flat file per extraction in the pending directory,
// written atomically so downstream scanners never see a half-written file.

use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

use driftnet_common::{Extraction, Result, Source};

pub struct SidecarWriter {
    pending_dir: PathBuf,
}

impl SidecarWriter {
    pub fn new(pending_dir: impl Into<PathBuf>) -> Self {
        Self {
            pending_dir: pending_dir.into(),
        }
    }

    pub fn pending_dir(&self) -> &Path {
        &self.pending_dir
    }

    /// Write the sidecar for one extraction: header block, blank line, body.
    /// Lands under a `.tmp` name first, then renames into place.
    pub async fn write(
        &self,
        dossier_id: &str,
        source: &Source,
        extraction: &Extraction,
    ) -> Result<PathBuf> {
        let id = Uuid::now_v7();
        let destination = self.pending_dir.join(format!("{id}.txt"));
        let staging = self.pending_dir.join(format!("{id}.txt.tmp"));

        let body = format!(
            "id: {id}\n\
             source_id: {source_id}\n\
             dossier_id: {dossier_id}\n\
             source_url: {source_url}\n\
             source_type: {source_type}\n\
             title: {title}\n\
             extracted_at: {extracted_at}\n\
             content_hash: {content_hash}\n\
             \n\
             {text}",
            source_id = extraction.source_id,
            source_url = source.url,
            source_type = source.source_type,
            title = single_line(&extraction.title),
            extracted_at = extraction.created_at.to_rfc3339(),
            content_hash = extraction.content_hash,
            text = extraction.content,
        );

        tokio::fs::create_dir_all(&self.pending_dir).await?;
        tokio::fs::write(&staging, body).await?;
        tokio::fs::rename(&staging, &destination).await?;
        debug!(path = %destination.display(), "Sidecar written");
        Ok(destination)
    }
}

/// Header values must not break the line-oriented format.
fn single_line(s: &str) -> String {
    s.replace(['\r', '\n'], " ")
}
