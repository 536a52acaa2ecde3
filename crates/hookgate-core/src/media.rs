//! Per-tenant file area: downloaded attachments and history-sync dumps.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use serde_json::Value;
use tracing::debug;

use crate::{
    domain::TenantId,
    engine::types::{MediaAttachment, MessageKind},
    utils::sanitize_file_stem,
    Result,
};

/// `<files_dir>/user_<id>`.
#[derive(Clone, Debug)]
pub struct TenantFiles {
    root: PathBuf,
}

impl TenantFiles {
    pub fn new(files_dir: &Path, tenant_id: TenantId) -> Self {
        Self {
            root: files_dir.join(format!("user_{}", tenant_id.0)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn ensure_root(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Write downloaded media as `<message id><ext>` and return its path.
    pub async fn save_attachment(
        &self,
        message_id: &str,
        media: &MediaAttachment,
        bytes: &[u8],
    ) -> Result<PathBuf> {
        self.ensure_root().await?;
        let name = format!(
            "{}{}",
            sanitize_file_stem(message_id),
            attachment_extension(media)
        );
        let path = self.root.join(name);
        tokio::fs::write(&path, bytes).await?;
        debug!(path = %path.display(), size = bytes.len(), "attachment saved");
        Ok(path)
    }

    /// Dump a history-sync payload as `history-<n>.json`.
    pub async fn save_history(&self, seq: u64, payload: &Value) -> Result<PathBuf> {
        self.ensure_root().await?;
        let path = self.root.join(format!("history-{seq}.json"));
        let body = serde_json::to_vec_pretty(payload)?;
        tokio::fs::write(&path, body).await?;
        Ok(path)
    }
}

/// Process-wide sequence for history-sync file names.
#[derive(Clone, Debug, Default)]
pub struct HistorySequence(Arc<AtomicU64>);

impl HistorySequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// File extension (with the leading dot) for an attachment.
pub fn attachment_extension(media: &MediaAttachment) -> String {
    if media.kind == MessageKind::Document {
        if let Some(ext) = media
            .file_name
            .as_deref()
            .and_then(|n| Path::new(n).extension())
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        {
            return format!(".{}", ext.to_ascii_lowercase());
        }
    }
    extension_for_mime(&media.mime_type)
}

pub fn extension_for_mime(mime: &str) -> String {
    let essence = mime
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let preferred = match essence.as_str() {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "audio/ogg" => Some("ogg"),
        "audio/mpeg" => Some("mp3"),
        "video/mp4" => Some("mp4"),
        "application/pdf" => Some("pdf"),
        _ => None,
    };
    let ext = preferred.or_else(|| {
        mime_guess::get_mime_extensions_str(&essence).and_then(|exts| exts.first().copied())
    });
    match ext {
        Some(ext) => format!(".{ext}"),
        None => ".bin".to_string(),
    }
}
