use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use palimpsest_types::{AgentFindings, AgentRole, DamageHotspot};

/// Per-submission working record threaded through all five agents.
///
/// Scanner establishes the image-derived fields before the fan-out stage
/// reads them; fan-out agents write disjoint fields; the repair advisor
/// reads everything. Single-writer-per-field keeps the mutex sections short.
#[derive(Debug)]
pub struct AnalysisContext {
    pub image: Vec<u8>,
    pub image_media_type: String,
    pub started: Instant,
    pub started_at: DateTime<Utc>,
    pub enhanced_image_base64: String,
    pub applied_enhancements: Vec<String>,
    pub raw_ocr_text: String,
    pub transliterated_text: String,
    pub findings: HashMap<AgentRole, AgentFindings>,
    pub damage_hotspots: Vec<DamageHotspot>,
    pub repair_recommendations: Vec<String>,
    pub overall_confidence: f32,
}

impl AnalysisContext {
    pub fn new(image: Vec<u8>, image_media_type: impl Into<String>) -> Self {
        Self {
            image,
            image_media_type: image_media_type.into(),
            started: Instant::now(),
            started_at: Utc::now(),
            enhanced_image_base64: String::new(),
            applied_enhancements: Vec::new(),
            raw_ocr_text: String::new(),
            transliterated_text: String::new(),
            findings: HashMap::new(),
            damage_hotspots: Vec::new(),
            repair_recommendations: Vec::new(),
            overall_confidence: 0.0,
        }
    }

    pub fn record_findings(&mut self, role: AgentRole, findings: AgentFindings) {
        self.findings.insert(role, findings);
    }

    pub fn confidence_of(&self, role: AgentRole) -> Option<f32> {
        self.findings.get(&role).map(|f| f.confidence)
    }
}

/// Shared handle over the context. Locks are taken only around field
/// updates; callers must not hold a guard across an await point.
#[derive(Clone)]
pub struct SharedContext {
    inner: Arc<Mutex<AnalysisContext>>,
    changed: Arc<Notify>,
}

impl SharedContext {
    pub fn new(context: AnalysisContext) -> Self {
        Self {
            inner: Arc::new(Mutex::new(context)),
            changed: Arc::new(Notify::new()),
        }
    }

    pub async fn update<R>(&self, f: impl FnOnce(&mut AnalysisContext) -> R) -> R {
        let result = {
            let mut guard = self.inner.lock().await;
            f(&mut guard)
        };
        self.changed.notify_waiters();
        result
    }

    pub async fn read<R>(&self, f: impl FnOnce(&AnalysisContext) -> R) -> R {
        let guard = self.inner.lock().await;
        f(&guard)
    }

    /// Block until `pred` yields a value or `timeout` elapses; returns the
    /// last evaluation either way. Lets a fan-out agent await a sibling's
    /// findings entry without holding the context lock.
    pub async fn wait_for<R>(
        &self,
        mut pred: impl FnMut(&AnalysisContext) -> Option<R>,
        timeout: std::time::Duration,
    ) -> Option<R> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.read(|c| pred(c)).await {
                return Some(result);
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return self.read(|c| pred(c)).await;
                }
            }
        }
    }
}

/// Sniff the submitted payload's media type from its magic bytes. Returns
/// `None` for anything that is not a supported raster image.
pub fn sniff_media_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.starts_with(b"II*\x00") || bytes.starts_with(b"MM\x00*") {
        Some("image/tiff")
    } else if bytes.starts_with(b"BM") {
        Some("image/bmp")
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}
