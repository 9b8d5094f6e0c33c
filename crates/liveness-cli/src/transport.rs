//! Recording transport: stands in for the verification service connection,
//! keeps upload statistics and optionally writes every event as a JSON line.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use liveness_core::{ChallengeResponseEvent, CloseCode, LivenessTransport, VideoEvent};
use serde::Serialize;
use sha2::{Digest, Sha256};

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum TransportRecord<'a> {
    ChallengeResponse {
        #[serde(flatten)]
        event: &'a ChallengeResponseEvent,
    },
    Video {
        timestamp: String,
        bytes: usize,
        end_of_stream: bool,
    },
    Stop {
        close_code: Option<u16>,
    },
}

/// Totals of everything that went over the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadStats {
    pub challenge_responses: usize,
    pub color_responses: usize,
    pub video_segments: usize,
    pub uploaded_bytes: usize,
    pub end_of_stream_sent: bool,
    /// Close codes of every stop request, in order. `None` is the default code.
    pub stops: Vec<Option<u16>>,
}

struct Recorder {
    stats: UploadStats,
    digest: Sha256,
    out: Option<BufWriter<File>>,
}

pub struct RecordingTransport {
    inner: Mutex<Recorder>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Recorder {
                stats: UploadStats::default(),
                digest: Sha256::new(),
                out: None,
            }),
        }
    }

    /// Also write each event to `path` as one JSON object per line.
    pub fn with_event_log(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create event log {}", path.display()))?;
        let transport = Self::new();
        transport.lock().out = Some(BufWriter::new(file));
        Ok(transport)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorder> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> UploadStats {
        self.lock().stats.clone()
    }

    /// Hex SHA-256 of the concatenated video payload sent so far.
    pub fn stream_digest(&self) -> String {
        format!("{:x}", self.lock().digest.clone().finalize())
    }

    pub fn flush(&self) -> Result<()> {
        if let Some(out) = self.lock().out.as_mut() {
            out.flush().context("failed to flush event log")?;
        }
        Ok(())
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder {
    fn record(&mut self, record: &TransportRecord<'_>) {
        let Some(out) = self.out.as_mut() else {
            return;
        };
        let written = serde_json::to_writer(&mut *out, record)
            .map_err(std::io::Error::from)
            .and_then(|()| out.write_all(b"\n"));
        if let Err(e) = written {
            tracing::warn!(error = %e, "failed to write transport event");
        }
    }
}

fn rfc3339(timestamp_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| timestamp_ms.to_string())
}

impl LivenessTransport for RecordingTransport {
    fn send_challenge_response(&self, event: ChallengeResponseEvent) {
        let mut recorder = self.lock();
        recorder.stats.challenge_responses += 1;
        if matches!(event, ChallengeResponseEvent::ColorChallengeResponse { .. }) {
            recorder.stats.color_responses += 1;
        }
        tracing::debug!(?event, "challenge response");
        recorder.record(&TransportRecord::ChallengeResponse { event: &event });
    }

    fn send_video_event(&self, event: VideoEvent) {
        let mut recorder = self.lock();
        if event.is_end_of_stream() {
            recorder.stats.end_of_stream_sent = true;
        } else {
            recorder.stats.video_segments += 1;
            recorder.stats.uploaded_bytes += event.bytes.len();
            recorder.digest.update(&event.bytes);
        }
        recorder.record(&TransportRecord::Video {
            timestamp: rfc3339(event.timestamp_ms),
            bytes: event.bytes.len(),
            end_of_stream: event.is_end_of_stream(),
        });
    }

    fn stop_session(&self, close_code: Option<CloseCode>) {
        let code = close_code.map(|c| c.code());
        tracing::info!(close_code = ?code, "session stop requested");
        let mut recorder = self.lock();
        recorder.stats.stops.push(code);
        recorder.record(&TransportRecord::Stop { close_code: code });
    }
}
