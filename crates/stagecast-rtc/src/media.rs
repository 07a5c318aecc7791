use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::types::LocalMediaStream;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("capture permission denied: {0}")]
    PermissionDenied(String),
    #[error("no capture device matches: {0}")]
    NotFound(String),
    #[error("constraints cannot be satisfied: {0}")]
    Overconstrained(String),
    #[error("capture device busy: {0}")]
    DeviceBusy(String),
    #[error("all capture fallbacks failed, last error: {0}")]
    Exhausted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FacingMode {
    User,
    Environment,
}

impl FacingMode {
    pub fn opposite(self) -> Self {
        match self {
            FacingMode::User => FacingMode::Environment,
            FacingMode::Environment => FacingMode::User,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoConstraints {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
    pub facing_mode: Option<FacingMode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    /// `None` requests no video at all.
    pub video: Option<VideoConstraints>,
}

/// One rung of the acquisition fallback ladder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LadderStep {
    pub label: &'static str,
    pub constraints: MediaConstraints,
    pub degraded: bool,
}

/// ideal → relaxed → alternate facing → any camera → audio only.
pub fn default_ladder(facing: FacingMode) -> Vec<LadderStep> {
    vec![
        LadderStep {
            label: "ideal",
            constraints: MediaConstraints {
                audio: true,
                video: Some(VideoConstraints {
                    width: Some(1280),
                    height: Some(720),
                    frame_rate: Some(30),
                    facing_mode: Some(facing),
                }),
            },
            degraded: false,
        },
        LadderStep {
            label: "relaxed",
            constraints: MediaConstraints {
                audio: true,
                video: Some(VideoConstraints {
                    width: Some(640),
                    height: Some(480),
                    frame_rate: None,
                    facing_mode: Some(facing),
                }),
            },
            degraded: false,
        },
        LadderStep {
            label: "alternate-facing",
            constraints: MediaConstraints {
                audio: true,
                video: Some(VideoConstraints {
                    width: Some(640),
                    height: Some(480),
                    frame_rate: None,
                    facing_mode: Some(facing.opposite()),
                }),
            },
            degraded: false,
        },
        LadderStep {
            label: "any-camera",
            constraints: MediaConstraints {
                audio: true,
                video: Some(VideoConstraints::default()),
            },
            degraded: false,
        },
        LadderStep {
            label: "audio-only",
            constraints: MediaConstraints {
                audio: true,
                video: None,
            },
            degraded: true,
        },
    ]
}

/// Local capture devices.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMediaStream, MediaError>;
}

/// Result of [`LocalMediaHandle::ensure_live`].
#[derive(Debug, Clone)]
pub struct MediaAcquisition {
    pub stream: LocalMediaStream,
    pub reused: bool,
    /// Set only the first time the handle falls back to a degraded rung.
    pub newly_degraded: Option<String>,
}

/// Owns the participant's capture stream and replaces it through the
/// fallback ladder whenever a track has ended.
pub struct LocalMediaHandle {
    devices: Arc<dyn MediaDevices>,
    ladder: Vec<LadderStep>,
    current: Mutex<Option<LocalMediaStream>>,
    degraded: AtomicBool,
}

impl LocalMediaHandle {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self::with_ladder(devices, default_ladder(FacingMode::User))
    }

    pub fn with_ladder(devices: Arc<dyn MediaDevices>, ladder: Vec<LadderStep>) -> Self {
        Self {
            devices,
            ladder,
            current: Mutex::new(None),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn current(&self) -> Option<LocalMediaStream> {
        self.current.lock().clone()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub async fn ensure_live(&self) -> Result<MediaAcquisition, MediaError> {
        let existing = self.current.lock().clone();
        if let Some(stream) = existing {
            if stream.all_live() {
                return Ok(MediaAcquisition {
                    stream,
                    reused: true,
                    newly_degraded: None,
                });
            }
            tracing::debug!(
                target = "webrtc",
                stream_id = %stream.id,
                live_tracks = stream.live_track_count(),
                "local stream has ended tracks; reacquiring"
            );
            stream.stop();
        }

        let mut last_error = None;
        for step in &self.ladder {
            match self.devices.get_user_media(&step.constraints).await {
                Ok(stream) if !stream.tracks.is_empty() => {
                    tracing::debug!(
                        target = "webrtc",
                        rung = step.label,
                        stream_id = %stream.id,
                        tracks = stream.tracks.len(),
                        "local media acquired"
                    );
                    *self.current.lock() = Some(stream.clone());
                    let newly_degraded = if step.degraded {
                        let first = !self.degraded.swap(true, Ordering::SeqCst);
                        first.then(|| match &last_error {
                            Some(err) => format!("video unavailable ({err}); continuing audio-only"),
                            None => "continuing audio-only".to_string(),
                        })
                    } else {
                        self.degraded.store(false, Ordering::SeqCst);
                        None
                    };
                    return Ok(MediaAcquisition {
                        stream,
                        reused: false,
                        newly_degraded,
                    });
                }
                Ok(_) => {
                    last_error = Some(MediaError::NotFound(format!(
                        "{} returned no tracks",
                        step.label
                    )));
                }
                Err(err) => {
                    tracing::debug!(
                        target = "webrtc",
                        rung = step.label,
                        error = %err,
                        "media acquisition rung failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        *self.current.lock() = None;
        let reason = last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "no fallback configured".to_string());
        tracing::warn!(target = "webrtc", reason = %reason, "local media unavailable");
        Err(MediaError::Exhausted(reason))
    }

    /// Stops every track and forgets the stream.
    pub fn release(&self) {
        let stream = self.current.lock().take();
        if let Some(stream) = stream {
            stream.stop();
        }
        self.degraded.store(false, Ordering::SeqCst);
    }
}
