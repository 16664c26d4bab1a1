//! A2UI canvas pipeline.
//!
//! Pushed component trees accumulate in a scene state, a deterministic
//! rasteriser flattens them to a grayscale bitmap plus a hit-target list,
//! and the handler commits the bitmap to the framebuffer with the right
//! e-ink waveform. Touches are hit-tested against the last render and
//! reported back as `canvas.a2ui.action` events.

pub mod a2ui;
pub mod handler;
pub mod renderer;
pub mod snapshot;

pub use a2ui::{decode_jsonl, decode_push, Action, Align, Component, ComponentKind, Push, SceneState, Style};
pub use handler::{ActionSender, Handler, InvokeRequest};
pub use renderer::{HitTarget, Rect, Renderer};

/// Errors from canvas command dispatch and rendering. Every variant is
/// reported to the gateway as an `ok:false` invoke result; the scene state
/// stays consistent.
#[derive(Debug, thiserror::Error)]
pub enum CanvasError {
    #[error("unknown canvas command: {0}")]
    UnknownCommand(String),

    #[error("{0} not supported on this device")]
    NotSupported(&'static str),

    #[error("invalid A2UI payload")]
    InvalidPayload,

    #[error("invalid JSONL args")]
    InvalidJsonlArgs,

    #[error("snapshot encoding failed: {0}")]
    Snapshot(String),

    #[error(transparent)]
    Eink(#[from] inknode_eink::EinkError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
