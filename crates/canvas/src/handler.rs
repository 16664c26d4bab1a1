//! Canvas command handler.
//!
//! Dispatches `canvas.*` invokes onto the scene state, rasteriser, and
//! framebuffer, and turns touch-downs into `canvas.a2ui.action` events.
//! Renders and hit-tests are serialised by one lock so a touch never sees a
//! half-rendered target list. Touch reporting is spawned so it can never
//! block on the gateway.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use {
    async_trait::async_trait,
    serde::Serialize,
    serde_json::value::RawValue,
    tracing::warn,
};

use {
    inknode_eink::{Framebuffer, Update},
    inknode_protocol::NodeEventParams,
};

use crate::{
    a2ui::{decode_jsonl, decode_push, SceneState},
    renderer::Renderer,
    snapshot, CanvasError,
};

/// Outbound event sink, implemented over the gateway client.
#[async_trait]
pub trait ActionSender: Send + Sync {
    async fn send_node_event(&self, params: NodeEventParams) -> anyhow::Result<()>;
}

/// One command invocation routed to the canvas.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub command: String,
    pub args: Option<serde_json::Value>,
}

struct RenderState {
    renderer: Renderer,
    framebuffer: Framebuffer,
}

pub struct Handler {
    scene: SceneState,
    render: Mutex<RenderState>,
    sender: Option<Arc<dyn ActionSender>>,
    idle_reset: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    command_busy: Mutex<Option<Arc<dyn Fn(bool) + Send + Sync>>>,
}

#[derive(Serialize)]
struct ActionEventPayload<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a RawValue>,
    x: i32,
    y: i32,
    time: i64,
}

impl Handler {
    pub fn new(
        framebuffer: Framebuffer,
        renderer: Renderer,
        sender: Option<Arc<dyn ActionSender>>,
    ) -> Self {
        Self {
            scene: SceneState::new(),
            render: Mutex::new(RenderState {
                renderer,
                framebuffer,
            }),
            sender,
            idle_reset: Mutex::new(None),
            command_busy: Mutex::new(None),
        }
    }

    /// Every canvas command resets the idle timer.
    pub fn set_idle_resetter(&self, hook: Arc<dyn Fn() + Send + Sync>) {
        *self
            .idle_reset
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    /// Command processing blocks suspend while in flight.
    pub fn set_command_gate(&self, hook: Arc<dyn Fn(bool) + Send + Sync>) {
        *self
            .command_busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    pub async fn handle_invoke(
        &self,
        req: InvokeRequest,
    ) -> Result<Option<serde_json::Value>, CanvasError> {
        let command = req.command.trim().to_string();
        self.reset_idle();
        self.set_busy(true);
        let result = self.dispatch(&command, req.args).await;
        self.set_busy(false);
        result
    }

    async fn dispatch(
        &self,
        command: &str,
        args: Option<serde_json::Value>,
    ) -> Result<Option<serde_json::Value>, CanvasError> {
        match command {
            "canvas.present" => self.present(true),
            "canvas.hide" => self.clear_and_commit(),
            "canvas.navigate" => Err(CanvasError::NotSupported("canvas.navigate")),
            "canvas.eval" => Err(CanvasError::NotSupported("canvas.eval")),
            "canvas.snapshot" => self.snapshot(),
            "canvas.a2ui.push" => self.push(args),
            "canvas.a2ui.pushJSONL" => self.push_jsonl(args),
            "canvas.a2ui.reset" => {
                self.scene.reset();
                self.clear_and_commit()
            },
            other => Err(CanvasError::UnknownCommand(other.to_string())),
        }
    }

    /// Render the scene and commit. Partial presents use the fast A2
    /// waveform; full ones let the controller repaint properly.
    fn present(&self, partial: bool) -> Result<Option<serde_json::Value>, CanvasError> {
        let components = self.scene.components();
        let mut render = self.lock_render();
        let RenderState {
            renderer,
            framebuffer,
        } = &mut *render;
        renderer.render(&components);
        framebuffer.write_gray(renderer.image())?;
        framebuffer.refresh(Update {
            full: !partial,
            fast: partial,
            ..Default::default()
        })?;
        Ok(None)
    }

    /// Repaint the current scene with a full waveform, e.g. after wake.
    pub fn full_refresh(&self) -> Result<(), CanvasError> {
        self.present(false).map(|_| ())
    }

    fn clear_and_commit(&self) -> Result<Option<serde_json::Value>, CanvasError> {
        let mut render = self.lock_render();
        let RenderState {
            renderer,
            framebuffer,
        } = &mut *render;
        renderer.clear();
        framebuffer.write_gray(renderer.image())?;
        framebuffer.refresh(Update {
            full: true,
            ..Default::default()
        })?;
        Ok(None)
    }

    fn snapshot(&self) -> Result<Option<serde_json::Value>, CanvasError> {
        let render = self.lock_render();
        let encoded = snapshot::encode_base64(render.renderer.image())?;
        Ok(Some(serde_json::Value::String(encoded)))
    }

    fn push(&self, args: Option<serde_json::Value>) -> Result<Option<serde_json::Value>, CanvasError> {
        let args = args.ok_or(CanvasError::InvalidPayload)?;
        let push = decode_push(&args)?;
        self.scene.apply_push(push);
        self.present(true)
    }

    fn push_jsonl(
        &self,
        args: Option<serde_json::Value>,
    ) -> Result<Option<serde_json::Value>, CanvasError> {
        let args = args.ok_or(CanvasError::InvalidJsonlArgs)?;
        let jsonl = unwrap_string_args(&args)?;
        for push in decode_jsonl(&jsonl)? {
            self.scene.apply_push(push);
        }
        self.present(true)
    }

    /// Hit-test a touch-down against the last render and report the action.
    /// No match or no sender: silently dropped.
    pub fn handle_touch(&self, x: i32, y: i32) {
        let Some(sender) = &self.sender else {
            return;
        };
        let payload = {
            let render = self.lock_render();
            let Some(action) = render.renderer.hit_test(x, y) else {
                return;
            };
            let payload = ActionEventPayload {
                kind: &action.kind,
                payload: action.payload.as_deref(),
                x,
                y,
                time: now_ms(),
            };
            match serde_json::value::to_raw_value(&payload) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(error = %err, "failed to encode A2UI action");
                    return;
                },
            }
        };
        let sender = Arc::clone(sender);
        tokio::spawn(async move {
            let params = NodeEventParams::new("canvas.a2ui.action", payload);
            if let Err(err) = sender.send_node_event(params).await {
                warn!(error = %err, "failed to send A2UI action");
            }
        });
    }

    fn reset_idle(&self) {
        if let Some(hook) = self
            .idle_reset
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            hook();
        }
    }

    fn set_busy(&self, busy: bool) {
        if let Some(hook) = self
            .command_busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            hook(busy);
        }
    }

    fn lock_render(&self) -> MutexGuard<'_, RenderState> {
        self.render.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn unwrap_string_args(args: &serde_json::Value) -> Result<String, CanvasError> {
    if let Some(text) = args.as_str() {
        return Ok(text.to_string());
    }
    if let Some(text) = args.get("jsonl").and_then(|v| v.as_str()) {
        return Ok(text.to_string());
    }
    Err(CanvasError::InvalidJsonlArgs)
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
