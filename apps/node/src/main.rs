//! inknode: e-ink canvas node for the gateway.
//!
//! Wires the pieces together: device identity, framebuffer, A2UI canvas
//! handler, gateway client, touch loop, and power manager, all under one
//! root cancellation token. A long press of the power button cancels the
//! token and unwinds every subsystem.

mod config;
mod overlay;

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, OnceLock, PoisonError},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {
    anyhow::{bail, Context, Result},
    async_trait::async_trait,
    clap::Parser,
    tokio::time,
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use {
    inknode_canvas::{Handler, InvokeRequest, Renderer},
    inknode_eink::{Framebuffer, InputDevice},
    inknode_gateway::{
        default_registration,
        transport::{StreamDialer, WsDialer},
        Client, DeviceIdentity, InvokeHandler, RegisteredHook,
    },
    inknode_power::{Manager, PowerFlags, PowerHooks, SystemSuspender},
    inknode_protocol::{methods, InvokeRequestParams, NodeEventParams},
};

use crate::{
    config::{Args, Config},
    overlay::{OverlayNet, TcpOverlay},
};

const LONG_PRESS: Duration = Duration::from_secs(3);
const IP_WAIT_TIMEOUT: Duration = Duration::from_secs(15);
const IP_POLL_INTERVAL: Duration = Duration::from_millis(500);
const OVERLAY_UP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = Config::load(&args)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log_level)),
        )
        .init();

    std::fs::create_dir_all(&cfg.state_dir)
        .with_context(|| format!("create state dir {}", cfg.state_dir.display()))?;
    let identity =
        DeviceIdentity::load_or_create(cfg.identity_path()).context("load device identity")?;
    info!(device_id = identity.device_id(), "device identity loaded");

    let framebuffer = Framebuffer::open(&cfg.framebuffer)
        .with_context(|| format!("open framebuffer {}", cfg.framebuffer.display()))?;
    let renderer = Renderer::new(framebuffer.width(), framebuffer.height());

    let overlay = Arc::new(TcpOverlay);
    let dialer = WsDialer::new(
        cfg.gateway_url(),
        Some(cfg.user_agent.clone()),
        Some(overlay.clone() as Arc<dyn StreamDialer>),
    );

    let ready = Arc::new(ReadyState::new());
    let ready_hook = Arc::new(NodeReadyHook::new(Arc::clone(&ready)));

    let mut register = default_registration();
    register.user_agent = Some(cfg.user_agent.clone());

    let invoke = Arc::new(LateHandler::default());
    let client = Arc::new(Client::new(inknode_gateway::Config {
        dialer: Arc::new(dialer),
        register,
        on_invoke: invoke.clone(),
        on_registered: Some(ready_hook.clone()),
        ping_interval: None,
        auth_token: cfg.token.clone(),
        auth_password: cfg.password.clone(),
        identity: Some(identity),
        device_token_path: Some(cfg.device_token_path()),
    }));
    ready_hook.bind(Arc::clone(&client));

    let handler = Arc::new(Handler::new(
        framebuffer,
        renderer,
        Some(Arc::new(GatewaySender {
            client: Arc::clone(&client),
        })),
    ));
    invoke.bind(Arc::clone(&handler));

    let manager = Arc::new(
        Manager::new(
            cfg.idle_timeout,
            cfg.suspend_enabled,
            Arc::new(SystemSuspender::new()),
        ),
    );
    {
        let manager = Arc::clone(&manager);
        handler.set_idle_resetter(Arc::new(move || manager.reset_idle()));
    }
    {
        let flags = manager.flags();
        handler.set_command_gate(Arc::new(move |busy| flags.set_command_processing(busy)));
    }
    manager.set_hooks(Arc::new(ResumeHooks {
        ready: Arc::clone(&ready),
        flags: manager.flags(),
        overlay: overlay.clone() as Arc<dyn OverlayNet>,
        handler: Arc::clone(&handler),
        config_dir: cfg.config_dir.clone(),
        interface: wifi_interface(),
    }));

    let cancel = CancellationToken::new();
    spawn_signal_watcher(cancel.clone());

    if let Some(device) = cfg.touch_device.clone() {
        let handler = Arc::clone(&handler);
        let manager = Arc::clone(&manager);
        let cancel = cancel.clone();
        tokio::spawn(async move { touch_loop(cancel, device, handler, manager).await });
    }
    if cfg.suspend_enabled && !cfg.idle_timeout.is_zero() {
        let manager = Arc::clone(&manager);
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.run(cancel).await });
    } else {
        info!("suspend disabled by config");
    }

    match client.run(cancel.clone()).await {
        Ok(()) => Ok(()),
        Err(err) if err.is_cancelled() => Ok(()),
        Err(err) => Err(err).context("gateway client exited"),
    }
}

// ── Gateway ↔ canvas adapters ────────────────────────────────────────────────

/// Invoke handler bound after the client exists; invokes arriving before the
/// canvas is wired fail cleanly.
#[derive(Default)]
struct LateHandler {
    handler: OnceLock<Arc<Handler>>,
}

impl LateHandler {
    fn bind(&self, handler: Arc<Handler>) {
        let _ = self.handler.set(handler);
    }
}

#[async_trait]
impl InvokeHandler for LateHandler {
    async fn handle_invoke(
        &self,
        req: InvokeRequestParams,
    ) -> Result<Option<serde_json::Value>> {
        let Some(handler) = self.handler.get() else {
            bail!("handler not ready");
        };
        Ok(handler
            .handle_invoke(InvokeRequest {
                command: req.command,
                args: req.args,
            })
            .await?)
    }
}

struct GatewaySender {
    client: Arc<Client>,
}

#[async_trait]
impl inknode_canvas::ActionSender for GatewaySender {
    async fn send_node_event(&self, params: NodeEventParams) -> Result<()> {
        Ok(self.client.send_event(methods::NODE_EVENT, &params).await?)
    }
}

// ── node.ready ───────────────────────────────────────────────────────────────

/// Reason reported with `node.ready`: "boot" first, "wake" right after a
/// resume, "reconnect" on every later registration.
struct ReadyState {
    reason: Mutex<&'static str>,
}

impl ReadyState {
    fn new() -> Self {
        Self {
            reason: Mutex::new("boot"),
        }
    }

    fn set_wake(&self) {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner) = "wake";
    }

    fn next_reason(&self) -> &'static str {
        let mut reason = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        let current = *reason;
        if current != "reconnect" {
            *reason = "reconnect";
        }
        current
    }
}

struct NodeReadyHook {
    client: OnceLock<Arc<Client>>,
    ready: Arc<ReadyState>,
}

impl NodeReadyHook {
    fn new(ready: Arc<ReadyState>) -> Self {
        Self {
            client: OnceLock::new(),
            ready,
        }
    }

    fn bind(&self, client: Arc<Client>) {
        let _ = self.client.set(client);
    }
}

#[async_trait]
impl RegisteredHook for NodeReadyHook {
    async fn on_registered(&self) -> Result<()> {
        let Some(client) = self.client.get() else {
            bail!("gateway client not ready");
        };
        let reason = self.ready.next_reason();
        let payload = serde_json::json!({ "reason": reason, "timestamp": now_ms() });
        let raw = serde_json::value::to_raw_value(&payload)?;
        client
            .send_event(methods::NODE_EVENT, &NodeEventParams::new("node.ready", raw))
            .await?;
        Ok(())
    }
}

// ── Suspend/resume hooks ─────────────────────────────────────────────────────

struct ResumeHooks {
    ready: Arc<ReadyState>,
    flags: Arc<PowerFlags>,
    overlay: Arc<dyn OverlayNet>,
    handler: Arc<Handler>,
    config_dir: PathBuf,
    interface: String,
}

#[async_trait]
impl PowerHooks for ResumeHooks {
    async fn on_suspend(&self) {
        if let Err(err) = run_script(&self.config_dir.join("disable-wifi.sh")).await {
            warn!(error = %err, "failed to disable wifi");
        }
    }

    /// Ordered resume: link up, wait for an address, overlay up, then a full
    /// repaint. The gateway reconnects by itself once the link carries.
    async fn on_resume(&self) {
        self.ready.set_wake();
        self.flags.set_wifi_connecting(true);

        if let Err(err) = run_script(&self.config_dir.join("enable-wifi.sh")).await {
            warn!(error = %err, "failed to enable wifi");
        }
        if let Err(err) = wait_for_ip(&self.interface, IP_WAIT_TIMEOUT).await {
            warn!(error = %err, interface = %self.interface, "wifi did not acquire IP");
        }
        if let Err(err) = self.overlay.up(OVERLAY_UP_TIMEOUT).await {
            warn!(error = %err, "overlay did not come up");
        }
        if let Err(err) = self.handler.full_refresh() {
            warn!(error = %err, "failed full refresh after wake");
        }

        self.flags.set_wifi_connecting(false);
    }
}

// ── Touch loop ───────────────────────────────────────────────────────────────

async fn touch_loop(
    cancel: CancellationToken,
    device: PathBuf,
    handler: Arc<Handler>,
    manager: Arc<Manager>,
) {
    let input = match InputDevice::open(&device) {
        Ok(input) => input,
        Err(err) => {
            warn!(error = %err, device = %device.display(), "failed to open touch device");
            return;
        },
    };
    let mut streams = input.read_events();
    let mut power_down_at: Option<SystemTime> = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            touch = streams.touch.recv() => {
                let Some(touch) = touch else { return };
                manager.reset_idle();
                if touch.down {
                    handler.handle_touch(touch.x, touch.y);
                }
            },
            power = streams.power.recv() => {
                let Some(power) = power else { return };
                if power.pressed {
                    power_down_at = Some(power.at);
                } else if let Some(down_at) = power_down_at.take() {
                    let held = power.at.duration_since(down_at).unwrap_or_default();
                    if held >= LONG_PRESS {
                        info!("power long press: exiting");
                        cancel.cancel();
                    } else if let Err(err) = manager.suspend().await {
                        if !err.is_gate_refusal() {
                            warn!(error = %err, "failed to suspend");
                        }
                    }
                }
            },
            err = streams.errors.recv() => {
                if let Some(err) = err {
                    warn!(error = %err, "input error");
                }
                return;
            },
        }
    }
}

// ── System helpers ───────────────────────────────────────────────────────────

fn spawn_signal_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            },
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            },
        }
        cancel.cancel();
    });
}

/// Prefer the radio device; fall back to wired.
fn wifi_interface() -> String {
    if Path::new("/sys/class/net/wlan0").exists() {
        "wlan0".to_string()
    } else {
        "eth0".to_string()
    }
}

/// Enumerate interface addresses and look for any IPv4 or IPv6 address on
/// the named interface.
fn interface_has_address(name: &str) -> bool {
    let mut addrs: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: getifaddrs fills the list; it is freed below.
    if unsafe { libc::getifaddrs(&mut addrs) } != 0 {
        return false;
    }
    let mut found = false;
    let mut cursor = addrs;
    while !cursor.is_null() {
        // SAFETY: cursor walks the list returned by getifaddrs.
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;
        if entry.ifa_addr.is_null() {
            continue;
        }
        // SAFETY: ifa_addr was checked non-null above.
        let family = i32::from(unsafe { (*entry.ifa_addr).sa_family });
        if family != libc::AF_INET && family != libc::AF_INET6 {
            continue;
        }
        // SAFETY: ifa_name is a NUL-terminated string owned by the list.
        let entry_name = unsafe { std::ffi::CStr::from_ptr(entry.ifa_name) };
        if entry_name.to_str() == Ok(name) {
            found = true;
            break;
        }
    }
    // SAFETY: addrs came from getifaddrs.
    unsafe { libc::freeifaddrs(addrs) };
    found
}

async fn wait_for_ip(interface: &str, timeout: Duration) -> Result<()> {
    let deadline = time::Instant::now() + timeout;
    loop {
        if interface_has_address(interface) {
            return Ok(());
        }
        if time::Instant::now() >= deadline {
            bail!("no address on {interface} after {timeout:?}");
        }
        time::sleep(IP_POLL_INTERVAL).await;
    }
}

async fn run_script(path: &Path) -> Result<()> {
    let status = tokio::process::Command::new(path)
        .status()
        .await
        .with_context(|| format!("spawn {}", path.display()))?;
    if !status.success() {
        bail!("{} exited with {status}", path.display());
    }
    Ok(())
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
