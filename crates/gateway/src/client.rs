//! Gateway client state machine.
//!
//! One long-running task owns the reconnect loop: dial, challenge/connect
//! handshake, read loop, backoff, repeat. A per-connection ping task races
//! cancellation and read-loop completion. All frame writes are serialised by
//! a single async mutex and carry a 5 s deadline; reads idle out after 60 s.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex, PoisonError,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {
    async_trait::async_trait,
    rand::Rng,
    serde::Serialize,
    serde_json::value::RawValue,
    tokio::{sync::Mutex, time},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use inknode_protocol::{
    self as protocol, events, methods, ChallengePayload, ConnectAuth, ConnectParams, DeviceInfo,
    Frame, HelloOk, InvokeRequestParams, InvokeResultParams, NodeInvokeError, ShutdownPayload,
    PROTOCOL_VERSION,
};

use crate::{
    device_token,
    error::ClientError,
    identity::{build_device_auth_payload, DeviceIdentity},
    node::NodeRegistration,
    transport::{Dialer, FrameReader, FrameWriter, Inbound},
};

pub(crate) const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub(crate) const MAX_BACKOFF: Duration = Duration::from_secs(30);
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const CLOSE_POLICY_VIOLATION: u16 = 1008;

type SharedWriter = Arc<Mutex<Box<dyn FrameWriter>>>;

/// Services `node.invoke.request`. A returned error becomes an `ok:false`
/// invoke result; it never tears the connection down.
#[async_trait]
pub trait InvokeHandler: Send + Sync {
    async fn handle_invoke(
        &self,
        req: InvokeRequestParams,
    ) -> anyhow::Result<Option<serde_json::Value>>;
}

/// Runs strictly after every successful `hello-ok`.
#[async_trait]
pub trait RegisteredHook: Send + Sync {
    async fn on_registered(&self) -> anyhow::Result<()>;
}

pub struct Config {
    pub dialer: Arc<dyn Dialer>,
    pub register: NodeRegistration,
    pub on_invoke: Arc<dyn InvokeHandler>,
    pub on_registered: Option<Arc<dyn RegisteredHook>>,
    pub ping_interval: Option<Duration>,
    pub auth_token: Option<String>,
    pub auth_password: Option<String>,
    pub identity: Option<DeviceIdentity>,
    pub device_token_path: Option<PathBuf>,
}

pub struct Client {
    dialer: Arc<dyn Dialer>,
    register: NodeRegistration,
    on_invoke: Arc<dyn InvokeHandler>,
    on_registered: Option<Arc<dyn RegisteredHook>>,
    ping_interval: Duration,
    connect_auth: Option<ConnectAuth>,
    identity: Option<DeviceIdentity>,
    device_token: StdMutex<Option<String>>,
    device_token_path: Option<PathBuf>,
    writer: StdMutex<Option<SharedWriter>>,
    request_seq: AtomicU64,
}

/// Serialize-only frame wrapper so raw payloads pass through verbatim.
#[derive(Serialize)]
struct WireRequest<'a> {
    r#type: &'static str,
    id: String,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a RawValue>,
}

impl Client {
    pub fn new(cfg: Config) -> Self {
        let connect_auth = match (
            cfg.auth_token.filter(|t| !t.is_empty()),
            cfg.auth_password.filter(|p| !p.is_empty()),
        ) {
            (None, None) => None,
            (token, password) => Some(ConnectAuth { token, password }),
        };
        let device_token = match &cfg.device_token_path {
            Some(path) => match device_token::load(path) {
                Ok(token) => token,
                Err(err) => {
                    warn!(error = %err, "gateway: failed to load device token");
                    None
                },
            },
            None => None,
        };
        Self {
            dialer: cfg.dialer,
            register: cfg.register,
            on_invoke: cfg.on_invoke,
            on_registered: cfg.on_registered,
            ping_interval: cfg.ping_interval.unwrap_or(DEFAULT_PING_INTERVAL),
            connect_auth,
            identity: cfg.identity,
            device_token: StdMutex::new(device_token),
            device_token_path: cfg.device_token_path,
            writer: StdMutex::new(None),
            request_seq: AtomicU64::new(0),
        }
    }

    /// Connect-and-serve until the token is cancelled. Everything short of
    /// cancellation is translated into a reconnect.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ClientError> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            let (mut reader, writer) = match self.dial(&cancel).await {
                Ok(pair) => pair,
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    warn!(error = %err, "gateway connect failed");
                    self.wait_backoff(&cancel, &mut backoff).await?;
                    continue;
                },
            };
            self.install_writer(writer);

            if let Err(err) = self.register_node(&cancel, reader.as_mut()).await {
                self.drop_writer();
                if err.is_cancelled() {
                    return Err(err);
                }
                error!(error = %err, "gateway registration failed");
                apply_backoff_override(&err, &mut backoff);
                self.wait_backoff(&cancel, &mut backoff).await?;
                continue;
            }
            backoff = INITIAL_BACKOFF;

            if let Some(hook) = &self.on_registered {
                if let Err(err) = hook.on_registered().await {
                    warn!(error = %err, "gateway registered callback failed");
                }
            }

            let err = self.read_loop(&cancel, reader.as_mut()).await;
            self.drop_writer();
            if err.is_cancelled() {
                return Err(err);
            }
            warn!(error = %err, "gateway read loop ended");
            apply_backoff_override(&err, &mut backoff);
            self.wait_backoff(&cancel, &mut backoff).await?;
        }
    }

    /// Emit a client-originated request (`node.event` and friends).
    pub async fn send_event<T: Serialize>(
        &self,
        method: &str,
        params: &T,
    ) -> Result<(), ClientError> {
        let id = self.next_id();
        self.send_request(id, method, Some(params)).await
    }

    // ── Connection plumbing ──────────────────────────────────────────────

    async fn dial(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(Box<dyn FrameReader>, Box<dyn FrameWriter>), ClientError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            result = self.dialer.dial() => result,
        }
    }

    fn install_writer(&self, writer: Box<dyn FrameWriter>) {
        *self.writer.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Arc::new(Mutex::new(writer)));
    }

    fn drop_writer(&self) {
        *self.writer.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn current_writer(&self) -> Option<SharedWriter> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn send_request<T: Serialize>(
        &self,
        id: String,
        method: &str,
        params: Option<&T>,
    ) -> Result<(), ClientError> {
        let raw = match params {
            Some(params) => Some(serde_json::value::to_raw_value(params)?),
            None => None,
        };
        let frame = WireRequest {
            r#type: "req",
            id,
            method,
            params: raw.as_deref(),
        };
        self.send_text(serde_json::to_string(&frame)?).await
    }

    async fn send_text(&self, text: String) -> Result<(), ClientError> {
        let writer = self.current_writer().ok_or(ClientError::NotConnected)?;
        let mut writer = writer.lock().await;
        match time::timeout(WRITE_TIMEOUT, writer.send_text(text)).await {
            Err(_) => Err(ClientError::WriteTimeout),
            Ok(result) => result,
        }
    }

    async fn read_message(
        &self,
        cancel: &CancellationToken,
        reader: &mut dyn FrameReader,
    ) -> Result<Inbound, ClientError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            result = time::timeout(READ_IDLE_TIMEOUT, reader.next_message()) => match result {
                Err(_) => Err(ClientError::ReadTimeout),
                Ok(Ok(inbound)) => Ok(inbound),
                Ok(Err(err)) => Err(self.classify_close(err)),
            },
        }
    }

    // ── Handshake ────────────────────────────────────────────────────────

    async fn register_node(
        &self,
        cancel: &CancellationToken,
        reader: &mut dyn FrameReader,
    ) -> Result<(), ClientError> {
        let mut nonce = String::new();
        let mut connect_sent = false;
        let mut connect_id = String::new();
        loop {
            let Inbound::Text(data) = self.read_message(cancel, reader).await? else {
                continue;
            };
            let frame = match protocol::decode_frame(&data) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(error = %err, "gateway: invalid handshake message");
                    continue;
                },
            };
            match frame {
                Frame::Event(evt) => match evt.event.as_str() {
                    events::CONNECT_CHALLENGE => {
                        let challenge: ChallengePayload = match evt
                            .payload
                            .map(serde_json::from_value)
                            .transpose()
                        {
                            Ok(challenge) => challenge.unwrap_or_default(),
                            Err(err) => {
                                warn!(error = %err, "gateway: invalid connect challenge");
                                continue;
                            },
                        };
                        if challenge.nonce.is_empty() || challenge.nonce == nonce {
                            continue;
                        }
                        nonce = challenge.nonce;
                        if !connect_sent {
                            let (id, params) = self.build_connect_request(&nonce)?;
                            connect_id = id.clone();
                            self.send_request(id, methods::CONNECT, Some(&params)).await?;
                            connect_sent = true;
                        }
                    },
                    events::TICK => debug!("gateway: tick"),
                    _ => {},
                },
                Frame::Response(res) => {
                    if !connect_sent || res.id != connect_id {
                        continue;
                    }
                    if !res.ok {
                        let message = res
                            .error
                            .and_then(|e| e.message)
                            .filter(|m| !m.is_empty());
                        return Err(match message {
                            Some(message) => ClientError::Rejected(message),
                            None => ClientError::ConnectRejected,
                        });
                    }
                    let hello: HelloOk =
                        serde_json::from_value(res.payload.unwrap_or(serde_json::Value::Null))?;
                    if hello.r#type != "hello-ok" {
                        return Err(ClientError::UnexpectedHandshakePayload);
                    }
                    if let Some(token) = hello
                        .auth
                        .and_then(|auth| auth.device_token)
                        .filter(|t| !t.is_empty())
                    {
                        self.adopt_device_token(token);
                    }
                    return Ok(());
                },
                Frame::Request(_) => {},
            }
        }
    }

    fn build_connect_request(&self, nonce: &str) -> Result<(String, ConnectParams), ClientError> {
        let id = self.next_id();
        let (auth, token_for_payload) = self.select_connect_auth();
        let device = self.identity.as_ref().map(|identity| {
            let signed_at = now_ms();
            let payload = build_device_auth_payload(
                identity.device_id(),
                &self.register.client.id,
                &self.register.client.mode,
                &self.register.role,
                &self.register.scopes,
                signed_at,
                &token_for_payload,
                nonce,
            );
            DeviceInfo {
                id: identity.device_id().to_string(),
                public_key: identity.public_key_base64url(),
                signature: identity.sign(&payload),
                signed_at,
                nonce: (!nonce.is_empty()).then(|| nonce.to_string()),
            }
        });
        let reg = &self.register;
        let params = ConnectParams {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: reg.client.clone(),
            role: (!reg.role.is_empty()).then(|| reg.role.clone()),
            caps: (!reg.caps.is_empty()).then(|| reg.caps.clone()),
            commands: (!reg.commands.is_empty()).then(|| reg.commands.clone()),
            permissions: reg.permissions.clone(),
            path_env: reg.path_env.clone(),
            scopes: (!reg.scopes.is_empty()).then(|| reg.scopes.clone()),
            auth,
            device,
            locale: reg.locale.clone(),
            user_agent: reg.user_agent.clone(),
        };
        Ok((id, params))
    }

    /// Pick the auth block and the token that goes into the signed payload:
    /// explicit shared token, then persisted device token, then bare
    /// password, then nothing.
    fn select_connect_auth(&self) -> (Option<ConnectAuth>, String) {
        let device_token = self.device_token_value();
        if let Some(auth) = &self.connect_auth {
            if let Some(token) = auth.token.clone().filter(|t| !t.is_empty()) {
                return (Some(auth.clone()), token);
            }
            if auth.password.as_deref().is_some_and(|p| !p.is_empty()) && device_token.is_none() {
                return (Some(auth.clone()), String::new());
            }
        }
        if let Some(token) = device_token {
            let password = self
                .connect_auth
                .as_ref()
                .and_then(|auth| auth.password.clone())
                .filter(|p| !p.is_empty());
            return (
                Some(ConnectAuth {
                    token: Some(token.clone()),
                    password,
                }),
                token,
            );
        }
        if let Some(auth) = &self.connect_auth {
            if auth.password.as_deref().is_some_and(|p| !p.is_empty()) {
                return (Some(auth.clone()), String::new());
            }
        }
        (None, String::new())
    }

    // ── Read loop ────────────────────────────────────────────────────────

    async fn read_loop(&self, cancel: &CancellationToken, reader: &mut dyn FrameReader) -> ClientError {
        let done = CancellationToken::new();
        let _done_guard = done.clone().drop_guard();
        if let Some(writer) = self.current_writer() {
            tokio::spawn(ping_loop(
                writer,
                self.ping_interval,
                cancel.clone(),
                done.clone(),
            ));
        }
        loop {
            let data = match self.read_message(cancel, reader).await {
                Ok(Inbound::Text(data)) => data,
                Ok(_) => continue,
                Err(err) => return err,
            };
            let frame = match protocol::decode_frame(&data) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(error = %err, "gateway: invalid frame");
                    continue;
                },
            };
            match frame {
                Frame::Event(evt) => match evt.event.as_str() {
                    events::NODE_INVOKE_REQUEST => {
                        let raw = evt.payload.unwrap_or(serde_json::Value::Null);
                        match protocol::parse_invoke_payload(&raw) {
                            Ok(params) => {
                                if let Err(err) = self.handle_invoke(params).await {
                                    warn!(error = %err, "gateway: invoke handler error");
                                }
                            },
                            Err(err) => warn!(error = %err, "gateway: invalid invoke payload"),
                        }
                    },
                    events::SHUTDOWN => {
                        let payload: ShutdownPayload = evt
                            .payload
                            .and_then(|p| serde_json::from_value(p).ok())
                            .unwrap_or_default();
                        let restart_ms = payload
                            .restart_expected_ms
                            .filter(|ms| *ms > 0)
                            .unwrap_or(1000) as u64;
                        info!(
                            reason = payload.reason.as_deref().unwrap_or(""),
                            "gateway shutting down, reconnect in {restart_ms}ms"
                        );
                        return ClientError::Shutdown {
                            backoff: Duration::from_millis(restart_ms),
                        };
                    },
                    events::TICK => debug!("gateway: tick"),
                    events::CONNECT_CHALLENGE | events::VOICEWAKE_CHANGED => {},
                    _ => {},
                },
                Frame::Request(req) => {
                    if req.method == events::NODE_INVOKE_REQUEST {
                        let raw = req.params.unwrap_or(serde_json::Value::Null);
                        match protocol::parse_invoke_payload(&raw) {
                            Ok(params) => {
                                if let Err(err) = self.handle_invoke(params).await {
                                    warn!(error = %err, "gateway: invoke handler error");
                                }
                            },
                            Err(err) => warn!(error = %err, "gateway: invalid invoke payload"),
                        }
                    }
                },
                // No client-originated request awaits a response.
                Frame::Response(_) => {},
            }
        }
    }

    async fn handle_invoke(&self, params: InvokeRequestParams) -> Result<(), ClientError> {
        let outcome = self.on_invoke.handle_invoke(params.clone()).await;
        self.send_invoke_result(&params, outcome).await
    }

    async fn send_invoke_result(
        &self,
        req: &InvokeRequestParams,
        outcome: anyhow::Result<Option<serde_json::Value>>,
    ) -> Result<(), ClientError> {
        let result = match outcome {
            Ok(payload) => InvokeResultParams {
                id: req.request_id.clone(),
                node_id: req.node_id.clone(),
                ok: true,
                payload,
                payload_json: None,
                error: None,
            },
            Err(err) => InvokeResultParams {
                id: req.request_id.clone(),
                node_id: req.node_id.clone(),
                ok: false,
                payload: None,
                payload_json: None,
                error: Some(NodeInvokeError {
                    code: None,
                    message: Some(err.to_string()),
                }),
            },
        };
        let id = self.next_id();
        self.send_request(id, methods::NODE_INVOKE_RESULT, Some(&result))
            .await
    }

    // ── Close classification & device token ──────────────────────────────

    fn classify_close(&self, err: ClientError) -> ClientError {
        match &err {
            ClientError::Closed {
                code: Some(code),
                reason,
            } if *code == CLOSE_POLICY_VIOLATION => {
                let reason = reason.to_lowercase();
                if reason.contains("pairing required") {
                    warn!("pairing required; waiting for approval");
                    return ClientError::PairingRequired;
                }
                if reason.contains("device identity required") {
                    warn!("device identity required; waiting for approval");
                    return ClientError::DeviceIdentityRequired;
                }
                if reason.contains("device token mismatch") {
                    self.clear_device_token();
                }
                err
            },
            _ => err,
        }
    }

    fn adopt_device_token(&self, token: String) {
        *self
            .device_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        if let Some(path) = &self.device_token_path {
            if let Err(err) = device_token::save(path, &token) {
                warn!(error = %err, "gateway: failed to save device token");
            }
        }
    }

    fn clear_device_token(&self) {
        let had_token = self
            .device_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        let Some(path) = &self.device_token_path else {
            return;
        };
        match device_token::clear(path) {
            Ok(()) if had_token => info!("gateway: cleared stale device token"),
            Ok(()) => {},
            Err(err) => warn!(error = %err, "gateway: failed to clear device token"),
        }
    }

    fn device_token_value(&self) -> Option<String> {
        self.device_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ── Backoff ──────────────────────────────────────────────────────────

    /// Sleep out the current backoff, then double it (capped). A cancelled
    /// wait preserves the value.
    async fn wait_backoff(
        &self,
        cancel: &CancellationToken,
        backoff: &mut Duration,
    ) -> Result<(), ClientError> {
        tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            _ = time::sleep(*backoff) => {},
        }
        if *backoff < MAX_BACKOFF {
            *backoff = (*backoff * 2).min(MAX_BACKOFF);
        }
        Ok(())
    }

    fn next_id(&self) -> String {
        let seq = self.request_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let jitter = rand::thread_rng().gen_range(0..10_000);
        format!("{seq}-{jitter}")
    }
}

fn apply_backoff_override(err: &ClientError, backoff: &mut Duration) {
    let Some(target) = err.backoff_override() else {
        return;
    };
    if target.is_zero() {
        return;
    }
    if err.replaces_backoff() {
        *backoff = target;
    } else if *backoff < target {
        *backoff = target;
    }
}

async fn ping_loop(
    writer: SharedWriter,
    interval: Duration,
    cancel: CancellationToken,
    done: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // The first tick completes immediately; pings start one interval in.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = done.cancelled() => return,
            _ = ticker.tick() => {
                let mut writer = writer.lock().await;
                let sent = time::timeout(WRITE_TIMEOUT, writer.send_ping()).await;
                if !matches!(sent, Ok(Ok(()))) {
                    return;
                }
            },
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use tokio::sync::mpsc;

    use inknode_protocol::{EventFrame, RequestFrame, ResponseFrame};

    use crate::node::default_registration;

    // ── Mock transport ─────────────────────────────────────────────────

    #[derive(Debug, PartialEq)]
    enum Written {
        Text(String),
        Ping,
    }

    struct ChanReader {
        rx: mpsc::UnboundedReceiver<Result<Inbound, ClientError>>,
    }

    #[async_trait]
    impl FrameReader for ChanReader {
        async fn next_message(&mut self) -> Result<Inbound, ClientError> {
            match self.rx.recv().await {
                Some(result) => result,
                None => Err(ClientError::Closed {
                    code: None,
                    reason: "connection closed".into(),
                }),
            }
        }
    }

    struct ChanWriter {
        tx: mpsc::UnboundedSender<Written>,
    }

    #[async_trait]
    impl FrameWriter for ChanWriter {
        async fn send_text(&mut self, text: String) -> Result<(), ClientError> {
            let _ = self.tx.send(Written::Text(text));
            Ok(())
        }

        async fn send_ping(&mut self) -> Result<(), ClientError> {
            let _ = self.tx.send(Written::Ping);
            Ok(())
        }
    }

    struct MockConn {
        frames: mpsc::UnboundedSender<Result<Inbound, ClientError>>,
        written: mpsc::UnboundedReceiver<Written>,
    }

    impl MockConn {
        fn push_frame<T: Serialize>(&self, frame: &T) {
            let text = serde_json::to_string(frame).unwrap();
            self.frames.send(Ok(Inbound::Text(text))).unwrap();
        }

        fn push_challenge(&self, nonce: &str) {
            self.push_frame(&EventFrame::new(
                events::CONNECT_CHALLENGE,
                serde_json::json!({ "nonce": nonce }),
            ));
        }

        fn push_hello_ok(&self, id: &str, payload: serde_json::Value) {
            self.push_frame(&ResponseFrame {
                r#type: "res".into(),
                id: id.into(),
                ok: true,
                payload: Some(payload),
                error: None,
            });
        }

        async fn expect_connect_request(&mut self) -> (String, ConnectParams) {
            let written = time::timeout(Duration::from_secs(1), self.written.recv())
                .await
                .expect("connect request not sent")
                .unwrap();
            let Written::Text(text) = written else {
                panic!("unexpected ping before connect");
            };
            let frame: RequestFrame = serde_json::from_str(&text).unwrap();
            assert_eq!(frame.r#type, "req");
            assert_eq!(frame.method, "connect");
            let params: ConnectParams = serde_json::from_value(frame.params.unwrap()).unwrap();
            (frame.id, params)
        }

        async fn expect_no_write(&mut self, wait: Duration) {
            assert!(
                time::timeout(wait, self.written.recv()).await.is_err(),
                "unexpected frame written"
            );
        }
    }

    fn mock_transport() -> (Box<dyn FrameReader>, Box<dyn FrameWriter>, MockConn) {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        (
            Box::new(ChanReader { rx: frame_rx }),
            Box::new(ChanWriter { tx: written_tx }),
            MockConn {
                frames: frame_tx,
                written: written_rx,
            },
        )
    }

    struct NoDialer;

    #[async_trait]
    impl Dialer for NoDialer {
        async fn dial(&self) -> Result<(Box<dyn FrameReader>, Box<dyn FrameWriter>), ClientError> {
            Err(ClientError::Transport("no dialer".into()))
        }
    }

    struct NoopInvoke;

    #[async_trait]
    impl InvokeHandler for NoopInvoke {
        async fn handle_invoke(
            &self,
            _req: InvokeRequestParams,
        ) -> anyhow::Result<Option<serde_json::Value>> {
            Ok(None)
        }
    }

    struct CapturingInvoke {
        tx: mpsc::UnboundedSender<InvokeRequestParams>,
    }

    #[async_trait]
    impl InvokeHandler for CapturingInvoke {
        async fn handle_invoke(
            &self,
            req: InvokeRequestParams,
        ) -> anyhow::Result<Option<serde_json::Value>> {
            let _ = self.tx.send(req);
            Ok(Some(serde_json::json!({ "ok": true })))
        }
    }

    fn test_config() -> Config {
        Config {
            dialer: Arc::new(NoDialer),
            register: default_registration(),
            on_invoke: Arc::new(NoopInvoke),
            on_registered: None,
            ping_interval: Some(Duration::from_secs(3600)),
            auth_token: None,
            auth_password: None,
            identity: None,
            device_token_path: None,
        }
    }

    fn test_identity(dir: &tempfile::TempDir) -> DeviceIdentity {
        DeviceIdentity::load_or_create(dir.path().join("device.json")).unwrap()
    }

    fn spawn_register(
        client: &Arc<Client>,
        mut reader: Box<dyn FrameReader>,
    ) -> tokio::task::JoinHandle<Result<(), ClientError>> {
        let client = Arc::clone(client);
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            client.register_node(&cancel, reader.as_mut()).await
        })
    }

    fn spawn_read_loop(
        client: &Arc<Client>,
        mut reader: Box<dyn FrameReader>,
    ) -> tokio::task::JoinHandle<ClientError> {
        let client = Arc::clone(client);
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            client.read_loop(&cancel, reader.as_mut()).await
        })
    }

    // ── Write discipline ───────────────────────────────────────────────

    struct SerialWriter {
        writing: Arc<AtomicBool>,
    }

    #[async_trait]
    impl FrameWriter for SerialWriter {
        async fn send_text(&mut self, _text: String) -> Result<(), ClientError> {
            assert!(
                !self.writing.swap(true, Ordering::SeqCst),
                "concurrent write"
            );
            time::sleep(Duration::from_millis(1)).await;
            self.writing.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn send_ping(&mut self) -> Result<(), ClientError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn writes_are_serialised_by_the_mutex() {
        let client = Arc::new(Client::new(test_config()));
        client.install_writer(Box::new(SerialWriter {
            writing: Arc::new(AtomicBool::new(false)),
        }));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let client = Arc::clone(&client);
            tasks.push(tokio::spawn(async move {
                client
                    .send_event("node.event", &serde_json::json!({ "event": "test" }))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
    }

    // ── Handshake ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn handshake_with_nonce_persists_device_token() {
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("device-token.json");
        let mut cfg = test_config();
        cfg.identity = Some(test_identity(&dir));
        cfg.device_token_path = Some(token_path.clone());
        let client = Arc::new(Client::new(cfg));

        let (reader, writer, mut conn) = mock_transport();
        client.install_writer(writer);
        let handle = spawn_register(&client, reader);

        conn.push_challenge("nonce-123");
        let (id, params) = conn.expect_connect_request().await;
        assert_eq!(params.min_protocol, PROTOCOL_VERSION);
        assert_eq!(params.max_protocol, PROTOCOL_VERSION);
        let device = params.device.expect("device info in connect params");
        assert!(!device.id.is_empty());
        assert!(!device.public_key.is_empty());
        assert!(!device.signature.is_empty());
        assert_eq!(device.nonce.as_deref(), Some("nonce-123"));

        conn.push_hello_ok(
            &id,
            serde_json::json!({ "type": "hello-ok", "auth": { "deviceToken": "device-token-value" } }),
        );
        handle.await.unwrap().unwrap();

        assert_eq!(
            client.device_token_value().as_deref(),
            Some("device-token-value")
        );
        assert_eq!(
            device_token::load(&token_path).unwrap().as_deref(),
            Some("device-token-value")
        );
    }

    #[tokio::test]
    async fn handshake_sends_configured_auth() {
        let mut cfg = test_config();
        cfg.auth_token = Some("token-value".into());
        cfg.auth_password = Some("password-value".into());
        let client = Arc::new(Client::new(cfg));

        let (reader, writer, mut conn) = mock_transport();
        client.install_writer(writer);
        let handle = spawn_register(&client, reader);

        conn.push_challenge("nonce-123");
        let (id, params) = conn.expect_connect_request().await;
        let auth = params.auth.expect("auth block");
        assert_eq!(auth.token.as_deref(), Some("token-value"));
        assert_eq!(auth.password.as_deref(), Some("password-value"));

        conn.push_hello_ok(&id, serde_json::json!({ "type": "hello-ok" }));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handshake_without_identity_omits_device_block() {
        let client = Client::new(test_config());
        let (_, params) = client.build_connect_request("").unwrap();
        assert!(params.device.is_none());
    }

    #[tokio::test]
    async fn handshake_rejects_non_hello_ok_payload() {
        let client = Arc::new(Client::new(test_config()));
        let (reader, writer, mut conn) = mock_transport();
        client.install_writer(writer);
        let handle = spawn_register(&client, reader);

        conn.push_challenge("nonce-123");
        let (id, _) = conn.expect_connect_request().await;
        conn.push_hello_ok(&id, serde_json::json!({ "type": "not-hello" }));

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::UnexpectedHandshakePayload));
    }

    #[tokio::test]
    async fn handshake_surfaces_server_rejection() {
        let client = Arc::new(Client::new(test_config()));
        let (reader, writer, mut conn) = mock_transport();
        client.install_writer(writer);
        let handle = spawn_register(&client, reader);

        conn.push_challenge("nonce-123");
        let (id, _) = conn.expect_connect_request().await;
        conn.push_frame(&ResponseFrame {
            r#type: "res".into(),
            id,
            ok: false,
            payload: None,
            error: None,
        });

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::ConnectRejected));
    }

    #[tokio::test]
    async fn handshake_surfaces_server_rejection_message() {
        let client = Arc::new(Client::new(test_config()));
        let (reader, writer, mut conn) = mock_transport();
        client.install_writer(writer);
        let handle = spawn_register(&client, reader);

        conn.push_challenge("nonce-123");
        let (id, _) = conn.expect_connect_request().await;
        conn.push_frame(&ResponseFrame {
            r#type: "res".into(),
            id,
            ok: false,
            payload: None,
            error: Some(inknode_protocol::GatewayError {
                message: Some("nope".into()),
                ..Default::default()
            }),
        });

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }

    #[tokio::test]
    async fn handshake_ignores_repeated_nonce() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config();
        cfg.identity = Some(test_identity(&dir));
        let client = Arc::new(Client::new(cfg));

        let (reader, writer, mut conn) = mock_transport();
        client.install_writer(writer);
        let handle = spawn_register(&client, reader);

        conn.push_challenge("nonce-123");
        let (id, _) = conn.expect_connect_request().await;

        conn.push_challenge("nonce-123");
        conn.expect_no_write(Duration::from_millis(20)).await;

        conn.push_hello_ok(&id, serde_json::json!({ "type": "hello-ok" }));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handshake_ignores_empty_nonce() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config();
        cfg.identity = Some(test_identity(&dir));
        let client = Arc::new(Client::new(cfg));

        let (reader, writer, mut conn) = mock_transport();
        client.install_writer(writer);
        let handle = spawn_register(&client, reader);

        conn.push_challenge("");
        conn.expect_no_write(Duration::from_millis(20)).await;

        conn.push_challenge("nonce-456");
        let (id, params) = conn.expect_connect_request().await;
        assert_eq!(
            params.device.unwrap().nonce.as_deref(),
            Some("nonce-456")
        );
        conn.push_hello_ok(&id, serde_json::json!({ "type": "hello-ok" }));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn hello_ok_without_auth_persists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("device-token.json");
        let mut cfg = test_config();
        cfg.device_token_path = Some(token_path.clone());
        let client = Arc::new(Client::new(cfg));

        let (reader, writer, mut conn) = mock_transport();
        client.install_writer(writer);
        let handle = spawn_register(&client, reader);

        conn.push_challenge("nonce-123");
        let (id, _) = conn.expect_connect_request().await;
        conn.push_hello_ok(&id, serde_json::json!({ "type": "hello-ok" }));
        handle.await.unwrap().unwrap();

        assert_eq!(client.device_token_value(), None);
        assert!(!token_path.exists());
    }

    // ── Read loop ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn read_loop_dispatches_invoke_event() {
        let (invoked_tx, mut invoked_rx) = mpsc::unbounded_channel();
        let mut cfg = test_config();
        cfg.on_invoke = Arc::new(CapturingInvoke { tx: invoked_tx });
        let client = Arc::new(Client::new(cfg));

        let (reader, writer, mut conn) = mock_transport();
        client.install_writer(writer);
        let handle = spawn_read_loop(&client, reader);

        conn.push_frame(&EventFrame::new(
            events::NODE_INVOKE_REQUEST,
            serde_json::json!({
                "id": "req-1", "nodeId": "node-1", "command": "canvas.present",
                "params": { "value": true }
            }),
        ));

        let req = time::timeout(Duration::from_secs(1), invoked_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.request_id, "req-1");
        assert_eq!(req.command, "canvas.present");

        // The result travels out-of-band as a node.invoke.result request.
        let written = time::timeout(Duration::from_secs(1), conn.written.recv())
            .await
            .unwrap()
            .unwrap();
        let Written::Text(text) = written else {
            panic!("expected invoke result frame");
        };
        let frame: RequestFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(frame.method, "node.invoke.result");
        let result: InvokeResultParams = serde_json::from_value(frame.params.unwrap()).unwrap();
        assert!(result.ok);
        assert_eq!(result.id, "req-1");
        assert_eq!(result.node_id, "node-1");

        drop(conn);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn read_loop_dispatches_invoke_request_frame() {
        let (invoked_tx, mut invoked_rx) = mpsc::unbounded_channel();
        let mut cfg = test_config();
        cfg.on_invoke = Arc::new(CapturingInvoke { tx: invoked_tx });
        let client = Arc::new(Client::new(cfg));

        let (reader, writer, mut conn) = mock_transport();
        client.install_writer(writer);
        let handle = spawn_read_loop(&client, reader);

        conn.push_frame(&RequestFrame::new(
            "frame-1",
            events::NODE_INVOKE_REQUEST,
            Some(serde_json::json!({
                "id": "req-2", "nodeId": "node-2", "command": "canvas.hide"
            })),
        ));

        let req = time::timeout(Duration::from_secs(1), invoked_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.request_id, "req-2");
        assert_eq!(req.command, "canvas.hide");

        let written = time::timeout(Duration::from_secs(1), conn.written.recv())
            .await
            .unwrap()
            .unwrap();
        let Written::Text(text) = written else {
            panic!("expected invoke result frame");
        };
        let frame: RequestFrame = serde_json::from_str(&text).unwrap();
        // The incoming request id is not echoed; a fresh request id is used.
        assert_ne!(frame.id, "frame-1");
        assert_eq!(frame.method, "node.invoke.result");

        drop(conn);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn read_loop_skips_unknown_tick_and_voicewake_events() {
        let (invoked_tx, mut invoked_rx) = mpsc::unbounded_channel();
        let mut cfg = test_config();
        cfg.on_invoke = Arc::new(CapturingInvoke { tx: invoked_tx });
        let client = Arc::new(Client::new(cfg));

        let (reader, writer, mut conn) = mock_transport();
        client.install_writer(writer);
        let handle = spawn_read_loop(&client, reader);

        conn.push_frame(&EventFrame::new("unknown.event", serde_json::json!({})));
        conn.push_frame(&EventFrame::new(events::TICK, serde_json::json!({})));
        conn.push_frame(&EventFrame::new(
            events::VOICEWAKE_CHANGED,
            serde_json::json!({ "state": "on" }),
        ));
        conn.frames
            .send(Ok(Inbound::Text("not json".into())))
            .unwrap();
        conn.push_frame(&ResponseFrame {
            r#type: "res".into(),
            id: "stray".into(),
            ok: true,
            payload: None,
            error: None,
        });

        time::sleep(Duration::from_millis(50)).await;
        assert!(invoked_rx.try_recv().is_err(), "no invoke expected");

        drop(conn);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn read_loop_shutdown_carries_advertised_backoff() {
        let client = Arc::new(Client::new(test_config()));
        let (reader, writer, conn) = mock_transport();
        client.install_writer(writer);
        let handle = spawn_read_loop(&client, reader);

        conn.push_frame(&EventFrame::new(
            events::SHUTDOWN,
            serde_json::json!({ "reason": "maintenance", "restartExpectedMs": 5000 }),
        ));

        let err = handle.await.unwrap();
        let ClientError::Shutdown { backoff } = err else {
            panic!("expected shutdown error, got {err}");
        };
        assert_eq!(backoff, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn read_loop_shutdown_defaults_to_one_second() {
        let client = Arc::new(Client::new(test_config()));
        let (reader, writer, conn) = mock_transport();
        client.install_writer(writer);
        let handle = spawn_read_loop(&client, reader);

        conn.push_frame(&EventFrame::new(
            events::SHUTDOWN,
            serde_json::json!({ "restartExpectedMs": -1 }),
        ));

        let err = handle.await.unwrap();
        assert!(matches!(
            err,
            ClientError::Shutdown { backoff } if backoff == Duration::from_secs(1)
        ));
    }

    // ── Ping loop ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn ping_loop_emits_pings_until_done() {
        let (_, writer, mut conn) = mock_transport();
        let shared: SharedWriter = Arc::new(Mutex::new(writer));
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let handle = tokio::spawn(ping_loop(
            shared,
            Duration::from_millis(10),
            cancel.clone(),
            done.clone(),
        ));

        for _ in 0..2 {
            let written = time::timeout(Duration::from_secs(1), conn.written.recv())
                .await
                .expect("expected ping frame")
                .unwrap();
            assert_eq!(written, Written::Ping);
        }
        done.cancel();
        handle.await.unwrap();
    }

    // ── Close classification ───────────────────────────────────────────

    #[test]
    fn new_defaults_ping_interval() {
        let mut cfg = test_config();
        cfg.ping_interval = None;
        let client = Client::new(cfg);
        assert_eq!(client.ping_interval, Duration::from_secs(30));

        let mut cfg = test_config();
        cfg.ping_interval = Some(Duration::from_secs(5));
        let client = Client::new(cfg);
        assert_eq!(client.ping_interval, Duration::from_secs(5));
    }

    #[test]
    fn new_loads_persisted_device_token() {
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("device-token.json");
        device_token::save(&token_path, "token-value").unwrap();
        let mut cfg = test_config();
        cfg.device_token_path = Some(token_path);
        let client = Client::new(cfg);
        assert_eq!(client.device_token_value().as_deref(), Some("token-value"));
    }

    #[test]
    fn token_mismatch_close_clears_token() {
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("device-token.json");
        device_token::save(&token_path, "token-value").unwrap();
        let mut cfg = test_config();
        cfg.device_token_path = Some(token_path.clone());
        let client = Client::new(cfg);

        let err = client.classify_close(ClientError::Closed {
            code: Some(CLOSE_POLICY_VIOLATION),
            reason: "device token mismatch".into(),
        });
        assert!(matches!(err, ClientError::Closed { .. }));
        assert_eq!(client.device_token_value(), None);
        assert!(!token_path.exists());
    }

    #[test]
    fn wrong_close_code_or_reason_keeps_token() {
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("device-token.json");
        device_token::save(&token_path, "token-value").unwrap();
        let mut cfg = test_config();
        cfg.device_token_path = Some(token_path.clone());
        let client = Client::new(cfg);

        client.classify_close(ClientError::Closed {
            code: Some(1000),
            reason: "device token mismatch".into(),
        });
        assert!(client.device_token_value().is_some());

        client.classify_close(ClientError::Closed {
            code: Some(CLOSE_POLICY_VIOLATION),
            reason: "other reason".into(),
        });
        assert!(client.device_token_value().is_some());

        client.classify_close(ClientError::Transport("nope".into()));
        assert!(client.device_token_value().is_some());
        assert!(token_path.exists());
    }

    #[test]
    fn pairing_and_identity_closes_map_to_typed_errors() {
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("device-token.json");
        device_token::save(&token_path, "token-value").unwrap();
        let mut cfg = test_config();
        cfg.device_token_path = Some(token_path.clone());
        let client = Client::new(cfg);

        let err = client.classify_close(ClientError::Closed {
            code: Some(CLOSE_POLICY_VIOLATION),
            reason: "pairing required".into(),
        });
        assert_eq!(err.backoff_override(), Some(Duration::from_secs(10)));

        let err = client.classify_close(ClientError::Closed {
            code: Some(CLOSE_POLICY_VIOLATION),
            reason: "device identity required".into(),
        });
        assert_eq!(err.backoff_override(), Some(Duration::from_secs(10)));

        // Neither clears the token.
        assert!(client.device_token_value().is_some());
        assert!(token_path.exists());
    }

    // ── Send paths ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn send_event_without_connection_fails() {
        let client = Client::new(test_config());
        let err = client
            .send_event("node.event", &serde_json::json!({ "event": "test" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn send_event_marshals_request_frame() {
        let client = Client::new(test_config());
        let (_, writer, mut conn) = mock_transport();
        client.install_writer(writer);

        let raw = RawValue::from_string(r#"{"ok":true}"#.into()).unwrap();
        let params = inknode_protocol::NodeEventParams::new("hello", raw);
        client.send_event("node.event", &params).await.unwrap();

        let Written::Text(text) = conn.written.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        let frame: RequestFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(frame.r#type, "req");
        assert_eq!(frame.method, "node.event");
        let params = frame.params.unwrap();
        assert_eq!(params["event"], "hello");
        assert_eq!(params["payload"]["ok"], true);
    }

    #[tokio::test]
    async fn invoke_result_success_and_error_shapes() {
        let client = Client::new(test_config());
        let (_, writer, mut conn) = mock_transport();
        client.install_writer(writer);

        let req = InvokeRequestParams {
            request_id: "req-1".into(),
            node_id: "node-1".into(),
            command: "cmd".into(),
            args: None,
        };
        client
            .send_invoke_result(&req, Ok(Some(serde_json::json!({ "status": "ok" }))))
            .await
            .unwrap();
        let Written::Text(text) = conn.written.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        let frame: RequestFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(frame.method, "node.invoke.result");
        let result: InvokeResultParams = serde_json::from_value(frame.params.unwrap()).unwrap();
        assert!(result.ok);
        assert_eq!(result.payload, Some(serde_json::json!({ "status": "ok" })));

        client
            .send_invoke_result(&req, Err(anyhow::anyhow!("bad")))
            .await
            .unwrap();
        let Written::Text(text) = conn.written.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        let frame: RequestFrame = serde_json::from_str(&text).unwrap();
        let result: InvokeResultParams = serde_json::from_value(frame.params.unwrap()).unwrap();
        assert!(!result.ok);
        assert_eq!(result.error.unwrap().message.as_deref(), Some("bad"));
    }

    // ── Connect-auth selection ─────────────────────────────────────────

    #[test]
    fn select_auth_prefers_explicit_token() {
        let mut cfg = test_config();
        cfg.auth_token = Some("shared-token".into());
        let client = Client::new(cfg);
        *client.device_token.lock().unwrap() = Some("device-token".into());

        let (auth, token) = client.select_connect_auth();
        assert_eq!(auth.unwrap().token.as_deref(), Some("shared-token"));
        assert_eq!(token, "shared-token");
    }

    #[test]
    fn select_auth_falls_back_to_device_token_with_password() {
        let mut cfg = test_config();
        cfg.auth_password = Some("password".into());
        let client = Client::new(cfg);
        *client.device_token.lock().unwrap() = Some("device-token".into());

        let (auth, token) = client.select_connect_auth();
        let auth = auth.unwrap();
        assert_eq!(auth.token.as_deref(), Some("device-token"));
        assert_eq!(auth.password.as_deref(), Some("password"));
        assert_eq!(token, "device-token");
    }

    #[test]
    fn select_auth_password_only() {
        let mut cfg = test_config();
        cfg.auth_password = Some("password".into());
        let client = Client::new(cfg);

        let (auth, token) = client.select_connect_auth();
        let auth = auth.unwrap();
        assert!(auth.token.is_none());
        assert_eq!(auth.password.as_deref(), Some("password"));
        assert_eq!(token, "");
    }

    #[test]
    fn select_auth_none() {
        let client = Client::new(test_config());
        let (auth, token) = client.select_connect_auth();
        assert!(auth.is_none());
        assert_eq!(token, "");
    }

    // ── Connect request builder ────────────────────────────────────────

    #[test]
    fn build_connect_request_includes_nonce() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config();
        cfg.identity = Some(test_identity(&dir));
        let client = Client::new(cfg);

        let (_, params) = client.build_connect_request("nonce-1").unwrap();
        assert_eq!(params.device.unwrap().nonce.as_deref(), Some("nonce-1"));

        let (_, params) = client.build_connect_request("").unwrap();
        assert_eq!(params.device.unwrap().nonce, None);
    }

    #[test]
    fn build_connect_request_carries_registration_fields() {
        let mut permissions = serde_json::Map::new();
        permissions.insert("nodes.register".into(), serde_json::Value::Bool(true));
        let mut cfg = test_config();
        cfg.register = NodeRegistration {
            client: inknode_protocol::ClientInfo {
                id: "client-id".into(),
                display_name: Some("Display".into()),
                version: "1.0".into(),
                platform: "linux".into(),
                device_family: Some("kobo".into()),
                model_identifier: Some("model".into()),
                mode: "node".into(),
                instance_id: Some("instance-1".into()),
            },
            role: "node".into(),
            caps: vec!["canvas".into()],
            commands: vec!["canvas.present".into()],
            permissions: Some(permissions.clone()),
            path_env: Some("/usr/bin".into()),
            scopes: vec!["scope-a".into()],
            locale: Some("en-US".into()),
            user_agent: Some("ua".into()),
        };
        let client = Client::new(cfg);

        let (_, params) = client.build_connect_request("").unwrap();
        assert_eq!(params.client.id, "client-id");
        assert_eq!(params.client.instance_id.as_deref(), Some("instance-1"));
        assert_eq!(params.role.as_deref(), Some("node"));
        assert_eq!(params.permissions, Some(permissions));
        assert_eq!(params.path_env.as_deref(), Some("/usr/bin"));
        assert_eq!(params.scopes, Some(vec!["scope-a".to_string()]));
        assert_eq!(params.locale.as_deref(), Some("en-US"));
        assert_eq!(params.user_agent.as_deref(), Some("ua"));
        assert!(params.device.is_none());
    }

    // ── Backoff ────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_and_caps() {
        let client = Client::new(test_config());
        let cancel = CancellationToken::new();

        let mut backoff = Duration::from_millis(1);
        client.wait_backoff(&cancel, &mut backoff).await.unwrap();
        assert_eq!(backoff, Duration::from_millis(2));

        let mut backoff = Duration::from_secs(16);
        client.wait_backoff(&cancel, &mut backoff).await.unwrap();
        assert_eq!(backoff, MAX_BACKOFF);

        let mut backoff = MAX_BACKOFF;
        client.wait_backoff(&cancel, &mut backoff).await.unwrap();
        assert_eq!(backoff, MAX_BACKOFF);
    }

    #[tokio::test]
    async fn cancelled_backoff_preserves_value() {
        let client = Client::new(test_config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut backoff = MAX_BACKOFF;
        let err = client.wait_backoff(&cancel, &mut backoff).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(backoff, MAX_BACKOFF);
    }

    #[test]
    fn backoff_override_rules() {
        let mut backoff = Duration::from_secs(4);
        apply_backoff_override(
            &ClientError::Shutdown {
                backoff: Duration::from_secs(2),
            },
            &mut backoff,
        );
        assert_eq!(backoff, Duration::from_secs(2), "shutdown replaces");

        let mut backoff = Duration::from_secs(4);
        apply_backoff_override(&ClientError::PairingRequired, &mut backoff);
        assert_eq!(backoff, Duration::from_secs(10), "pairing raises");

        let mut backoff = Duration::from_secs(20);
        apply_backoff_override(&ClientError::PairingRequired, &mut backoff);
        assert_eq!(backoff, Duration::from_secs(20), "pairing never lowers");

        let mut backoff = Duration::from_secs(4);
        apply_backoff_override(&ClientError::Transport("x".into()), &mut backoff);
        assert_eq!(backoff, Duration::from_secs(4));
    }
}
