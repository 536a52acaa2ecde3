//! Protocol engine over a sidecar process.
//!
//! Each client is one child process speaking newline-delimited JSON on stdio. The child
//! announces its device with a `hello` line, answers numbered requests with `response`
//! lines and pushes `event` and `pairing` lines whenever the protocol produces them.

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hookgate_core::{
    config::Config,
    engine::{
        port::{EngineClient, ProtocolEngine},
        types::{EngineEvent, MediaAttachment, PairingEvent, Presence},
    },
    errors::Error,
    Result,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::{mpsc, oneshot, Mutex},
};
use tracing::{debug, info, warn};

const STDERR_TAIL_MAX_BYTES: usize = 16 * 1024;
const STDERR_TAIL_MAX_LINES: usize = 200;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const HELLO_TIMEOUT: Duration = Duration::from_secs(30);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_QR_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Forwarded as `HOOKGATE_ENGINE_DEBUG`.
    pub debug: Option<String>,
    pub request_timeout: Duration,
}

impl BridgeConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            program: cfg.engine_bridge_path.clone(),
            args: Vec::new(),
            debug: cfg.engine_debug.clone(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrTail {
    fn push_line(&mut self, line: String) {
        self.bytes = self.bytes.saturating_add(line.len() + 1);
        self.lines.push_back(line);

        while self.lines.len() > STDERR_TAIL_MAX_LINES || self.bytes > STDERR_TAIL_MAX_BYTES {
            match self.lines.pop_front() {
                Some(front) => self.bytes = self.bytes.saturating_sub(front.len() + 1),
                None => break,
            }
        }
    }

    fn snapshot(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
struct DeviceInfo {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    push_name: Option<String>,
}

/// Lines the child writes to stdout.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Inbound {
    Hello {
        #[serde(default)]
        device: DeviceInfo,
    },
    Response {
        id: u64,
        ok: bool,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<String>,
    },
    Event {
        #[serde(rename = "type")]
        event_type: String,
        #[serde(default)]
        event: Value,
    },
    Pairing {
        event: String,
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
        #[serde(default)]
        error: Option<String>,
    },
}

fn parse_inbound(line: &str) -> Result<Inbound> {
    Ok(serde_json::from_str(line)?)
}

fn pairing_event(
    event: &str,
    code: Option<String>,
    timeout_secs: Option<u64>,
    error: Option<String>,
) -> PairingEvent {
    match event {
        "code" => match code {
            Some(code) => PairingEvent::Code {
                code,
                timeout: Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_QR_TIMEOUT_SECS)),
            },
            None => PairingEvent::Error("code event without code".to_string()),
        },
        "success" => PairingEvent::Success,
        "timeout" => PairingEvent::Timeout,
        "error" => PairingEvent::Error(error.unwrap_or_else(|| "unknown pairing error".to_string())),
        other => PairingEvent::Error(format!("unexpected pairing event: {other}")),
    }
}

/// Build one request line: `{"id": n, "op": op, ...args}`.
fn request_line(id: u64, op: &str, args: Value) -> Result<String> {
    let mut msg = json!({ "id": id, "op": op });
    if let (Some(obj), Value::Object(extra)) = (msg.as_object_mut(), args) {
        obj.extend(extra);
    }
    let mut line = serde_json::to_string(&msg)?;
    line.push('\n');
    Ok(line)
}

type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;
type PairingSlot = Arc<StdMutex<Option<mpsc::UnboundedSender<PairingEvent>>>>;

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct BridgeEngine {
    cfg: BridgeConfig,
}

impl BridgeEngine {
    pub fn new(cfg: BridgeConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl ProtocolEngine for BridgeEngine {
    async fn open_client(&self, identity: Option<&str>) -> Result<Arc<dyn EngineClient>> {
        let client = BridgeClient::spawn(&self.cfg, identity).await?;
        Ok(client as Arc<dyn EngineClient>)
    }
}

pub struct BridgeClient {
    device: DeviceInfo,
    connected: Arc<AtomicBool>,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Option<Child>>,
    pending: Pending,
    pairing: PairingSlot,
    events: StdMutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
    next_id: AtomicU64,
    request_timeout: Duration,
    stderr_tail: Arc<Mutex<StderrTail>>,
}

impl BridgeClient {
    async fn spawn(cfg: &BridgeConfig, identity: Option<&str>) -> Result<Arc<Self>> {
        let mut cmd = Command::new(&cfg.program);
        cmd.args(&cfg.args)
            .env("HOOKGATE_DEVICE", identity.unwrap_or_default())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(level) = &cfg.debug {
            cmd.env("HOOKGATE_ENGINE_DEBUG", level);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::Engine(format!(
                "failed to start engine bridge {}: {e}",
                cfg.program.display()
            ))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Engine("bridge stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Engine("bridge stdout was not captured".to_string()))?;

        let stderr_tail = Arc::new(Mutex::new(StderrTail::default()));
        // Drain stderr in background to avoid blocking on a full pipe.
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut r = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    debug!(target: "hookgate_bridge::engine", "{line}");
                    tail.lock().await.push_line(line);
                }
            });
        }

        let mut lines = BufReader::new(stdout).lines();
        let device = match tokio::time::timeout(HELLO_TIMEOUT, read_hello(&mut lines)).await {
            Ok(Ok(device)) => device,
            Ok(Err(e)) => {
                let tail = stderr_tail.lock().await.snapshot();
                return Err(Error::Engine(format!("{e}\n{tail}").trim_end().to_string()));
            }
            Err(_) => return Err(Error::Engine("engine bridge did not say hello".to_string())),
        };
        info!(
            paired = device.id.as_deref().is_some_and(|s| !s.is_empty()),
            "engine bridge started"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            device,
            connected: Arc::new(AtomicBool::new(false)),
            stdin: Mutex::new(stdin),
            child: Mutex::new(Some(child)),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            pairing: Arc::new(StdMutex::new(None)),
            events: StdMutex::new(Some(events_rx)),
            next_id: AtomicU64::new(0),
            request_timeout: cfg.request_timeout,
            stderr_tail,
        });

        let reader = Reader {
            connected: client.connected.clone(),
            pending: client.pending.clone(),
            pairing: client.pairing.clone(),
            events: events_tx,
            stderr_tail: client.stderr_tail.clone(),
        };
        tokio::spawn(reader.run(lines));
        Ok(client)
    }

    async fn request(&self, op: &str, args: Value, timeout: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let line = request_line(id, op, args)?;
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        let written = {
            let mut stdin = self.stdin.lock().await;
            match stdin.write_all(line.as_bytes()).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            lock(&self.pending).remove(&id);
            return Err(Error::Engine(format!("bridge write failed ({op}): {e}")));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(Error::Engine(format!("engine bridge exited during {op}"))),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(Error::Engine(format!(
                    "{op} timed out after {}s",
                    timeout.as_secs()
                )))
            }
        }
    }

    async fn kill_child(&self) -> Result<()> {
        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            return Ok(());
        };
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        match child.kill().await {
            Ok(()) => Ok(()),
            Err(e) => {
                if child.try_wait()?.is_none() {
                    *self.child.lock().await = Some(child);
                    return Err(Error::Io(e));
                }
                Ok(())
            }
        }
    }
}

async fn read_hello(lines: &mut Lines<BufReader<ChildStdout>>) -> Result<DeviceInfo> {
    loop {
        let Some(line) = lines.next_line().await? else {
            return Err(Error::Engine(
                "engine bridge exited before hello".to_string(),
            ));
        };
        if line.trim().is_empty() {
            continue;
        }
        return match parse_inbound(&line) {
            Ok(Inbound::Hello { device }) => Ok(device),
            Ok(other) => Err(Error::Engine(format!(
                "expected hello from engine bridge, got {other:?}"
            ))),
            Err(e) => Err(Error::Engine(format!("bad hello line: {e}"))),
        };
    }
}

/// Routes stdout lines to request waiters, the event stream and the pairing channel.
struct Reader {
    connected: Arc<AtomicBool>,
    pending: Pending,
    pairing: PairingSlot,
    events: mpsc::UnboundedSender<EngineEvent>,
    stderr_tail: Arc<Mutex<StderrTail>>,
}

impl Reader {
    async fn run(self, mut lines: Lines<BufReader<ChildStdout>>) {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if !line.trim().is_empty() {
                        self.route(&line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "engine bridge stdout read failed");
                    break;
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        // Dropping the senders wakes every waiter with a "bridge exited" error.
        lock(&self.pending).clear();
        lock(&self.pairing).take();
        let tail = self.stderr_tail.lock().await.snapshot();
        if tail.is_empty() {
            info!("engine bridge exited");
        } else {
            warn!(stderr = %tail, "engine bridge exited");
        }
    }

    fn route(&self, line: &str) {
        let msg = match parse_inbound(line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "unparseable engine bridge line");
                return;
            }
        };
        match msg {
            Inbound::Hello { .. } => debug!("ignoring repeated hello"),
            Inbound::Response {
                id,
                ok,
                result,
                error,
            } => {
                let Some(waiter) = lock(&self.pending).remove(&id) else {
                    debug!(id, "response for unknown request");
                    return;
                };
                let res = if ok {
                    Ok(result)
                } else {
                    Err(Error::Engine(
                        error.unwrap_or_else(|| "engine request failed".to_string()),
                    ))
                };
                let _ = waiter.send(res);
            }
            Inbound::Event { event_type, event } => {
                let ev = EngineEvent::decode(&event_type, event);
                match &ev {
                    EngineEvent::Connected => self.connected.store(true, Ordering::SeqCst),
                    EngineEvent::Disconnected | EngineEvent::LoggedOut(_) => {
                        self.connected.store(false, Ordering::SeqCst)
                    }
                    _ => {}
                }
                let _ = self.events.send(ev);
            }
            Inbound::Pairing {
                event,
                code,
                timeout_secs,
                error,
            } => {
                let ev = pairing_event(&event, code, timeout_secs, error);
                let sent = lock(&self.pairing)
                    .as_ref()
                    .map(|tx| tx.send(ev).is_ok())
                    .unwrap_or(false);
                if !sent {
                    debug!(event = %event, "pairing event without listener");
                }
            }
        }
    }
}

#[async_trait]
impl EngineClient for BridgeClient {
    fn has_credentials(&self) -> bool {
        self.device.id.as_deref().is_some_and(|s| !s.is_empty())
    }

    fn push_name(&self) -> Option<String> {
        self.device.push_name.clone().filter(|s| !s.is_empty())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        lock(&self.events).take()
    }

    async fn pairing_events(&self) -> Result<mpsc::UnboundedReceiver<PairingEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.pairing) = Some(tx);
        self.request("qr_channel", json!({}), self.request_timeout)
            .await?;
        Ok(rx)
    }

    async fn connect(&self) -> Result<()> {
        self.request("connect", json!({}), self.request_timeout)
            .await
            .map(|_| ())
    }

    async fn disconnect(&self) {
        if let Err(e) = self
            .request("disconnect", json!({}), DISCONNECT_TIMEOUT)
            .await
        {
            debug!(error = %e, "bridge disconnect request failed");
        }
        self.connected.store(false, Ordering::SeqCst);
        if let Err(e) = self.kill_child().await {
            warn!(error = %e, "failed to stop engine bridge");
        }
    }

    async fn request_pairing_code(&self, phone: &str) -> Result<String> {
        let res = self
            .request("pair_phone", json!({ "phone": phone }), self.request_timeout)
            .await?;
        res.get("code")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::Engine("pair_phone response without code".to_string()))
    }

    async fn download(&self, media: &MediaAttachment) -> Result<Vec<u8>> {
        let res = self
            .request("download", json!({ "media": media }), self.request_timeout)
            .await?;
        let data = res
            .get("data")
            .and_then(|d| d.as_str())
            .ok_or_else(|| Error::Engine("download response without data".to_string()))?;
        STANDARD
            .decode(data)
            .map_err(|e| Error::Engine(format!("download payload is not base64: {e}")))
    }

    async fn send_presence(&self, presence: Presence) -> Result<()> {
        self.request(
            "presence",
            json!({ "state": presence.as_str() }),
            self.request_timeout,
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_line_kind() {
        let hello = parse_inbound(r#"{"kind":"hello","device":{"id":"5511@s.whatsapp.net","push_name":"Bot"}}"#)
            .unwrap();
        assert_eq!(
            hello,
            Inbound::Hello {
                device: DeviceInfo {
                    id: Some("5511@s.whatsapp.net".to_string()),
                    push_name: Some("Bot".to_string()),
                }
            }
        );

        let resp = parse_inbound(r#"{"kind":"response","id":3,"ok":false,"error":"nope"}"#).unwrap();
        assert!(matches!(resp, Inbound::Response { id: 3, ok: false, .. }));

        let ev = parse_inbound(r#"{"kind":"event","type":"Presence","event":{"from":"x"}}"#).unwrap();
        let Inbound::Event { event_type, event } = ev else {
            panic!("expected event");
        };
        assert_eq!(event_type, "Presence");
        assert!(matches!(
            EngineEvent::decode(&event_type, event),
            EngineEvent::Presence(_)
        ));

        assert!(parse_inbound(r#"{"kind":"mystery"}"#).is_err());
    }

    #[test]
    fn pairing_lines_map_to_events() {
        assert_eq!(
            pairing_event("code", Some("2@x".to_string()), Some(20), None),
            PairingEvent::Code {
                code: "2@x".to_string(),
                timeout: Duration::from_secs(20)
            }
        );
        assert_eq!(pairing_event("success", None, None, None), PairingEvent::Success);
        assert_eq!(pairing_event("timeout", None, None, None), PairingEvent::Timeout);
        assert!(matches!(
            pairing_event("code", None, None, None),
            PairingEvent::Error(_)
        ));
    }

    #[test]
    fn request_line_merges_args() {
        let line = request_line(7, "pair_phone", json!({"phone": "5511"})).unwrap();
        assert!(line.ends_with('\n'));
        let v: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(v, json!({"id": 7, "op": "pair_phone", "phone": "5511"}));
    }

    #[test]
    fn stderr_tail_is_bounded() {
        let mut tail = StderrTail::default();
        for i in 0..(STDERR_TAIL_MAX_LINES + 50) {
            tail.push_line(format!("line {i}"));
        }
        assert_eq!(tail.lines.len(), STDERR_TAIL_MAX_LINES);
        assert!(tail.snapshot().ends_with(&format!("line {}", STDERR_TAIL_MAX_LINES + 49)));
    }

    /// Minimal engine: says hello, acks every request, emits Connected after connect.
    const FAKE_ENGINE: &str = r#"
echo "{\"kind\":\"hello\",\"device\":{\"id\":\"$HOOKGATE_DEVICE\",\"push_name\":\"Bot\"}}"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/^{"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"op":"connect"'*)
      echo "{\"kind\":\"response\",\"id\":$id,\"ok\":true,\"result\":{}}"
      echo '{"kind":"event","type":"Connected","event":{}}'
      ;;
    *'"op":"download"'*)
      echo "{\"kind\":\"response\",\"id\":$id,\"ok\":true,\"result\":{\"data\":\"aGVsbG8=\"}}"
      ;;
    *'"op":"disconnect"'*)
      echo "{\"kind\":\"response\",\"id\":$id,\"ok\":true,\"result\":{}}"
      exit 0
      ;;
    *)
      echo "{\"kind\":\"response\",\"id\":$id,\"ok\":true,\"result\":{}}"
      ;;
  esac
done
"#;

    fn fake_engine(dir: &std::path::Path) -> BridgeEngine {
        let script = dir.join("engine.sh");
        std::fs::write(&script, FAKE_ENGINE).unwrap();
        BridgeEngine::new(BridgeConfig {
            program: PathBuf::from("/bin/sh"),
            args: vec![script.display().to_string()],
            debug: None,
            request_timeout: Duration::from_secs(5),
        })
    }

    #[tokio::test]
    async fn talks_to_a_child_process() {
        let dir = tempfile::tempdir().unwrap();
        let engine = fake_engine(dir.path());

        let client = engine.open_client(Some("5511@s.whatsapp.net")).await.unwrap();
        assert!(client.has_credentials());
        assert_eq!(client.push_name().as_deref(), Some("Bot"));

        let mut events = client.take_events().unwrap();
        assert!(client.take_events().is_none());
        client.connect().await.unwrap();
        let ev = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev, EngineEvent::Connected);
        assert!(client.is_connected());

        let media = MediaAttachment {
            kind: hookgate_core::engine::types::MessageKind::Image,
            mime_type: "image/jpeg".to_string(),
            file_name: None,
            handle: json!({}),
        };
        assert_eq!(client.download(&media).await.unwrap(), b"hello");

        client.disconnect().await;
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn fresh_device_has_no_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let client = fake_engine(dir.path()).open_client(None).await.unwrap();
        assert!(!client.has_credentials());
        client.disconnect().await;
    }

    #[tokio::test]
    async fn missing_program_is_an_engine_error() {
        let engine = BridgeEngine::new(BridgeConfig {
            program: PathBuf::from("/nonexistent/hookgate-engine"),
            args: Vec::new(),
            debug: None,
            request_timeout: Duration::from_secs(1),
        });
        let err = engine.open_client(None).await.err().unwrap();
        assert!(matches!(err, Error::Engine(_)));
    }
}
