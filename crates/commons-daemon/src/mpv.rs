/// mpv-backed audio sources.
///
/// Every `MpvSource` is its own mpv process with its own IPC endpoint, which
/// is what lets two streams overlap during a crossfade.
///
/// ```text
///   MpvBackend::open(url, gain)
///         │
///         ├── MpvDriver::spawn_and_connect()
///         │       ├── writer_task   ← MpvRequest via mpsc → socket
///         │       └── reader_task   ← JSON lines from socket
///         │                              ├── response (request_id) → oneshot
///         │                              └── event / property-change → translator
///         └── translator task  → SourceEvent { Playing | Failed } → controller
/// ```
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use commons_proto::error::FailureKind;
use commons_proto::platform;

use crate::audio::{AudioBackend, AudioSource, SourceEvent, SourceEventKind, SourceId};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// observe_property id for `core-idle`; false means audio is flowing.
const OBS_CORE_IDLE: u64 = 1;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String,
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
struct MpvEvent {
    raw: Value,
}

impl MpvEvent {
    fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    fn str_field(&self, name: &str) -> Option<&str> {
        self.raw.get(name)?.as_str()
    }
}

// ── IPC handle ────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    async fn load_stream(&self, url: &str) -> anyhow::Result<()> {
        self.send(json!(["loadfile", url])).await?;
        Ok(())
    }

    async fn set_volume(&self, gain: f32) -> anyhow::Result<()> {
        self.send(json!(["set_property", "volume", mpv_volume(gain)]))
            .await?;
        Ok(())
    }

    async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    async fn observe_core_idle(&self) -> anyhow::Result<()> {
        self.send(json!(["observe_property", OBS_CORE_IDLE, "core-idle"]))
            .await?;
        Ok(())
    }
}

/// mpv's `volume` property is cubic; convert a linear amplitude gain.
fn mpv_volume(gain: f32) -> f64 {
    (f64::from(gain.clamp(0.0, 1.0)).cbrt() * 100.0).clamp(0.0, 100.0)
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns one mpv child process and its IPC endpoint.
struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
}

impl MpvDriver {
    fn new(socket_name: String) -> Self {
        Self {
            socket_name,
            process: None,
        }
    }

    async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
        #[cfg(unix)]
        {
            let _ = tokio::fs::remove_file(&self.socket_name).await;
        }
    }

    fn spawn_process(&mut self, gain: f32) -> anyhow::Result<()> {
        let mpv_binary =
            platform::find_mpv_binary().ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg(platform::mpv_socket_arg(&self.socket_name))
            .arg("--quiet")
            .arg(format!("--volume={:.1}", mpv_volume(gain)))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    async fn spawn_and_connect(
        &mut self,
        gain: f32,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        debug!("mpv: spawning process for {}", self.socket_name);
        self.spawn_process(gain)?;

        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }

        let stream = UnixStream::connect(&socket_path).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(BufReader::new(read_half), write_half, event_tx))
    }

    #[cfg(windows)]
    async fn spawn_and_connect(
        &mut self,
        gain: f32,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        debug!("mpv: spawning process for {}", self.socket_name);
        self.spawn_process(gain)?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(
                    BufReader::new(read_half),
                    write_half,
                    event_tx,
                ));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

fn start_io_tasks<R, W>(
    reader: BufReader<R>,
    writer: W,
    event_tx: mpsc::Sender<MpvEvent>,
) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(writer, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(reader, pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    event_tx: mpsc::Sender<MpvEvent>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_pending(&pending, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"].as_str().unwrap_or("unknown error");
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    }
                } else {
                    debug!("mpv reader: event {}", trimmed);
                    if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_pending(&pending, "mpv IPC read error").await;
                break;
            }
        }
    }
}

async fn fail_pending(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register before writing so the reader can match the reply.
        pending.lock().await.insert(req.req_id, req.reply);
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── event translation ─────────────────────────────────────────────────────────

/// What a single mpv event means for the source, if anything.
fn classify_event(evt: &MpvEvent) -> Option<SourceEventKind> {
    if let Some((OBS_CORE_IDLE, data)) = evt.as_property_change() {
        return (data.as_bool() == Some(false)).then_some(SourceEventKind::Playing);
    }
    if evt.event_name() != Some("end-file") {
        return None;
    }
    match evt.str_field("reason").unwrap_or("unknown") {
        "error" => Some(SourceEventKind::Failed(classify_file_error(
            evt.str_field("file_error").unwrap_or(""),
        ))),
        // A live stream reaching EOF means the server hung up.
        "eof" => Some(SourceEventKind::Failed(FailureKind::Network)),
        _ => None,
    }
}

fn classify_file_error(file_error: &str) -> FailureKind {
    let lower = file_error.to_ascii_lowercase();
    if ["format", "codec", "demux", "no audio"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        FailureKind::Decode
    } else {
        FailureKind::Network
    }
}

async fn translate_events(
    id: SourceId,
    url: String,
    mut rx: mpsc::Receiver<MpvEvent>,
    events: mpsc::Sender<SourceEvent>,
    released: Arc<AtomicBool>,
) {
    let mut started = false;
    while let Some(evt) = rx.recv().await {
        if released.load(Ordering::Acquire) {
            return;
        }
        let kind = match classify_event(&evt) {
            Some(SourceEventKind::Playing) if started => continue,
            Some(kind) => kind,
            None => continue,
        };
        let terminal = matches!(kind, SourceEventKind::Failed(_));
        started |= kind == SourceEventKind::Playing;
        let _ = events
            .send(SourceEvent {
                source: id,
                url: url.clone(),
                kind,
            })
            .await;
        if terminal {
            return;
        }
    }
    if !released.load(Ordering::Acquire) {
        warn!("mpv source {} lost its process", id);
        let _ = events
            .send(SourceEvent {
                source: id,
                url,
                kind: SourceEventKind::Failed(FailureKind::Network),
            })
            .await;
    }
}

// ── backend ───────────────────────────────────────────────────────────────────

pub struct MpvBackend {
    events: mpsc::Sender<SourceEvent>,
    next_id: AtomicU64,
}

impl MpvBackend {
    pub fn new(events: mpsc::Sender<SourceEvent>) -> Self {
        Self {
            events,
            next_id: AtomicU64::new(1),
        }
    }
}

#[derive(Clone)]
pub struct MpvSource {
    id: SourceId,
    url: String,
    handle: MpvHandle,
    driver: Arc<Mutex<MpvDriver>>,
    released: Arc<AtomicBool>,
}

impl AudioBackend for MpvBackend {
    type Source = MpvSource;

    async fn open(&self, url: &str, gain: f32) -> anyhow::Result<MpvSource> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut driver = MpvDriver::new(platform::mpv_socket_name(id));
        let (mpv_tx, mpv_rx) = mpsc::channel::<MpvEvent>(64);

        let handle = match driver.spawn_and_connect(gain, mpv_tx).await {
            Ok(h) => h,
            Err(e) => {
                driver.kill().await;
                return Err(e);
            }
        };

        let released = Arc::new(AtomicBool::new(false));
        tokio::spawn(translate_events(
            id,
            url.to_string(),
            mpv_rx,
            self.events.clone(),
            Arc::clone(&released),
        ));

        let started = async {
            handle.observe_core_idle().await?;
            handle.load_stream(url).await
        };
        if let Err(e) = started.await {
            released.store(true, Ordering::Release);
            driver.kill().await;
            return Err(e);
        }

        info!("mpv: source {} opened {}", id, url);
        Ok(MpvSource {
            id,
            url: url.to_string(),
            handle,
            driver: Arc::new(Mutex::new(driver)),
            released,
        })
    }
}

impl AudioSource for MpvSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn url(&self) -> &str {
        &self.url
    }

    async fn set_gain(&self, gain: f32) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.handle.set_volume(gain).await {
            debug!("mpv: source {} set volume failed: {}", self.id, e);
        }
    }

    async fn set_paused(&self, paused: bool) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.handle.set_pause(paused).await {
            warn!("mpv: source {} set pause failed: {}", self.id, e);
        }
    }

    async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.handle.stop().await;
        self.driver.lock().await.kill().await;
        debug!("mpv: source {} released", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(raw: Value) -> MpvEvent {
        MpvEvent { raw }
    }

    #[test]
    fn core_idle_false_means_playing() {
        let e = event(json!({"event": "property-change", "id": 1, "name": "core-idle", "data": false}));
        assert_eq!(classify_event(&e), Some(SourceEventKind::Playing));
        let e = event(json!({"event": "property-change", "id": 1, "name": "core-idle", "data": true}));
        assert_eq!(classify_event(&e), None);
    }

    #[test]
    fn end_file_reasons() {
        let e = event(json!({"event": "end-file", "reason": "error", "file_error": "unrecognized file format"}));
        assert_eq!(
            classify_event(&e),
            Some(SourceEventKind::Failed(FailureKind::Decode))
        );
        let e = event(json!({"event": "end-file", "reason": "error", "file_error": "loading failed"}));
        assert_eq!(
            classify_event(&e),
            Some(SourceEventKind::Failed(FailureKind::Network))
        );
        let e = event(json!({"event": "end-file", "reason": "eof"}));
        assert_eq!(
            classify_event(&e),
            Some(SourceEventKind::Failed(FailureKind::Network))
        );
        let e = event(json!({"event": "end-file", "reason": "stop"}));
        assert_eq!(classify_event(&e), None);
    }

    #[tokio::test]
    async fn translator_reports_once_and_flags_lost_process() {
        let (mpv_tx, mpv_rx) = mpsc::channel(8);
        let (src_tx, mut src_rx) = mpsc::channel(8);
        let released = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(translate_events(
            7,
            "http://a".into(),
            mpv_rx,
            src_tx,
            released,
        ));

        for idle in [false, true, false] {
            mpv_tx
                .send(event(json!({"event": "property-change", "id": 1, "data": idle})))
                .await
                .unwrap();
        }
        drop(mpv_tx);
        task.await.unwrap();

        let first = src_rx.recv().await.unwrap();
        assert_eq!(first.kind, SourceEventKind::Playing);
        assert_eq!(first.source, 7);
        let second = src_rx.recv().await.unwrap();
        assert_eq!(second.kind, SourceEventKind::Failed(FailureKind::Network));
        assert!(src_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn translator_is_silent_after_release() {
        let (mpv_tx, mpv_rx) = mpsc::channel(8);
        let (src_tx, mut src_rx) = mpsc::channel(8);
        let released = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(translate_events(
            1,
            "http://a".into(),
            mpv_rx,
            src_tx,
            released,
        ));
        mpv_tx
            .send(event(json!({"event": "end-file", "reason": "eof"})))
            .await
            .unwrap();
        drop(mpv_tx);
        task.await.unwrap();
        assert!(src_rx.recv().await.is_none());
    }

    #[test]
    fn volume_is_cube_root_scaled() {
        assert_eq!(mpv_volume(0.0), 0.0);
        assert!((mpv_volume(1.0) - 100.0).abs() < 1e-9);
        assert!((mpv_volume(0.125) - 50.0).abs() < 1e-6);
        assert_eq!(mpv_volume(2.0), 100.0);
    }
}
