//! Headless Chromium engine speaking the DevTools protocol directly.
//!
//! One browser process and one WebSocket connection serve the whole run.
//! Isolated sessions map to DevTools browser contexts (fresh cookies and
//! storage per record); pages attach as flattened target sessions so every
//! command is multiplexed over the single connection and correlated back
//! through an id -> oneshot pending map.

use async_trait::async_trait;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::engine::{BrowserContext, BrowserEngine, EngineOptions, Page};
use crate::errors::PipelineError;

const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Grace period after `document.readyState` turns complete, standing in for
/// true network quiescence.
const NAVIGATION_SETTLE: Duration = Duration::from_millis(500);

type CommandResult = Result<Value, String>;
type PendingMap = HashMap<u64, oneshot::Sender<CommandResult>>;
type Pending = Arc<Mutex<PendingMap>>;

/// Shared DevTools connection.
struct CdpConnection {
    next_id: AtomicU64,
    pending: Pending,
    outbound: mpsc::UnboundedSender<Message>,
}

impl CdpConnection {
    async fn connect(ws_url: &str) -> Result<Self, PipelineError> {
        let (stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| PipelineError::Engine(format!("DevTools connect failed: {e}")))?;
        let (mut sink, mut source) = stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let pending_reader = pending.clone();
        tokio::spawn(async move {
            while let Some(Ok(msg)) = source.next().await {
                let Ok(text) = msg.to_text() else { continue };
                let Ok(value) = serde_json::from_str::<Value>(text) else {
                    continue;
                };
                // Responses carry an id; protocol events do not. Navigation
                // and visibility are polled, so events are dropped here.
                let Some(id) = value.get("id").and_then(Value::as_u64) else {
                    continue;
                };
                let Some(tx) = pending_reader.lock().await.remove(&id) else {
                    continue;
                };
                let result = if let Some(err) = value.get("error") {
                    Err(err
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown DevTools error")
                        .to_string())
                } else {
                    Ok(value.get("result").cloned().unwrap_or(Value::Null))
                };
                let _ = tx.send(result);
            }
            debug!("DevTools connection closed");
        });

        Ok(Self {
            next_id: AtomicU64::new(1),
            pending,
            outbound,
        })
    }

    async fn call(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value, PipelineError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut message = json!({ "id": id, "method": method, "params": params });
        if let Some(sid) = session_id {
            message["sessionId"] = json!(sid);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self
            .outbound
            .send(Message::Text(message.to_string()))
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(PipelineError::Engine(
                "DevTools connection is closed".into(),
            ));
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(PipelineError::Engine(format!("{method}: {e}"))),
            Ok(Err(_)) => Err(PipelineError::Engine(format!(
                "{method}: response channel dropped"
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(PipelineError::Engine(format!(
                    "{method}: no response within {COMMAND_TIMEOUT:?}"
                )))
            }
        }
    }
}

/// The bundled [`BrowserEngine`] implementation.
pub struct CdpEngine {
    conn: Arc<CdpConnection>,
    child: Mutex<Option<Child>>,
    // Keeps the profile directory alive for the engine's lifetime.
    _user_data_dir: tempfile::TempDir,
}

impl CdpEngine {
    /// Launch a browser child process and connect to its DevTools endpoint.
    pub async fn launch(options: &EngineOptions) -> Result<Self, PipelineError> {
        let binary = resolve_browser_binary(options)?;
        let user_data_dir = tempfile::tempdir()?;

        let mut cmd = Command::new(&binary);
        cmd.arg("--remote-debugging-port=0")
            .arg(format!(
                "--user-data-dir={}",
                user_data_dir.path().display()
            ))
            .args([
                "--no-sandbox",
                "--disable-dev-shm-usage",
                "--disable-accelerated-2d-canvas",
                "--no-first-run",
                "--no-zygote",
                "--disable-gpu",
                "--window-size=1366,768",
                "--disable-blink-features=AutomationControlled",
                "--disable-infobars",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if options.headless {
            cmd.arg("--headless=new");
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| PipelineError::Engine(format!("failed to launch {binary:?}: {e}")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PipelineError::Engine("browser stderr was not captured".into()))?;

        let ws_url = tokio::time::timeout(LAUNCH_TIMEOUT, scrape_devtools_url(stderr))
            .await
            .map_err(|_| {
                PipelineError::Timeout(format!(
                    "browser did not announce a DevTools endpoint within {LAUNCH_TIMEOUT:?}"
                ))
            })??;
        debug!(%ws_url, "Browser launched");

        let conn = CdpConnection::connect(&ws_url).await?;
        Ok(Self {
            conn: Arc::new(conn),
            child: Mutex::new(Some(child)),
            _user_data_dir: user_data_dir,
        })
    }
}

#[async_trait]
impl BrowserEngine for CdpEngine {
    async fn new_context(&self) -> Result<Box<dyn BrowserContext>, PipelineError> {
        let result = self
            .conn
            .call(
                None,
                "Target.createBrowserContext",
                json!({ "disposeOnDetach": true }),
            )
            .await?;
        let context_id = result
            .get("browserContextId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                PipelineError::Engine("createBrowserContext returned no context id".into())
            })?
            .to_string();
        Ok(Box::new(CdpContext {
            conn: self.conn.clone(),
            context_id,
        }))
    }

    async fn shutdown(&self) -> Result<(), PipelineError> {
        // Ask politely first; the child is killed if it lingers.
        let _ = self.conn.call(None, "Browser.close", json!({})).await;
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if tokio::time::timeout(Duration::from_secs(5), child.wait())
                .await
                .is_err()
            {
                warn!("Browser did not exit in time, killing it");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        Ok(())
    }
}

struct CdpContext {
    conn: Arc<CdpConnection>,
    context_id: String,
}

#[async_trait]
impl BrowserContext for CdpContext {
    async fn new_page(&self) -> Result<Box<dyn Page>, PipelineError> {
        let created = self
            .conn
            .call(
                None,
                "Target.createTarget",
                json!({ "url": "about:blank", "browserContextId": self.context_id }),
            )
            .await?;
        let target_id = created
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::Engine("createTarget returned no target id".into()))?
            .to_string();

        let attached = self
            .conn
            .call(
                None,
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::Engine("attachToTarget returned no session id".into()))?
            .to_string();

        let page = CdpPage {
            conn: self.conn.clone(),
            session_id,
            target_id,
            closed: AtomicBool::new(false),
        };
        page.call("Page.enable", json!({})).await?;
        page.call("Runtime.enable", json!({})).await?;
        Ok(Box::new(page))
    }

    async fn close(&self) -> Result<(), PipelineError> {
        self.conn
            .call(
                None,
                "Target.disposeBrowserContext",
                json!({ "browserContextId": self.context_id }),
            )
            .await?;
        Ok(())
    }
}

struct CdpPage {
    conn: Arc<CdpConnection>,
    session_id: String,
    target_id: String,
    closed: AtomicBool,
}

impl CdpPage {
    async fn call(&self, method: &str, params: Value) -> Result<Value, PipelineError> {
        self.conn.call(Some(&self.session_id), method, params).await
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, PipelineError> {
        let result = self
            .call(
                "Runtime.evaluate",
                json!({ "expression": expression, "returnByValue": true, "awaitPromise": true }),
            )
            .await?;
        if result.get("exceptionDetails").is_some() {
            let description = result
                .pointer("/exceptionDetails/exception/description")
                .and_then(Value::as_str)
                .unwrap_or("unknown script exception");
            return Err(PipelineError::Engine(format!(
                "script threw: {description}"
            )));
        }
        Ok(result.pointer("/result/value").cloned().unwrap_or(Value::Null))
    }

    /// Viewport-space center of the first element matching `selector`.
    async fn element_center(&self, selector: &str) -> Result<(f64, f64), PipelineError> {
        let expr = format!(
            "(() => {{ const el = document.querySelector({sel}); if (!el) return null; \
             const r = el.getBoundingClientRect(); \
             return [r.left + r.width / 2, r.top + r.height / 2]; }})()",
            sel = js_string(selector)
        );
        match self.evaluate(&expr).await? {
            Value::Array(coords) if coords.len() == 2 => Ok((
                coords[0].as_f64().unwrap_or(0.0),
                coords[1].as_f64().unwrap_or(0.0),
            )),
            _ => Err(PipelineError::ElementNotFound(selector.to_string())),
        }
    }

    async fn mouse_event(&self, kind: &str, x: f64, y: f64) -> Result<(), PipelineError> {
        let mut params = json!({ "type": kind, "x": x, "y": y });
        if kind != "mouseMoved" {
            params["button"] = json!("left");
            params["clickCount"] = json!(1);
        }
        self.call("Input.dispatchMouseEvent", params).await?;
        Ok(())
    }
}

#[async_trait]
impl Page for CdpPage {
    async fn set_viewport(&self, width: u32, height: u32) -> Result<(), PipelineError> {
        self.call(
            "Emulation.setDeviceMetricsOverride",
            json!({ "width": width, "height": height, "deviceScaleFactor": 1, "mobile": false }),
        )
        .await?;
        Ok(())
    }

    async fn set_user_agent(&self, user_agent: &str) -> Result<(), PipelineError> {
        self.call(
            "Emulation.setUserAgentOverride",
            json!({ "userAgent": user_agent }),
        )
        .await?;
        Ok(())
    }

    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), PipelineError> {
        let navigation = async {
            let result = self.call("Page.navigate", json!({ "url": url })).await?;
            if let Some(error_text) = result.get("errorText").and_then(Value::as_str) {
                if !error_text.is_empty() {
                    return Err(PipelineError::Navigation(format!("{url}: {error_text}")));
                }
            }
            loop {
                let ready = self.evaluate("document.readyState").await?;
                if ready.as_str() == Some("complete") {
                    break;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            tokio::time::sleep(NAVIGATION_SETTLE).await;
            Ok(())
        };
        tokio::time::timeout(timeout, navigation)
            .await
            .map_err(|_| {
                PipelineError::Timeout(format!("navigation to {url} timed out after {timeout:?}"))
            })?
    }

    async fn wait_visible(&self, selector: &str, timeout: Duration) -> Result<(), PipelineError> {
        let expr = format!(
            "(() => {{ const el = document.querySelector({sel}); if (!el) return false; \
             const r = el.getBoundingClientRect(); const s = getComputedStyle(el); \
             return r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none'; }})()",
            sel = js_string(selector)
        );
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.evaluate(&expr).await?.as_bool() == Some(true) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PipelineError::Timeout(format!(
                    "element {selector} not visible after {timeout:?}"
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn scroll_into_view(&self, selector: &str) -> Result<(), PipelineError> {
        let expr = format!(
            "(() => {{ const el = document.querySelector({sel}); if (!el) return false; \
             el.scrollIntoView({{ block: 'center', inline: 'center' }}); return true; }})()",
            sel = js_string(selector)
        );
        match self.evaluate(&expr).await?.as_bool() {
            Some(true) => Ok(()),
            _ => Err(PipelineError::ElementNotFound(selector.to_string())),
        }
    }

    async fn hover(&self, selector: &str) -> Result<(), PipelineError> {
        let (x, y) = self.element_center(selector).await?;
        self.mouse_event("mouseMoved", x, y).await
    }

    async fn click(&self, selector: &str) -> Result<(), PipelineError> {
        let (x, y) = self.element_center(selector).await?;
        self.mouse_event("mouseMoved", x, y).await?;
        self.mouse_event("mousePressed", x, y).await?;
        self.mouse_event("mouseReleased", x, y).await
    }

    async fn type_char(&self, ch: char) -> Result<(), PipelineError> {
        self.call("Input.insertText", json!({ "text": ch.to_string() }))
            .await?;
        Ok(())
    }

    async fn screenshot(&self, path: &Path) -> Result<(), PipelineError> {
        let result = self
            .call("Page.captureScreenshot", json!({ "format": "png" }))
            .await?;
        let data = result
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::Engine("captureScreenshot returned no data".into()))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| PipelineError::Engine(format!("invalid screenshot payload: {e}")))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), PipelineError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.conn
            .call(
                None,
                "Target.closeTarget",
                json!({ "targetId": self.target_id }),
            )
            .await?;
        Ok(())
    }
}

async fn scrape_devtools_url(stderr: ChildStderr) -> Result<String, PipelineError> {
    let mut lines = BufReader::new(stderr).lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(rest) = line.strip_prefix("DevTools listening on ") {
            return Ok(rest.trim().to_string());
        }
        if let Some(pos) = line.find("ws://") {
            return Ok(line[pos..].trim().to_string());
        }
    }
    Err(PipelineError::Engine(
        "browser exited before announcing a DevTools endpoint".into(),
    ))
}

fn resolve_browser_binary(options: &EngineOptions) -> Result<PathBuf, PipelineError> {
    if let Some(path) = &options.browser_path {
        return Ok(path.clone());
    }
    if let Ok(path) = std::env::var("FORMWATCH_BROWSER") {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    const CANDIDATES: [&str; 5] = [
        "chromium",
        "chromium-browser",
        "google-chrome",
        "google-chrome-stable",
        "chrome",
    ];
    for candidate in CANDIDATES {
        if let Some(found) = find_on_path(candidate) {
            return Ok(found);
        }
    }
    Err(PipelineError::Engine(
        "no Chromium binary found; set FORMWATCH_BROWSER or install chromium".into(),
    ))
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| String::from("\"\""))
}
