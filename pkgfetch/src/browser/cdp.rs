//! Chrome DevTools Protocol channel.
//!
//! Each attempt gets its own tab created through the debugger's HTTP
//! endpoint (`/json/new`). Commands and events share one WebSocket: a writer
//! task drains outgoing frames, a reader task routes command replies to their
//! waiting callers by id and fans download events out to subscribers.
//!
//! The debugger runs locally, so its HTTP client never goes through a proxy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace, warn};

use super::{BrowserChannel, BrowserConnector, DownloadEvent, DownloadSink, DownloadState};
use crate::clock::BoxFuture;
use crate::error::{FetchError, FetchResult};

/// Default DevTools HTTP endpoint.
pub const DEFAULT_DEBUGGER_URL: &str = "http://127.0.0.1:9222";

/// Time allowed for one protocol command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

type Reply = Result<Value, String>;

/// Target description returned by `/json/new`.
#[derive(Debug, Deserialize)]
struct TargetInfo {
    id: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    ws_url: String,
}

#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DownloadEvent>>>,
}

/// Opens DevTools tabs on a running Chromium.
#[derive(Debug, Clone)]
pub struct CdpConnector {
    endpoint: String,
    client: reqwest::Client,
}

impl CdpConnector {
    /// Create a connector for a DevTools endpoint such as `http://127.0.0.1:9222`.
    pub fn new(endpoint: impl Into<String>) -> FetchResult<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(COMMAND_TIMEOUT)
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Connector for a browser on the default local debugging port.
    pub fn local() -> FetchResult<Self> {
        Self::new(DEFAULT_DEBUGGER_URL)
    }

    async fn open_tab(&self) -> FetchResult<Box<dyn BrowserChannel>> {
        let url = format!("{}/json/new?about:blank", self.endpoint);
        let body = self
            .client
            .put(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| FetchError::Browser(format!("cannot open tab: {}", e)))?
            .bytes()
            .await
            .map_err(|e| FetchError::Browser(format!("cannot read target description: {}", e)))?;
        let target: TargetInfo = serde_json::from_slice(&body)
            .map_err(|e| FetchError::Browser(format!("invalid target description: {}", e)))?;

        let (socket, _) = tokio_tungstenite::connect_async(target.ws_url.as_str())
            .await
            .map_err(|e| FetchError::Browser(format!("websocket connect failed: {}", e)))?;
        debug!(target = %target.id, "Opened browser tab");

        let (sink, stream) = socket.split();
        let mut channel = CdpChannel::start(sink, stream);
        channel.endpoint = Some((self.endpoint.clone(), self.client.clone()));
        channel.target_id = target.id;

        // Page.* download events are only emitted with the Page domain enabled.
        if let Err(e) = channel.call("Page.enable", json!({})).await {
            debug!(error = %e, "Page.enable failed");
        }

        Ok(Box::new(channel))
    }
}

impl BrowserConnector for CdpConnector {
    fn open(&self) -> BoxFuture<'_, FetchResult<Box<dyn BrowserChannel>>> {
        Box::pin(self.open_tab())
    }
}

/// One DevTools tab.
pub struct CdpChannel {
    next_id: u64,
    outgoing: mpsc::UnboundedSender<String>,
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    endpoint: Option<(String, reqwest::Client)>,
    target_id: String,
}

impl CdpChannel {
    /// Start the reader and writer tasks over an established socket.
    fn start<W, R>(sink: W, stream: R) -> Self
    where
        W: Sink<Message, Error = WsError> + Unpin + Send + 'static,
        R: Stream<Item = Result<Message, WsError>> + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let (outgoing, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(sink, rx));
        let reader = tokio::spawn(read_loop(stream, Arc::clone(&shared)));
        Self {
            next_id: 1,
            outgoing,
            shared,
            reader,
            writer,
            endpoint: None,
            target_id: String::new(),
        }
    }

    /// Send a command and wait for its reply.
    async fn call(&mut self, method: &str, params: Value) -> FetchResult<Value> {
        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);
        let frame = json!({ "id": id, "method": method, "params": params }).to_string();
        trace!(id, method, "CDP command");
        if self.outgoing.send(frame).is_err() {
            self.shared.pending.lock().remove(&id);
            return Err(FetchError::Browser("connection closed".to_string()));
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                Err(FetchError::Browser(format!("{} timed out", method)))
            }
            Ok(Err(_)) => Err(FetchError::Browser("connection closed".to_string())),
            Ok(Ok(Err(message))) => Err(FetchError::Browser(format!("{} failed: {}", method, message))),
            Ok(Ok(Ok(result))) => Ok(result),
        }
    }

    async fn apply_sink(&mut self, sink: &DownloadSink) -> FetchResult<()> {
        let params = match sink {
            DownloadSink::Allow(dir) => json!({
                "behavior": "allow",
                "downloadPath": dir.to_string_lossy(),
            }),
            DownloadSink::Deny => json!({ "behavior": "deny" }),
        };

        let mut browser_params = params.clone();
        browser_params["eventsEnabled"] = Value::Bool(true);
        match self.call("Browser.setDownloadBehavior", browser_params).await {
            Ok(_) => Ok(()),
            Err(e) => {
                debug!(error = %e, "Browser.setDownloadBehavior failed, trying Page domain");
                self.call("Page.setDownloadBehavior", params).await.map(|_| ())
            }
        }
    }

    async fn go(&mut self, url: &str) -> FetchResult<()> {
        let result = self.call("Page.navigate", json!({ "url": url })).await?;
        match result.get("errorText").and_then(Value::as_str) {
            Some(error) if !error.is_empty() && error != "net::ERR_ABORTED" => {
                Err(FetchError::Browser(format!("navigation to {} failed: {}", url, error)))
            }
            _ => Ok(()),
        }
    }
}

impl BrowserChannel for CdpChannel {
    fn set_download_sink<'a>(&'a mut self, sink: &'a DownloadSink) -> BoxFuture<'a, FetchResult<()>> {
        Box::pin(self.apply_sink(sink))
    }

    fn navigate<'a>(&'a mut self, url: &'a str) -> BoxFuture<'a, FetchResult<()>> {
        Box::pin(self.go(url))
    }

    fn subscribe(&mut self) -> Option<mpsc::UnboundedReceiver<DownloadEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subscribers.lock().push(tx);
        Some(rx)
    }

    fn cancel_download<'a>(&'a mut self, guid: &'a str) -> BoxFuture<'a, FetchResult<()>> {
        Box::pin(async move {
            self.call("Browser.cancelDownload", json!({ "guid": guid }))
                .await
                .map(|_| ())
        })
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, FetchResult<()>> {
        let channel = *self;
        Box::pin(async move {
            channel.reader.abort();
            channel.writer.abort();
            if let Some((endpoint, client)) = channel.endpoint {
                let url = format!("{}/json/close/{}", endpoint, channel.target_id);
                if let Err(e) = client.get(&url).send().await {
                    warn!(error = %e, "Failed to close browser tab");
                }
            }
            Ok(())
        })
    }
}

async fn write_loop<W>(mut sink: W, mut rx: mpsc::UnboundedReceiver<String>)
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = sink.send(Message::Text(frame)).await {
            debug!(error = %e, "CDP socket write failed");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop<R>(mut stream: R, shared: Arc<Shared>)
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };

        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            if let Some(tx) = shared.pending.lock().remove(&id) {
                let reply = match value.get("error") {
                    Some(error) => Err(error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string()),
                    None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
                };
                let _ = tx.send(reply);
            }
        } else if let Some(event) = parse_event(&value) {
            trace!(?event, "CDP download event");
            shared
                .subscribers
                .lock()
                .retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    // Dropping the senders wakes every waiting caller with "closed".
    shared.pending.lock().clear();
    shared.subscribers.lock().clear();
}

/// Parse a download event from a protocol message.
///
/// Accepts both the `Browser.` and `Page.` variants of
/// `downloadWillBegin` and `downloadProgress`.
pub fn parse_event(message: &Value) -> Option<DownloadEvent> {
    let method = message.get("method")?.as_str()?;
    let params = message.get("params")?;
    let guid = params.get("guid")?.as_str()?.to_string();
    let text = |key: &str| {
        params
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let bytes = |key: &str| params.get(key).and_then(Value::as_f64).unwrap_or(0.0).max(0.0) as u64;

    if method.ends_with(".downloadWillBegin") {
        Some(DownloadEvent::WillBegin {
            guid,
            url: text("url"),
            suggested_filename: text("suggestedFilename"),
        })
    } else if method.ends_with(".downloadProgress") {
        let state = match params.get("state").and_then(Value::as_str) {
            Some("completed") => DownloadState::Completed,
            Some("canceled") => DownloadState::Canceled,
            _ => DownloadState::InProgress,
        };
        Some(DownloadEvent::Progress {
            guid,
            received: bytes("receivedBytes"),
            total: bytes("totalBytes"),
            state,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_will_begin() {
        let msg = json!({
            "method": "Browser.downloadWillBegin",
            "params": {
                "frameId": "F1",
                "guid": "g-1",
                "url": "https://cdn.example.com/game.apk",
                "suggestedFilename": "game.apk"
            }
        });
        assert_eq!(
            parse_event(&msg),
            Some(DownloadEvent::WillBegin {
                guid: "g-1".to_string(),
                url: "https://cdn.example.com/game.apk".to_string(),
                suggested_filename: "game.apk".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_progress() {
        let msg = json!({
            "method": "Page.downloadProgress",
            "params": {
                "guid": "g-1",
                "totalBytes": 2048.0,
                "receivedBytes": 1024.0,
                "state": "completed"
            }
        });
        assert_eq!(
            parse_event(&msg),
            Some(DownloadEvent::Progress {
                guid: "g-1".to_string(),
                received: 1024,
                total: 2048,
                state: DownloadState::Completed,
            })
        );
    }

    #[test]
    fn test_parse_ignores_other_messages() {
        assert_eq!(parse_event(&json!({ "id": 3, "result": {} })), None);
        assert_eq!(
            parse_event(&json!({ "method": "Page.frameNavigated", "params": { "guid": "x" } })),
            None
        );
    }

    /// Minimal DevTools peer: acknowledges every command and emits one
    /// download event after the first command.
    async fn fake_devtools() -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let mut methods = Vec::new();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let value: Value = serde_json::from_str(&text).unwrap();
                let id = value["id"].as_u64().unwrap();
                methods.push(value["method"].as_str().unwrap().to_string());
                let reply = json!({ "id": id, "result": {} }).to_string();
                ws.send(Message::Text(reply)).await.unwrap();
                if methods.len() == 2 {
                    let event = json!({
                        "method": "Browser.downloadWillBegin",
                        "params": { "guid": "g-9", "url": "https://cdn/x.apk", "suggestedFilename": "x.apk" }
                    });
                    ws.send(Message::Text(event.to_string())).await.unwrap();
                }
            }
            methods
        });
        (format!("ws://{}", addr), handle)
    }

    #[tokio::test]
    async fn test_open_tab_routes_replies_and_events() {
        let (ws_url, peer) = fake_devtools().await;
        let mut server = mockito::Server::new_async().await;
        let new_tab = server
            .mock("PUT", mockito::Matcher::Regex("^/json/new".to_string()))
            .with_status(200)
            .with_body(json!({ "id": "T1", "webSocketDebuggerUrl": ws_url }).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/json/close/T1")
            .with_status(200)
            .create_async()
            .await;

        let connector = CdpConnector::new(server.url()).unwrap();
        let mut channel = connector.open().await.unwrap();
        new_tab.assert_async().await;

        let mut events = channel.subscribe().unwrap();
        channel
            .set_download_sink(&DownloadSink::Allow(PathBuf::from("/tmp/dl")))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.guid(), "g-9");

        channel.close().await.unwrap();
        let methods = peer.await.unwrap();
        assert_eq!(methods, vec!["Page.enable", "Browser.setDownloadBehavior"]);
    }

    #[tokio::test]
    async fn test_malformed_target_description_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", mockito::Matcher::Regex("^/json/new".to_string()))
            .with_status(200)
            .with_body(r#"{"id": "T1"}"#)
            .create_async()
            .await;

        let connector = CdpConnector::new(server.url()).unwrap();
        let err = match connector.open().await {
            Ok(_) => panic!("tab opened without a websocket url"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("invalid target description"), "{}", err);
    }
}
