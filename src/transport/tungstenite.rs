//! [`WebSocketIo`] on top of tokio-tungstenite.
//!
//! The connection itself runs as a task on the IO runtime; the transport
//! state machine talks to it through two unbounded channels and never awaits.

use std::sync::Arc;

use base64::prelude::*;
use futures_util::{SinkExt, StreamExt};
use rustls::pki_types::CertificateDer;
use rustls::pki_types::pem::PemObject;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};

use super::endpoint::{EndpointInfo, ProxyInfo, TrustedCertificate};
use super::events::DisconnectReason;
use super::message::WirePayload;
use super::socket::{SocketEvent, WebSocketIo};
use crate::error::{Error, Result};
use crate::error_info::WebSocketError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Command {
    Send(u64, WirePayload),
    Close(u16, String),
}

pub struct TungsteniteSocket {
    runtime: Handle,
    commands: Option<mpsc::UnboundedSender<Command>>,
    events: Option<mpsc::UnboundedReceiver<SocketEvent>>,
    task: Option<JoinHandle<()>>,
}

impl TungsteniteSocket {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            commands: None,
            events: None,
            task: None,
        }
    }
}

impl WebSocketIo for TungsteniteSocket {
    fn open(&mut self, endpoint: &EndpointInfo, headers: &[(String, String)]) -> Result<()> {
        if self.task.is_some() {
            return Err(Error::InvalidState("socket is already open".into()));
        }
        let request = build_request(endpoint, headers)?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        self.commands = Some(cmd_tx);
        self.events = Some(event_rx);
        self.task = Some(self.runtime.spawn(run_connection(
            endpoint.clone(),
            request,
            cmd_rx,
            event_tx,
        )));
        Ok(())
    }

    fn send(&mut self, frame_id: u64, payload: WirePayload) -> Result<()> {
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| Error::InvalidState("socket is not open".into()))?;
        commands
            .send(Command::Send(frame_id, payload))
            .map_err(|_| Error::InvalidState("connection task has exited".into()))
    }

    fn close(&mut self, reason: DisconnectReason, detail: &str) {
        if let Some(commands) = &self.commands {
            let _ = commands.send(Command::Close(reason.code(), detail.to_string()));
        }
    }

    fn force_close(&mut self) {
        self.commands = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn poll_event(&mut self) -> Option<SocketEvent> {
        self.events.as_mut()?.try_recv().ok()
    }
}

impl Drop for TungsteniteSocket {
    fn drop(&mut self) {
        self.force_close();
    }
}

fn build_request(endpoint: &EndpointInfo, headers: &[(String, String)]) -> Result<Request<()>> {
    let url = endpoint.url()?;
    let host = match endpoint.port {
        Some(port) => format!("{}:{}", endpoint.host, port),
        None => endpoint.host.clone(),
    };

    let mut builder = Request::builder()
        .method("GET")
        .uri(url.as_str())
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key());
    if !endpoint.protocols.is_empty() {
        builder = builder.header("Sec-WebSocket-Protocol", endpoint.protocols.join(", "));
    }
    for (name, value) in endpoint.headers().iter().chain(headers) {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(())
        .map_err(|e| Error::InvalidEndpoint(format!("cannot build upgrade request: {}", e)))
}

fn tls_connector(trusted: &TrustedCertificate) -> std::result::Result<Connector, String> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(trusted.pem.as_bytes()) {
        let cert = cert.map_err(|e| format!("invalid trusted certificate: {:?}", e))?;
        roots
            .add(cert)
            .map_err(|e| format!("unusable trusted certificate: {}", e))?;
    }
    if roots.is_empty() {
        return Err("no certificate found in the trusted PEM".into());
    }
    if !trusted.disable_crl_check {
        log::debug!("no revocation lists configured; the trusted certificate is pinned as the only root");
    }

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| e.to_string())?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(Connector::Rustls(Arc::new(config)))
}

/// Opens an HTTP CONNECT tunnel through `proxy` to `host:port`.
async fn proxy_tunnel(proxy: &ProxyInfo, host: &str, port: u16) -> std::result::Result<TcpStream, String> {
    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
        .await
        .map_err(|e| format!("cannot reach proxy {}:{}: {}", proxy.host, proxy.port, e))?;

    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let Some(username) = &proxy.username {
        let credentials = format!("{}:{}", username, proxy.password.as_deref().unwrap_or_default());
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64_STANDARD.encode(credentials)
        ));
    }
    request.push_str("\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| format!("proxy write failed: {}", e))?;

    // 逐字节读取响应头，避免吞掉隧道里的数据
    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() > 8192 {
            return Err("proxy response headers too large".into());
        }
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| format!("proxy read failed: {}", e))?;
        if n == 0 {
            return Err("proxy closed the connection".into());
        }
        response.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&response);
    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok());
    match status {
        Some(200) => Ok(stream),
        Some(code) => Err(format!("proxy CONNECT returned {}", code)),
        None => Err("malformed proxy response".into()),
    }
}

fn open_failure(error: WsError) -> SocketEvent {
    match error {
        WsError::Http(response) => SocketEvent::OpenFailed {
            kind: WebSocketError::UpgradeFailed,
            status: Some(response.status().as_u16()),
            headers: response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        value.to_str().unwrap_or_default().to_string(),
                    )
                })
                .collect(),
            message: response
                .body()
                .as_ref()
                .map(|body| String::from_utf8_lossy(body).into_owned())
                .unwrap_or_default(),
        },
        WsError::Io(e) => {
            let message = e.to_string();
            let kind = if message.contains("lookup") {
                WebSocketError::DnsFailure
            } else {
                WebSocketError::ConnectionFailure
            };
            SocketEvent::OpenFailed {
                kind,
                status: None,
                headers: Vec::new(),
                message,
            }
        }
        other => SocketEvent::OpenFailed {
            kind: WebSocketError::ConnectionFailure,
            status: None,
            headers: Vec::new(),
            message: other.to_string(),
        },
    }
}

async fn connect(endpoint: &EndpointInfo, request: Request<()>) -> std::result::Result<WsStream, SocketEvent> {
    let connection_failure = |message: String| SocketEvent::OpenFailed {
        kind: WebSocketError::ConnectionFailure,
        status: None,
        headers: Vec::new(),
        message,
    };

    let connector = match &endpoint.trusted_certificate {
        Some(trusted) => Some(tls_connector(trusted).map_err(connection_failure)?),
        None => None,
    };

    let result = match &endpoint.proxy {
        None => tokio_tungstenite::connect_async_tls_with_config(request, None, true, connector).await,
        Some(proxy) => {
            let tunnel = proxy_tunnel(proxy, &endpoint.host, endpoint.port_or_default())
                .await
                .map_err(connection_failure)?;
            tokio_tungstenite::client_async_tls_with_config(request, tunnel, None, connector).await
        }
    };
    result.map(|(stream, _)| stream).map_err(open_failure)
}

async fn run_connection(
    endpoint: EndpointInfo,
    request: Request<()>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SocketEvent>,
) {
    log::info!("Connecting to {}...", endpoint.host);
    let stream = match connect(&endpoint, request).await {
        Ok(stream) => stream,
        Err(failure) => {
            log::warn!("websocket open failed: {:?}", failure);
            let _ = events.send(failure);
            let _ = events.send(SocketEvent::Closed);
            return;
        }
    };
    log::info!("Connected to {}", endpoint.host);
    let _ = events.send(SocketEvent::Opened);

    let (mut write, mut read) = stream.split();
    let mut closing = false;
    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let _ = events.send(SocketEvent::Text(text.as_str().to_string()));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let _ = events.send(SocketEvent::Binary(data));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        if !closing {
                            let (code, reason) = frame
                                .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                                .unwrap_or((DisconnectReason::Normal.code(), String::new()));
                            log::info!("Server closed connection: {} {}", code, reason);
                            let _ = events.send(SocketEvent::PeerClosed { code, reason });
                        }
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = events.send(SocketEvent::Error {
                            kind: WebSocketError::WebSocket,
                            code: -1,
                            message: e.to_string(),
                        });
                        break;
                    }
                    None => {
                        if !closing {
                            let _ = events.send(SocketEvent::PeerClosed {
                                code: 1006,
                                reason: "connection dropped".into(),
                            });
                        }
                        break;
                    }
                }
            }
            cmd = commands.recv(), if !closing => {
                match cmd {
                    Some(Command::Send(frame_id, payload)) => {
                        let message = match payload {
                            WirePayload::Text(text) => Message::Text(text.into()),
                            WirePayload::Binary(data) => Message::Binary(data),
                        };
                        let ok = match write.send(message).await {
                            Ok(()) => true,
                            Err(e) => {
                                log::warn!("websocket send failed: {}", e);
                                false
                            }
                        };
                        let _ = events.send(SocketEvent::Sent { frame_id, ok });
                    }
                    Some(Command::Close(code, reason)) => {
                        closing = true;
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        if write.send(Message::Close(Some(frame))).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    let _ = events.send(SocketEvent::Closed);
}
