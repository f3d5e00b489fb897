//! ---
//! fleet_section: "11-test-harness"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "test"
//! fleet_description: "Scripted mutual-TLS WebSocket server for transport tests."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::pki::TestPki;

/// One action the peer performs on an accepted connection.
#[derive(Debug, Clone)]
pub enum PeerStep {
    /// Stall before the TLS handshake; only honoured as a leading step.
    DelayHandshake(Duration),
    Sleep(Duration),
    SendText(String),
    SendBinary(Vec<u8>),
    /// Read until the client goes away, recording text frames.
    Hold,
}

type Script = dyn Fn(usize) -> Vec<PeerStep> + Send + Sync;

/// A TLS WebSocket server that plays a script per connection.
///
/// The script receives the zero-based connection index. When the steps run
/// out the TCP stream is dropped without a close frame.
pub struct ScriptedPeer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<String>>>,
    handshakes: Arc<Mutex<Vec<Vec<(String, String)>>>>,
    task: JoinHandle<()>,
}

impl ScriptedPeer {
    pub async fn start(
        pki: &TestPki,
        script: impl Fn(usize) -> Vec<PeerStep> + Send + Sync + 'static,
    ) -> Result<Self> {
        let acceptor = TlsAcceptor::from(pki.server_config()?);
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let accepted = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let handshakes = Arc::new(Mutex::new(Vec::new()));
        let script: Arc<Script> = Arc::new(script);

        let task = {
            let accepted = accepted.clone();
            let received = received.clone();
            let handshakes = handshakes.clone();
            tokio::spawn(async move {
                while let Ok((tcp, _)) = listener.accept().await {
                    let index = accepted.fetch_add(1, Ordering::SeqCst);
                    let steps = script(index);
                    let conn = Connection {
                        acceptor: acceptor.clone(),
                        received: received.clone(),
                        handshakes: handshakes.clone(),
                    };
                    tokio::spawn(async move {
                        if let Err(err) = conn.play(tcp, steps).await {
                            debug!(error = %err, index, "scripted connection ended");
                        }
                    });
                }
            })
        };

        Ok(Self {
            addr,
            accepted,
            received,
            handshakes,
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Text frames read during [`PeerStep::Hold`].
    pub fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }

    /// Upgrade request headers per completed handshake, lowercased names.
    pub fn handshakes(&self) -> Vec<Vec<(String, String)>> {
        self.handshakes.lock().clone()
    }
}

impl Drop for ScriptedPeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Connection {
    acceptor: TlsAcceptor,
    received: Arc<Mutex<Vec<String>>>,
    handshakes: Arc<Mutex<Vec<Vec<(String, String)>>>>,
}

impl Connection {
    async fn play(self, tcp: TcpStream, steps: Vec<PeerStep>) -> Result<()> {
        let mut steps = steps.into_iter().peekable();
        while let Some(PeerStep::DelayHandshake(delay)) = steps.peek() {
            tokio::time::sleep(*delay).await;
            steps.next();
        }
        let tls = self.acceptor.accept(tcp).await?;
        let handshakes = self.handshakes.clone();
        let callback = move |request: &Request,
                             response: Response|
              -> std::result::Result<Response, ErrorResponse> {
            let headers = request
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_owned(),
                        value.to_str().unwrap_or_default().to_owned(),
                    )
                })
                .collect();
            handshakes.lock().push(headers);
            Ok(response)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(TlsStream::Server(tls), callback).await?;

        for step in steps {
            match step {
                PeerStep::DelayHandshake(_) => {}
                PeerStep::Sleep(duration) => tokio::time::sleep(duration).await,
                PeerStep::SendText(text) => ws.send(Message::Text(text.into())).await?,
                PeerStep::SendBinary(data) => ws.send(Message::Binary(data.into())).await?,
                PeerStep::Hold => {
                    while let Some(Ok(frame)) = ws.next().await {
                        match frame {
                            Message::Text(text) => self.received.lock().push(text.to_string()),
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
