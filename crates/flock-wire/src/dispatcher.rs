// Copyright (c) Flock Contributors
// SPDX-License-Identifier: Apache-2.0

//! Inbound side of the transport: a TCP listener that decodes one message
//! per connection and hands it to the engine through a bounded channel.
//!
//! The network is treated as lossy: connections that fail to decode or
//! validate are logged and dropped without reply. Backpressure from a full
//! engine channel blocks the connection task, not the accept loop.

use crate::error::Result;
use crate::message::Message;
use crate::shutdown::ShutdownSignal;
use std::net::SocketAddr;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Listens on a TCP endpoint and forwards decoded messages into `tx`.
pub struct Dispatcher {
    listener: TcpListener,
    tx: mpsc::Sender<Message>,
}

impl Dispatcher {
    /// Bind the listen address. Binding `port 0` picks a free port;
    /// [`Dispatcher::local_addr`] reports the actual endpoint.
    pub async fn bind(listen: &str, tx: mpsc::Sender<Message>) -> Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        info!(addr = %listener.local_addr()?, "listening");
        Ok(Self { listener, tx })
    }

    /// The bound endpoint.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires. Each connection is served
    /// by its own short-lived task emitting at most one message.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.triggered() => {
                    info!("stopped listen loop");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    let tx = self.tx.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        handle_conn(stream, peer, tx, shutdown).await;
                    });
                }
            }
        }
    }
}

async fn handle_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::Sender<Message>,
    shutdown: ShutdownSignal,
) {
    debug!(%peer, "handling incoming connection");

    let mut frame = Vec::new();
    if let Err(err) = stream.read_to_end(&mut frame).await {
        warn!(%peer, error = %err, "failed reading incoming frame");
        return;
    }

    let msg = match Message::decode(&frame) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(%peer, error = %err, "dropping undecodable message");
            return;
        }
    };

    debug!(
        msg_direction = "incoming",
        req_id = %msg.uuid,
        src_uid = msg.src_uid,
        msg_type = %msg.msg_type,
        payload = %msg.payload,
        "(<<<)"
    );

    // Late messages racing a shutdown are dropped on the floor.
    if shutdown.is_triggered() {
        return;
    }
    if tx.send(msg).await.is_err() {
        debug!("engine channel closed, dropping message");
    }
}
