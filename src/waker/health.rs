//! Healthcheck responder run by every supervised process.
//!
//! Replies `Alive` to each `Healthcheck` while the shared liveness flag is
//! set. A process clears the flag when it considers itself broken, so the
//! leader stops hearing from it and restarts it.

use super::types::WakerMessage;

use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;
use tokio::sync::watch;

pub async fn serve_health(
    socket: UdpSocket,
    alive: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    tracing::info!("Health responder on {}", socket.local_addr()?);
    let mut buf = vec![0u8; 1024];
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (len, src) = received?;
                let Ok(WakerMessage::Healthcheck { target, .. }) = WakerMessage::decode(&buf[..len]) else {
                    tracing::debug!("Ignoring datagram from {}", src);
                    continue;
                };
                if !alive.load(Ordering::SeqCst) {
                    continue;
                }
                let reply = WakerMessage::Alive { from: target }.encode()?;
                if let Err(e) = socket.send_to(&reply, src).await {
                    tracing::debug!("Could not answer healthcheck from {}: {}", src, e);
                }
            }
        }
    }
}
