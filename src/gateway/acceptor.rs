//! Accepts result-stream connections. A client announces itself with its
//! 4-byte big-endian id; the socket is then handed to GatewayOut so its
//! consume loop never waits on `accept`.

use super::gateway_out::Registration;

use anyhow::Result;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn accept_result_streams(
    listener: TcpListener,
    registrations: mpsc::Sender<Registration>,
) -> Result<()> {
    tracing::info!("Result acceptor listening on {}", listener.local_addr()?);
    loop {
        let (mut stream, peer) = listener.accept().await?;
        let registrations = registrations.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HELLO_TIMEOUT, stream.read_u32()).await {
                Ok(Ok(client_id)) => {
                    if registrations.send((client_id, stream)).await.is_err() {
                        tracing::warn!("GatewayOut gone; dropping client {}", client_id);
                    }
                }
                Ok(Err(e)) => tracing::warn!("Bad result-stream hello from {}: {}", peer, e),
                Err(_) => tracing::warn!("No result-stream hello from {}", peer),
            }
        });
    }
}
