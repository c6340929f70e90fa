use crate::metrics::FilterMetrics;
use anyhow::Result;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Largest UDP datagram accepted; one datagram may carry multiple lines.
const UDP_BUFFER: usize = 64 * 1024;

/// Accepts metric lines over TCP and UDP and forwards them to the parser
/// pool through a bounded channel. When the channel is full the line is
/// dropped and counted; ingestion never applies backpressure to peers.
pub struct LineListener {
    tcp: TcpListener,
    udp: UdpSocket,
    lines: mpsc::Sender<String>,
    metrics: Arc<FilterMetrics>,
}

impl LineListener {
    /// Binds both sockets on `addr`. Bind failures are fatal at startup.
    pub async fn bind(
        addr: &str,
        lines: mpsc::Sender<String>,
        metrics: Arc<FilterMetrics>,
    ) -> Result<Self> {
        let tcp = TcpListener::bind(addr).await?;
        let udp = UdpSocket::bind(addr).await?;
        tracing::info!(listen = %addr, "Filter listening");
        Ok(Self {
            tcp,
            udp,
            lines,
            metrics,
        })
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let udp_lines = self.lines.clone();
        let udp_metrics = self.metrics.clone();
        let udp_token = shutdown.clone();
        let udp = self.udp;
        let udp_task = tokio::spawn(async move {
            let mut buffer = vec![0u8; UDP_BUFFER];
            loop {
                tokio::select! {
                    received = udp.recv_from(&mut buffer) => {
                        let (len, _) = match received {
                            Ok(value) => value,
                            Err(e) => {
                                tracing::warn!(error = %e, "UDP receive error");
                                continue;
                            }
                        };
                        let datagram = String::from_utf8_lossy(&buffer[..len]);
                        for line in datagram.lines() {
                            if line.is_empty() {
                                continue;
                            }
                            enqueue(&udp_lines, &udp_metrics, line.to_string());
                        }
                    }
                    _ = udp_token.cancelled() => return,
                }
            }
        });

        loop {
            tokio::select! {
                accepted = self.tcp.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(value) => value,
                        Err(e) => {
                            tracing::warn!(error = %e, "TCP accept error");
                            continue;
                        }
                    };
                    let lines = self.lines.clone();
                    let metrics = self.metrics.clone();
                    let token = shutdown.clone();
                    tokio::spawn(async move {
                        let mut reader = tokio::io::BufReader::new(stream).lines();
                        loop {
                            tokio::select! {
                                next = reader.next_line() => match next {
                                    Ok(Some(line)) => {
                                        if !line.is_empty() {
                                            enqueue(&lines, &metrics, line);
                                        }
                                    }
                                    Ok(None) => return,
                                    Err(e) => {
                                        tracing::debug!(peer = %peer, error = %e, "Connection closed on read error");
                                        return;
                                    }
                                },
                                _ = token.cancelled() => return,
                            }
                        }
                    });
                }
                _ = shutdown.cancelled() => break,
            }
        }

        let _ = udp_task.await;
        tracing::info!("Filter listener stopped");
    }
}

fn enqueue(lines: &mpsc::Sender<String>, metrics: &FilterMetrics, line: String) {
    metrics.mark_received();
    if lines.try_send(line).is_err() {
        metrics.mark_dropped();
    }
}
