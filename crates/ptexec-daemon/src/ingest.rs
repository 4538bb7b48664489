//! Record ingest: capture tools connect over TCP and push newline-delimited
//! JSON records into the [`StreamMerger`].
//!
//! ```json
//! {"source": "sniffer-a", "level": "info", "payload": {"layer": "RRC", "messageType": "RRCSetup"}}
//! ```
//!
//! `level` is optional. Arrival time is stamped by the merger.

use std::net::SocketAddr;
use std::sync::Arc;

use ptexec_core::types::RecordDraft;
use ptexec_gateway::merger::StreamMerger;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Longest accepted line; longer lines are dropped without being buffered.
pub const MAX_LINE_BYTES: usize = 1 << 20;

pub struct IngestListener {
    addr: SocketAddr,
    merger: Arc<StreamMerger>,
    cancel: CancellationToken,
}

impl IngestListener {
    pub fn new(addr: SocketAddr, merger: Arc<StreamMerger>, cancel: CancellationToken) -> Self {
        Self {
            addr,
            merger,
            cancel,
        }
    }

    pub async fn bind(&self) -> std::io::Result<(TcpListener, SocketAddr)> {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "ingest listening");
        Ok((listener, local_addr))
    }

    /// Accept producers until cancelled. Each producer gets its own task.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            tracing::debug!(peer = %peer, "ingest producer connected");
                            let merger = Arc::clone(&self.merger);
                            let cancel = self.cancel.clone();
                            tokio::spawn(async move {
                                let accepted = tokio::select! {
                                    n = read_records(stream, &merger) => n,
                                    _ = cancel.cancelled() => return,
                                };
                                tracing::debug!(peer = %peer, records = accepted, "ingest producer disconnected");
                            });
                        }
                        Err(e) => tracing::error!(error = %e, "ingest: TCP accept failed"),
                    }
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!("ingest: cancellation requested, shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Publish every well-formed line from `reader`; returns how many were accepted.
/// Malformed, non-UTF-8 and overlong lines are logged and skipped. Only a
/// read error or EOF ends the stream.
pub async fn read_records<R>(reader: R, merger: &StreamMerger) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut accepted = 0;
    loop {
        line.clear();
        let limit = (MAX_LINE_BYTES + 1) as u64;
        match (&mut reader).take(limit).read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "ingest read failed");
                break;
            }
        }
        if line.len() > MAX_LINE_BYTES && line.last() != Some(&b'\n') {
            tracing::warn!(limit = MAX_LINE_BYTES, "ingest line too long, skipped");
            if let Err(e) = discard_line(&mut reader).await {
                tracing::warn!(error = %e, "ingest read failed");
                break;
            }
            continue;
        }
        let text = match std::str::from_utf8(&line) {
            Ok(text) => text.trim(),
            Err(e) => {
                tracing::warn!(error = %e, "ingest line is not UTF-8, skipped");
                continue;
            }
        };
        if text.is_empty() {
            continue;
        }
        match serde_json::from_str::<RecordDraft>(text) {
            Ok(draft) if draft.source.is_empty() => {
                tracing::warn!("ingest record without source, skipped");
            }
            Ok(draft) => {
                merger.publish(draft);
                accepted += 1;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse ingest record");
            }
        }
    }
    accepted
}

/// Consume input up to and including the next newline.
async fn discard_line<R>(reader: &mut R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(());
        }
        match buf.iter().position(|&b| b == b'\n') {
            Some(i) => {
                reader.consume(i + 1);
                return Ok(());
            }
            None => {
                let n = buf.len();
                reader.consume(n);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn well_formed_lines_are_published() {
        let merger = StreamMerger::new(100);
        let input = concat!(
            r#"{"source":"sniffer-a","level":"debug","payload":{"messageType":"RRCSetup"}}"#,
            "\n",
            "\n",
            r#"{"source":"sniffer-b","payload":{"messageType":"Paging"}}"#,
            "\n",
        );
        let accepted = read_records(input.as_bytes(), &merger).await;
        assert_eq!(accepted, 2);

        let records = merger.recent(10, None);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].source, "sniffer-a");
        assert_eq!(records[0].level, "debug");
        assert_eq!(records[1].level, "info");
        assert!(records[0].seq < records[1].seq);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let merger = StreamMerger::new(100);
        let input = concat!(
            "garbage\n",
            r#"{"payload":{}}"#,
            "\n",
            r#"{"source":"","payload":{}}"#,
            "\n",
            r#"{"source":"sniffer-a","payload":{"n":1}}"#,
        );
        assert_eq!(read_records(input.as_bytes(), &merger).await, 1);
        assert_eq!(merger.len(), 1);
    }

    #[tokio::test]
    async fn non_utf8_line_keeps_the_stream_open() {
        let merger = StreamMerger::new(100);
        let input = b"\xff\xfe garbage\n{\"source\":\"a\",\"payload\":{\"n\":1}}\n";
        assert_eq!(read_records(&input[..], &merger).await, 1);
        assert_eq!(merger.recent(10, Some("a")).len(), 1);
    }

    #[tokio::test]
    async fn overlong_line_is_dropped_and_reading_resumes() {
        let merger = StreamMerger::new(100);
        let mut input = vec![b'x'; MAX_LINE_BYTES * 2 + 17];
        input.push(b'\n');
        input.extend_from_slice(b"{\"source\":\"a\",\"payload\":{\"n\":1}}\n");
        let mut exact = vec![b' '; MAX_LINE_BYTES - 35];
        exact.extend_from_slice(b"{\"source\":\"b\",\"payload\":{\"n\":2}}\n");
        input.extend_from_slice(&exact);

        assert_eq!(read_records(&input[..], &merger).await, 2);
        let records = merger.recent(10, None);
        assert_eq!(records[0].source, "a");
        assert_eq!(records[1].source, "b");
    }

    #[tokio::test]
    async fn tcp_producers_feed_the_merger() {
        let merger = Arc::new(StreamMerger::new(100));
        let cancel = CancellationToken::new();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let ingest = IngestListener::new(addr, Arc::clone(&merger), cancel.clone());
        let (listener, local) = ingest.bind().await.unwrap();
        let handle = tokio::spawn(async move { ingest.serve(listener).await });

        let mut a = TcpStream::connect(local).await.unwrap();
        let mut b = TcpStream::connect(local).await.unwrap();
        a.write_all(b"{\"source\":\"a\",\"payload\":{\"n\":1}}\n").await.unwrap();
        b.write_all(b"{\"source\":\"b\",\"payload\":{\"n\":1}}\nnot json\n").await.unwrap();
        a.write_all(b"{\"source\":\"a\",\"payload\":{\"n\":2}}\n").await.unwrap();

        for _ in 0..100 {
            if merger.len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(merger.len(), 3);
        assert_eq!(merger.recent(10, Some("a")).len(), 2);

        cancel.cancel();
        let stopped = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(matches!(stopped, Ok(Ok(Ok(())))));
    }
}
