//! Producer side: serves the paced stream to one client at a time.

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{BackoffPolicy, SenderConfig};
use super::pacer::Pacer;
use super::packet::StreamPacket;
use super::state::{ConnectionSession, SessionAction, SessionEnd, SessionEvent};
use super::transport::Connection;
use crate::audio::frame_source::FrameSource;
use crate::audio::opus::{FrameEncoder, OpusEncoder};
use crate::error::CodecError;
use crate::io::network::{WsConnection, WsListener};

/// How one send session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    pub frames_sent: u64,
    /// `EndOfStream` or `Stopped` when the marker went out; `RetriesExhausted`
    /// when the client went away mid-stream.
    pub end: Option<SessionEnd>,
}

/// Streams `source` to one connected client, then sends `EndOfStream` and
/// closes normally.
///
/// The sender never reconnects on its own, so a transport failure closes the
/// session at once. Cancellation stops pacing and still ends the stream
/// cleanly. Encoder failures are returned as errors: nothing after a bad
/// frame is sent.
pub async fn stream_session<C, E>(
    conn: &mut C,
    pacer: &mut Pacer<E>,
    cancel: &CancellationToken,
) -> Result<SendReport, CodecError>
where
    C: Connection,
    E: FrameEncoder,
{
    let mut session = ConnectionSession::new(0, BackoffPolicy::default());
    session.handle(SessionEvent::Start);
    session.handle(SessionEvent::Connected);

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => None,
            packet = pacer.next() => Some(packet),
        };

        let packet = match next {
            None => {
                info!("Interrupted, ending stream early");
                session.handle(SessionEvent::Stop);
                StreamPacket::EndOfStream
            }
            Some(Ok(Some(packet))) => packet,
            Some(Ok(None)) => break,
            Some(Err(e)) => {
                error!("Encoding failed, aborting stream: {}", e);
                if let Err(close_err) = conn.close(false).await {
                    debug!("Close after encoder failure failed: {}", close_err);
                }
                return Err(e);
            }
        };

        let is_marker = packet == StreamPacket::EndOfStream;
        if let Err(e) = conn.send(&packet).await {
            warn!("Send failed, client is gone: {}", e);
            session.handle(SessionEvent::AbnormalClose);
            break;
        }

        if is_marker {
            session.handle(SessionEvent::EndOfStream);
            // Nothing is buffered on this side.
            session.handle(SessionEvent::Drained);
            if let Err(e) = conn.close(true).await {
                warn!("Failed to close connection cleanly: {}", e);
            }
            break;
        }

        if session.handle(SessionEvent::FrameTransferred) != SessionAction::Stream {
            break;
        }
    }

    Ok(SendReport {
        frames_sent: pacer.frames_sent(),
        end: session.end(),
    })
}

/// Accepts clients on `listener` and streams the whole source to each one in turn.
///
/// Returns after the first session with `once`, when cancelled, or on an
/// encoder failure.
pub async fn serve(
    listener: WsListener,
    source: FrameSource,
    config: &SenderConfig,
    cancel: CancellationToken,
) -> Result<()> {
    info!(
        "Serving {} frames ({:.1}s) at {}Hz, {}ms per frame",
        source.frame_count(),
        source.total_samples() as f64 / config.format.sample_rate as f64,
        config.format.sample_rate,
        config.format.frame_duration_ms
    );

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Shutting down sender");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };

        let mut conn: WsConnection<TcpStream> = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Failed to accept client: {}", e);
                continue;
            }
        };

        // Fresh encoder state for every client.
        let encoder = OpusEncoder::new(&config.format).context("Failed to create encoder")?;
        let mut pacer = Pacer::new(source.frames(), encoder, config.format.frame_duration());

        let report = stream_session(&mut conn, &mut pacer, &cancel)
            .await
            .with_context(|| format!("Stream to {} aborted", conn.peer()))?;

        info!(
            "Session with {} ended ({:?}): {} frames sent",
            conn.peer(),
            report.end,
            report.frames_sent
        );

        if config.once || cancel.is_cancelled() {
            return Ok(());
        }
    }
}
