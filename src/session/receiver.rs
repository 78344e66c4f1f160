//! Consumer side: receive, decode, buffer and play.
//!
//! Two units share one [`JitterBuffer`]:
//! - the receive unit, an async loop driven by [`ConnectionSession`] actions,
//!   is the only producer;
//! - the playback unit, a [`PlaybackLoop`] on a blocking thread that owns the
//!   output sink from creation to release, is the only consumer.
//!
//! Shutdown always runs in the same order: stop accepting frames, drain the
//! buffer, release the device, then close the transport.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::ReceiverConfig;
use super::packet::StreamPacket;
use super::state::{ConnectionSession, SessionAction, SessionEnd, SessionEvent};
use super::transport::{CloseKind, Connection, Connector, Incoming};
use crate::audio::buffers::jitter_buffer::PushOutcome;
use crate::audio::buffers::{BufferStats, JitterBuffer};
use crate::audio::opus::FrameDecoder;
use crate::audio::playback::{PlaybackLoop, PlaybackStats};
use crate::io::audio::AudioSink;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveStats {
    pub connects: u64,
    pub frames_received: u64,
    /// Frames the decoder rejected; each one was dropped.
    pub frames_undecodable: u64,
    /// Messages that were not valid packets.
    pub malformed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    pub end: Option<SessionEnd>,
    pub receive: ReceiveStats,
    pub buffer: BufferStats,
    pub playback: PlaybackStats,
}

impl SessionReport {
    pub fn gave_up(&self) -> bool {
        self.end == Some(SessionEnd::RetriesExhausted)
    }

    fn log_summary(&self) {
        info!(
            "Session summary: end={:?}, connects={}, received={}, undecodable={}, malformed={}, buffered={}, evicted={}, discarded={}, peak_buffer={}, played={}, write_errors={}",
            self.end,
            self.receive.connects,
            self.receive.frames_received,
            self.receive.frames_undecodable,
            self.receive.malformed,
            self.buffer.pushed,
            self.buffer.evicted,
            self.buffer.discarded,
            self.buffer.peak_len,
            self.playback.frames_played,
            self.playback.write_errors
        );
    }
}

pub struct Receiver<C, D> {
    connector: C,
    decoder: D,
    config: ReceiverConfig,
    buffer: Arc<JitterBuffer>,
    stats: ReceiveStats,
}

impl<C, D> Receiver<C, D>
where
    C: Connector,
    D: FrameDecoder,
{
    pub fn new(connector: C, decoder: D, config: ReceiverConfig) -> Self {
        let buffer = Arc::new(JitterBuffer::new(config.max_buffer_frames));
        Self {
            connector,
            decoder,
            config,
            buffer,
            stats: ReceiveStats::default(),
        }
    }

    /// Runs one receive session to completion.
    ///
    /// `open_sink` is called on the playback thread; an error there fails the
    /// run before any connection is attempted. Retry exhaustion is not an
    /// error here: it is reported through [`SessionReport::end`].
    pub async fn run<F>(mut self, open_sink: F, cancel: CancellationToken) -> Result<SessionReport>
    where
        F: FnOnce() -> Result<Box<dyn AudioSink>> + Send + 'static,
    {
        let playback = self.spawn_playback(open_sink).await?;

        let mut session = ConnectionSession::new(self.config.max_retries, self.config.backoff);
        let mut conn: Option<C::Conn> = None;
        let mut action = session.handle(SessionEvent::Start);

        let last = loop {
            let event = match action {
                SessionAction::Connect => self.connect(&mut conn, &cancel).await,
                SessionAction::Stream => match conn.as_mut() {
                    Some(c) => self.receive_one(c, &cancel).await,
                    None => SessionEvent::AbnormalClose,
                },
                SessionAction::Backoff(delay) => {
                    if let Some(mut c) = conn.take()
                        && let Err(e) = c.close(false).await
                    {
                        debug!("Close before backoff failed: {}", e);
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => SessionEvent::Stop,
                        _ = tokio::time::sleep(delay) => SessionEvent::BackoffElapsed,
                    }
                }
                SessionAction::Drain
                | SessionAction::GiveUp
                | SessionAction::Release
                | SessionAction::Ignore => break action,
            };
            action = session.handle(event);
        };

        // No frame is accepted after this point.
        self.buffer.finish();
        self.drain().await;
        if last == SessionAction::Drain {
            session.handle(SessionEvent::Drained);
        }

        let playback = playback.await.context("Playback thread panicked")?;
        debug!("Playback released the output device");

        if let Some(mut c) = conn.take() {
            let normal = session.end() != Some(SessionEnd::RetriesExhausted);
            if let Err(e) = c.close(normal).await {
                debug!("Close after session end failed: {}", e);
            }
        }

        let report = SessionReport {
            end: session.end(),
            receive: self.stats,
            buffer: self.buffer.stats(),
            playback,
        };
        report.log_summary();
        Ok(report)
    }

    async fn spawn_playback<F>(&self, open_sink: F) -> Result<JoinHandle<PlaybackStats>>
    where
        F: FnOnce() -> Result<Box<dyn AudioSink>> + Send + 'static,
    {
        let (ready_tx, ready_rx) = oneshot::channel();
        let player = PlaybackLoop::new(self.buffer.clone(), self.config.idle_wait);

        let handle = tokio::task::spawn_blocking(move || {
            let mut sink = match open_sink() {
                Ok(sink) => {
                    let _ = ready_tx.send(Ok(()));
                    sink
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return PlaybackStats::default();
                }
            };
            let stats = player.run(sink.as_mut());
            drop(sink);
            stats
        });

        ready_rx
            .await
            .context("Playback thread exited before opening the output")?
            .context("Failed to open audio output")?;
        Ok(handle)
    }

    async fn connect(
        &mut self,
        conn: &mut Option<C::Conn>,
        cancel: &CancellationToken,
    ) -> SessionEvent {
        info!("Connecting to {}", self.config.address);
        let attempt = timeout(self.config.connect_timeout, self.connector.connect());
        tokio::select! {
            _ = cancel.cancelled() => SessionEvent::Stop,
            result = attempt => match result {
                Ok(Ok(c)) => {
                    self.stats.connects += 1;
                    *conn = Some(c);
                    SessionEvent::Connected
                }
                Ok(Err(e)) => {
                    warn!("Connection attempt failed: {}", e);
                    SessionEvent::ConnectFailed
                }
                Err(_) => {
                    warn!(
                        "Connection attempt timed out after {:?}",
                        self.config.connect_timeout
                    );
                    SessionEvent::ConnectFailed
                }
            },
        }
    }

    async fn receive_one(&mut self, conn: &mut C::Conn, cancel: &CancellationToken) -> SessionEvent {
        let incoming = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Interrupted, draining buffered audio");
                return SessionEvent::Stop;
            }
            incoming = timeout(self.config.receive_timeout, conn.recv()) => incoming,
        };

        match incoming {
            Err(_) => {
                warn!("No data received for {:?}", self.config.receive_timeout);
                SessionEvent::ReceiveTimeout
            }
            Ok(Err(e)) => {
                warn!("Connection lost: {}", e);
                SessionEvent::AbnormalClose
            }
            Ok(Ok(Incoming::Packet(StreamPacket::Frame(payload)))) => {
                self.stats.frames_received += 1;
                match self.decoder.decode(&payload) {
                    Ok(frame) => {
                        if self.buffer.push(frame) == PushOutcome::Evicted {
                            debug!("Buffer full, dropped the oldest frame");
                        }
                    }
                    Err(e) => {
                        self.stats.frames_undecodable += 1;
                        warn!("Dropping undecodable frame: {}", e);
                    }
                }
                SessionEvent::FrameTransferred
            }
            Ok(Ok(Incoming::Packet(StreamPacket::EndOfStream))) => {
                info!("End of stream received");
                SessionEvent::EndOfStream
            }
            Ok(Ok(Incoming::Malformed(reason))) => {
                self.stats.malformed += 1;
                warn!("Dropping malformed message: {}", reason);
                SessionEvent::FrameTransferred
            }
            Ok(Ok(Incoming::Closed(CloseKind::Normal))) => {
                info!("Server closed the connection");
                SessionEvent::CleanClose
            }
            Ok(Ok(Incoming::Closed(CloseKind::Abnormal { code, reason }))) => {
                warn!("Connection closed abnormally (code {:?}): {}", code, reason);
                SessionEvent::AbnormalClose
            }
        }
    }

    /// Waits for playback to empty the buffer, discarding the rest on timeout.
    async fn drain(&self) {
        if !self.buffer.is_empty() {
            info!("Draining {} buffered frame(s)", self.buffer.len());
        }

        let buffer = self.buffer.clone();
        let limit = self.config.drain_timeout;
        let drained = tokio::task::spawn_blocking(move || buffer.wait_for_drain(limit))
            .await
            .unwrap_or(false);

        if !drained {
            let dropped = self.buffer.clear();
            warn!(
                "Drain did not finish within {:?}, discarded {} frame(s)",
                limit.unwrap_or(Duration::ZERO),
                dropped
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::AudioFrame;
    use crate::error::{CodecError, TransportError};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    const FRAME_LEN: usize = 4;

    enum Step {
        Recv(Incoming),
        Fail,
        Wait(Duration),
    }

    fn frame(tag: u8) -> Step {
        Step::Recv(Incoming::Packet(StreamPacket::Frame(vec![tag])))
    }

    fn eos() -> Step {
        Step::Recv(Incoming::Packet(StreamPacket::EndOfStream))
    }

    fn closed(kind: CloseKind) -> Step {
        Step::Recv(Incoming::Closed(kind))
    }

    /// Shared record of what the transport and the output device saw.
    #[derive(Clone, Default)]
    struct Tracker {
        released: Arc<AtomicBool>,
        /// Whether the output device was already released at each transport close.
        released_at_close: Arc<Mutex<Vec<bool>>>,
        played: Arc<Mutex<Vec<i16>>>,
        written_at: Arc<Mutex<Vec<Instant>>>,
        eos_at: Arc<Mutex<Option<Instant>>>,
    }

    struct ScriptedConnection {
        steps: VecDeque<Step>,
        tracker: Tracker,
        close_fails: bool,
    }

    #[async_trait]
    impl Connection for ScriptedConnection {
        async fn send(&mut self, _packet: &StreamPacket) -> Result<(), TransportError> {
            Ok(())
        }

        async fn recv(&mut self) -> Result<Incoming, TransportError> {
            loop {
                match self.steps.pop_front() {
                    Some(Step::Recv(incoming)) => {
                        if matches!(incoming, Incoming::Packet(StreamPacket::EndOfStream)) {
                            *self.tracker.eos_at.lock().unwrap() = Some(Instant::now());
                        }
                        return Ok(incoming);
                    }
                    Some(Step::Fail) => return Err(TransportError::ConnectionLost),
                    Some(Step::Wait(d)) => tokio::time::sleep(d).await,
                    None => std::future::pending::<()>().await,
                }
            }
        }

        async fn close(&mut self, _normal: bool) -> Result<(), TransportError> {
            let released = self.tracker.released.load(Ordering::SeqCst);
            self.tracker.released_at_close.lock().unwrap().push(released);
            if self.close_fails {
                return Err(TransportError::ConnectionLost);
            }
            Ok(())
        }
    }

    /// Each connect consumes one script; `None` is a refused connection.
    struct ScriptedConnector {
        attempts: Mutex<VecDeque<Option<Vec<Step>>>>,
        calls: Arc<AtomicUsize>,
        tracker: Tracker,
        close_fails: bool,
    }

    impl ScriptedConnector {
        fn new(attempts: Vec<Option<Vec<Step>>>, tracker: &Tracker) -> Self {
            Self {
                attempts: Mutex::new(attempts.into()),
                calls: Arc::new(AtomicUsize::new(0)),
                tracker: tracker.clone(),
                close_fails: false,
            }
        }

        /// Every connection handed out reports an error from `close`.
        fn with_failing_close(mut self) -> Self {
            self.close_fails = true;
            self
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        type Conn = ScriptedConnection;

        async fn connect(&self) -> Result<ScriptedConnection, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.attempts.lock().unwrap().pop_front() {
                Some(Some(steps)) => Ok(ScriptedConnection {
                    steps: steps.into(),
                    tracker: self.tracker.clone(),
                    close_fails: self.close_fails,
                }),
                _ => Err(TransportError::ConnectionLost),
            }
        }
    }

    /// One-byte payloads become frames filled with that byte; empty payloads fail.
    struct TagDecoder;

    impl FrameDecoder for TagDecoder {
        fn decode(&mut self, payload: &[u8]) -> Result<AudioFrame, CodecError> {
            match payload {
                [tag] => Ok(AudioFrame::padded(&[*tag as i16; FRAME_LEN], FRAME_LEN)),
                _ => Err(CodecError::FrameLength {
                    expected: FRAME_LEN,
                    actual: payload.len(),
                }),
            }
        }
    }

    /// Connector whose attempts never complete.
    struct StalledConnector {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connector for StalledConnector {
        type Conn = ScriptedConnection;

        async fn connect(&self) -> Result<ScriptedConnection, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    struct TrackingSink {
        tracker: Tracker,
        pacing: Duration,
    }

    impl AudioSink for TrackingSink {
        fn write(&mut self, block: &[i16]) -> Result<()> {
            std::thread::sleep(self.pacing);
            self.tracker.played.lock().unwrap().push(block[0]);
            self.tracker.written_at.lock().unwrap().push(Instant::now());
            Ok(())
        }
    }

    impl Drop for TrackingSink {
        fn drop(&mut self) {
            self.tracker.released.store(true, Ordering::SeqCst);
        }
    }

    fn config() -> ReceiverConfig {
        ReceiverConfig {
            max_buffer_frames: 10,
            max_retries: 3,
            receive_timeout: Duration::from_millis(200),
            backoff: crate::session::config::BackoffPolicy::Fixed(Duration::from_millis(10)),
            drain_timeout: Some(Duration::from_secs(5)),
            idle_wait: Duration::from_millis(5),
            ..Default::default()
        }
    }

    async fn run<C: Connector>(
        connector: C,
        config: ReceiverConfig,
        tracker: &Tracker,
        pacing: Duration,
        cancel: CancellationToken,
    ) -> SessionReport {
        let sink_tracker = tracker.clone();
        Receiver::new(connector, TagDecoder, config)
            .run(
                move || {
                    Ok(Box::new(TrackingSink {
                        tracker: sink_tracker,
                        pacing,
                    }) as Box<dyn AudioSink>)
                },
                cancel,
            )
            .await
            .unwrap()
    }

    fn played(tracker: &Tracker) -> Vec<i16> {
        tracker.played.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_five_frames_then_end_of_stream() {
        let tracker = Tracker::default();
        let script = vec![
            frame(1),
            Step::Wait(Duration::from_millis(60)),
            frame(2),
            Step::Wait(Duration::from_millis(60)),
            frame(3),
            Step::Wait(Duration::from_millis(60)),
            frame(4),
            Step::Wait(Duration::from_millis(60)),
            frame(5),
            eos(),
            closed(CloseKind::Normal),
        ];
        let connector = ScriptedConnector::new(vec![Some(script)], &tracker);

        // The sink plays each 60 ms frame in real time.
        let frame_duration = Duration::from_millis(60);
        let report = run(connector, config(), &tracker, frame_duration, CancellationToken::new()).await;

        assert_eq!(report.end, Some(SessionEnd::EndOfStream));
        assert_eq!(played(&tracker), vec![1, 2, 3, 4, 5]);
        assert_eq!(report.buffer.pushed, 5);
        assert!(report.buffer.peak_len <= 5);
        assert_eq!(report.buffer.len, 0);
        assert_eq!(report.buffer.discarded, 0);

        // Everything buffered at end of stream plays out within five frame durations.
        let eos_at = tracker.eos_at.lock().unwrap().expect("end of stream was received");
        let last_write = *tracker.written_at.lock().unwrap().last().unwrap();
        assert!(last_write.saturating_duration_since(eos_at) <= frame_duration * 5);
        assert_eq!(*tracker.released_at_close.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_reconnects_after_abnormal_close() {
        let tracker = Tracker::default();
        let connector = ScriptedConnector::new(
            vec![
                Some(vec![
                    frame(1),
                    frame(2),
                    closed(CloseKind::Abnormal {
                        code: Some(1006),
                        reason: "reset".into(),
                    }),
                ]),
                None,
                Some(vec![frame(3), eos()]),
            ],
            &tracker,
        );

        let report = run(connector, config(), &tracker, Duration::ZERO, CancellationToken::new()).await;

        assert_eq!(report.end, Some(SessionEnd::EndOfStream));
        assert_eq!(report.receive.connects, 2);
        assert_eq!(played(&tracker), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let tracker = Tracker::default();
        let connector = ScriptedConnector::new(vec![None, None, None, None, None], &tracker);
        let calls = connector.calls.clone();

        let report = run(connector, config(), &tracker, Duration::ZERO, CancellationToken::new()).await;

        assert!(report.gave_up());
        // Three attempts in total, none after the bound is reached.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.receive.connects, 0);
        assert!(tracker.released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_receive_timeout_triggers_reconnect() {
        let tracker = Tracker::default();
        let connector = ScriptedConnector::new(
            vec![Some(vec![frame(1)]), Some(vec![frame(2), eos()])],
            &tracker,
        );

        let report = run(connector, config(), &tracker, Duration::ZERO, CancellationToken::new()).await;

        assert_eq!(report.end, Some(SessionEnd::EndOfStream));
        assert_eq!(report.receive.connects, 2);
        assert_eq!(played(&tracker), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_transport_error_is_retry_eligible() {
        let tracker = Tracker::default();
        let connector = ScriptedConnector::new(
            vec![Some(vec![frame(1), Step::Fail]), Some(vec![frame(2), eos()])],
            &tracker,
        );

        let report = run(connector, config(), &tracker, Duration::ZERO, CancellationToken::new()).await;

        assert_eq!(report.receive.connects, 2);
        assert_eq!(played(&tracker), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_bad_messages_are_dropped() {
        let tracker = Tracker::default();
        let connector = ScriptedConnector::new(
            vec![Some(vec![
                frame(1),
                Step::Recv(Incoming::Packet(StreamPacket::Frame(vec![]))),
                Step::Recv(Incoming::Malformed("text".into())),
                frame(2),
                eos(),
            ])],
            &tracker,
        );

        let report = run(connector, config(), &tracker, Duration::ZERO, CancellationToken::new()).await;

        assert_eq!(report.end, Some(SessionEnd::EndOfStream));
        assert_eq!(report.receive.frames_received, 3);
        assert_eq!(report.receive.frames_undecodable, 1);
        assert_eq!(report.receive.malformed, 1);
        assert_eq!(played(&tracker), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_clean_close_ends_without_retry() {
        let tracker = Tracker::default();
        let connector = ScriptedConnector::new(
            vec![
                Some(vec![frame(1), closed(CloseKind::Normal)]),
                Some(vec![frame(9), eos()]),
            ],
            &tracker,
        );

        let report = run(connector, config(), &tracker, Duration::ZERO, CancellationToken::new()).await;

        assert_eq!(report.end, Some(SessionEnd::CleanClose));
        assert_eq!(report.receive.connects, 1);
        assert_eq!(played(&tracker), vec![1]);
    }

    #[tokio::test]
    async fn test_cancel_drains_before_release_and_close() {
        let tracker = Tracker::default();
        let connector = ScriptedConnector::new(
            vec![Some(vec![frame(1), frame(2), frame(3)])],
            &tracker,
        );
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            });
        }

        let report = run(connector, config(), &tracker, Duration::from_millis(30), cancel).await;

        assert_eq!(report.end, Some(SessionEnd::Stopped));
        assert_eq!(played(&tracker), vec![1, 2, 3]);
        assert_eq!(report.buffer.discarded, 0);
        assert_eq!(*tracker.released_at_close.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_drain_timeout_discards_rest() {
        let tracker = Tracker::default();
        let script: Vec<Step> = (1..=8).map(frame).chain([eos()]).collect();
        let connector = ScriptedConnector::new(vec![Some(script)], &tracker);
        let config = ReceiverConfig {
            drain_timeout: Some(Duration::from_millis(50)),
            ..config()
        };

        let report = run(connector, config, &tracker, Duration::from_millis(100), CancellationToken::new()).await;

        assert_eq!(report.end, Some(SessionEnd::EndOfStream));
        assert!(report.buffer.discarded > 0);
        assert_eq!(report.buffer.len, 0);
        let played = played(&tracker);
        assert!(played.len() < 8);
        assert!(played.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_stalled_connect_attempt_times_out() {
        let tracker = Tracker::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let connector = StalledConnector {
            calls: calls.clone(),
        };
        let config = ReceiverConfig {
            max_retries: 2,
            connect_timeout: Duration::from_millis(50),
            ..config()
        };

        let report = tokio::time::timeout(
            Duration::from_secs(2),
            run(connector, config, &tracker, Duration::ZERO, CancellationToken::new()),
        )
        .await
        .expect("receiver hung on a connect attempt");

        assert!(report.gave_up());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.receive.connects, 0);
        assert!(tracker.released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_close_error_before_backoff_still_reconnects() {
        let tracker = Tracker::default();
        let connector = ScriptedConnector::new(
            vec![Some(vec![frame(1), Step::Fail]), Some(vec![frame(2), eos()])],
            &tracker,
        )
        .with_failing_close();

        let report = run(connector, config(), &tracker, Duration::ZERO, CancellationToken::new()).await;

        assert_eq!(report.end, Some(SessionEnd::EndOfStream));
        assert_eq!(report.receive.connects, 2);
        assert_eq!(played(&tracker), vec![1, 2]);
        // Closed once before the backoff and once after draining.
        assert_eq!(tracker.released_at_close.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sink_failure_fails_before_connecting() {
        let tracker = Tracker::default();
        let connector = ScriptedConnector::new(vec![Some(vec![eos()])], &tracker);
        let receiver = Receiver::new(connector, TagDecoder, config());

        let result = receiver
            .run(
                || Err(anyhow::anyhow!("no output device")),
                CancellationToken::new(),
            )
            .await;

        assert!(result.is_err());
    }
}
