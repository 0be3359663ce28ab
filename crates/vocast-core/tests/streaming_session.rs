//! End-to-end playback of streamed generations on a virtual output

use base64::Engine as _;
use bytes::Bytes;
use futures::stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use vocast_core::playback::OutputEvent;
use vocast_core::stream::events;
use vocast_core::{
    AudioChunk, Error, Feature, GenerationState, PlaybackConfig, PlaybackDriver, PlaybackMode,
    PlaybackSession, PlaybackStatus, SessionEvent, VirtualOutput,
};

const RATE: u32 = 24000;

fn silence(millis: usize) -> String {
    let bytes = RATE as usize / 1000 * millis * 2;
    base64::engine::general_purpose::STANDARD.encode(vec![0u8; bytes])
}

fn chunk(index: usize, millis: usize) -> AudioChunk {
    AudioChunk {
        sequence_index: index,
        audio: silence(millis),
        sample_rate: RATE,
        speaker: "Narrator".to_string(),
        text: format!("sentence {index}"),
        voice_used: "default".to_string(),
    }
}

fn audio_event(index: usize, millis: usize) -> String {
    format!(
        "data: {{\"type\":\"audio\",\"audio\":\"{}\",\"sample_rate\":{RATE},\"segment_index\":{index},\"speaker\":\"Narrator\",\"text\":\"sentence {index}\"}}\n\n",
        silence(millis)
    )
}

fn body(parts: Vec<String>) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> {
    stream::iter(parts.into_iter().map(|p| Ok(Bytes::from(p))))
}

struct Fixture {
    driver: Arc<PlaybackDriver>,
    output: VirtualOutput,
}

impl Fixture {
    fn new() -> Self {
        Self {
            driver: PlaybackDriver::new(PlaybackMode::Wav),
            output: VirtualOutput::new(),
        }
    }

    fn session(&self, feature: Feature) -> (PlaybackSession, mpsc::UnboundedReceiver<SessionEvent>) {
        PlaybackSession::new(
            feature,
            PlaybackConfig::default(),
            Arc::clone(&self.driver),
            Arc::new(self.output.clone()),
        )
    }

    fn ended(&self) -> Vec<usize> {
        self.output
            .events()
            .into_iter()
            .filter_map(|e| match e {
                OutputEvent::Ended { index, .. } => Some(index),
                _ => None,
            })
            .collect()
    }
}

#[tokio::test(start_paused = true)]
async fn test_chunks_play_in_sequence_order() {
    let fixture = Fixture::new();
    let (session, _events) = fixture.session(Feature::Audiobook);

    session.enqueue(chunk(2, 200));
    session.enqueue(chunk(0, 200));
    session.enqueue(chunk(1, 200));
    session.close();

    assert_eq!(session.wait_for_playback().await, PlaybackStatus::Complete);
    assert_eq!(fixture.output.started(), vec![0, 1, 2]);
    assert_eq!(fixture.output.max_live(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resume_continues_at_paused_chunk() {
    let fixture = Fixture::new();
    let (session, _events) = fixture.session(Feature::Audiobook);

    for index in 0..3 {
        session.enqueue(chunk(index, 1000));
    }
    session.close();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    session.pause();
    assert!(session.is_paused());
    assert_eq!(session.play_index(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(fixture.output.started(), vec![0, 1]);

    session.resume().unwrap();
    assert_eq!(session.wait_for_playback().await, PlaybackStatus::Complete);
    assert_eq!(fixture.output.started(), vec![0, 1, 1, 2]);
    assert_eq!(fixture.output.completed(), vec![0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_stop_rewinds_and_disarms_autoplay() {
    let fixture = Fixture::new();
    let (session, _events) = fixture.session(Feature::Chat);

    session.enqueue(chunk(0, 1000));
    tokio::time::sleep(Duration::from_millis(300)).await;
    session.stop();
    assert_eq!(session.play_index(), 0);
    assert!(!fixture.driver.is_claimed());

    session.enqueue(chunk(1, 1000));
    session.enqueue(chunk(2, 1000));
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(fixture.output.started(), vec![0]);
    assert_eq!(fixture.output.live(), 0);
    assert_eq!(session.status(), PlaybackStatus::Idle);

    session.close();
    session.play().unwrap();
    assert_eq!(session.wait_for_playback().await, PlaybackStatus::Complete);
    assert_eq!(fixture.output.started(), vec![0, 0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_streamed_chunks_build_combined_track() {
    let fixture = Fixture::new();
    let (session, _events) = fixture.session(Feature::Audiobook);

    let parts = vec![
        audio_event(0, 1000),
        audio_event(1, 1000),
        audio_event(2, 1000),
        "data: {\"type\":\"done\"}\n\n".to_string(),
    ];
    session.consume(events(body(parts))).await.unwrap();
    assert_eq!(session.generation_state(), GenerationState::Complete);

    let track = session.combined().unwrap();
    assert!((track.duration() - 3.0).abs() < 1e-6);

    assert_eq!(session.wait_for_playback().await, PlaybackStatus::Complete);
    assert_eq!(fixture.ended(), vec![0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_reordered_arrivals_play_in_order() {
    let fixture = Fixture::new();
    let (session, _events) = fixture.session(Feature::Podcast);

    let parts = vec![
        audio_event(1, 500),
        audio_event(0, 500),
        "data: {\"type\":\"done\"}\n\n".to_string(),
    ];
    session.consume(events(body(parts))).await.unwrap();

    session.wait_for_playback().await;
    assert_eq!(fixture.output.started(), vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_stop_between_chunks_aborts_generation() {
    let fixture = Fixture::new();
    let (session, _events) = fixture.session(Feature::Audiobook);

    let (tx, rx) = mpsc::unbounded_channel::<Result<Bytes, std::io::Error>>();
    let consumer = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .consume(events(UnboundedReceiverStream::new(rx)))
                .await
        })
    };

    tx.send(Ok(Bytes::from(audio_event(0, 1000)))).unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(fixture.output.completed(), vec![0]);

    session.stop();
    assert!(consumer.await.unwrap().is_ok());
    assert_eq!(session.generation_state(), GenerationState::Cancelled);

    let _ = tx.send(Ok(Bytes::from(audio_event(1, 1000))));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(fixture.output.started(), vec![0]);
    assert_eq!(session.play_index(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_event_does_not_end_stream() {
    let fixture = Fixture::new();
    let (session, _events) = fixture.session(Feature::Audiobook);

    let parts = vec![
        audio_event(0, 200),
        "data: {bad json\n\n".to_string(),
        audio_event(1, 200),
        "data: {\"type\":\"done\"}\n\n".to_string(),
    ];
    session.consume(events(body(parts))).await.unwrap();
    assert_eq!(session.chunks().len(), 2);

    session.wait_for_playback().await;
    assert_eq!(fixture.output.completed(), vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_error_event_keeps_queued_audio() {
    let fixture = Fixture::new();
    let (session, mut session_events) = fixture.session(Feature::Chat);

    let parts = vec![
        "data: {\"type\":\"content\",\"content\":\"Hello\"}\n\n".to_string(),
        audio_event(0, 300),
        "data: {\"type\":\"error\",\"error\":\"model crashed\"}\n\n".to_string(),
    ];
    let result = session.consume(events(body(parts))).await;
    assert!(matches!(result, Err(Error::GenerationFailed(ref m)) if m == "model crashed"));
    assert_eq!(
        session.generation_state(),
        GenerationState::Failed("model crashed".to_string())
    );

    assert_eq!(session.wait_for_playback().await, PlaybackStatus::Complete);
    assert_eq!(fixture.output.completed(), vec![0]);

    let mut seen = Vec::new();
    while let Ok(event) = session_events.try_recv() {
        seen.push(event);
    }
    assert_eq!(seen.first(), Some(&SessionEvent::Content("Hello".to_string())));
    assert!(seen.contains(&SessionEvent::GenerationFailed("model crashed".to_string())));
    assert!(seen.contains(&SessionEvent::PlaybackComplete));
}

#[tokio::test(start_paused = true)]
async fn test_connection_drop_keeps_queued_audio() {
    let fixture = Fixture::new();
    let (session, _session_events) = fixture.session(Feature::Audiobook);

    let reads: Vec<Result<Bytes, std::io::Error>> = vec![
        Ok(Bytes::from(audio_event(0, 200))),
        Ok(Bytes::from(audio_event(1, 200))),
        Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset",
        )),
        Ok(Bytes::from(audio_event(2, 200))),
    ];
    let result = session.consume(events(stream::iter(reads))).await;
    assert!(matches!(result, Err(Error::Transport(_))));
    assert!(matches!(
        session.generation_state(),
        GenerationState::Failed(ref m) if m.contains("connection reset")
    ));

    assert_eq!(session.wait_for_playback().await, PlaybackStatus::Complete);
    assert_eq!(fixture.ended(), vec![0, 1]);
    assert_eq!(session.chunks().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_sessions_share_one_output() {
    let fixture = Fixture::new();
    let (chat, _a) = fixture.session(Feature::Chat);
    let (book, _b) = fixture.session(Feature::Audiobook);

    chat.enqueue(chunk(0, 1000));
    tokio::time::sleep(Duration::from_millis(200)).await;
    book.enqueue(chunk(0, 1000));
    book.close();

    assert_eq!(chat.status(), PlaybackStatus::Idle);
    assert_eq!(book.wait_for_playback().await, PlaybackStatus::Complete);
    assert_eq!(fixture.output.max_live(), 1);
}
