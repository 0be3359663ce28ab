//! Generations served over real HTTP by a local SSE fixture

use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine as _;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use vocast_cli::commands::speak_with_output;
use vocast_cli::SpeakArgs;
use vocast_core::{
    CombinedTrack, Error, Feature, GenerationClient, GenerationRequest, PlaybackConfig,
    PlaybackDriver, PlaybackMode, PlaybackSession, PlaybackStatus, SessionEvent, Settings,
    StreamEvent, VirtualOutput,
};

fn audio_json(index: usize, millis: usize, text: &str) -> String {
    let pcm = vec![0u8; 24 * millis * 2];
    serde_json::json!({
        "type": "audio",
        "audio": base64::engine::general_purpose::STANDARD.encode(pcm),
        "sample_rate": 24000,
        "segment_index": index,
        "speaker": "Narrator",
        "text": format!("{text} {index}"),
    })
    .to_string()
}

async fn audiobook(Json(body): Json<Value>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let text = body["text"].as_str().unwrap_or_default().to_string();
    let events = async_stream::stream! {
        for index in 0..3 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            yield Ok(Event::default().data(audio_json(index, 100, &text)));
        }
        yield Ok(Event::default().data("{bad json"));
        yield Ok(Event::default().data(r#"{"type":"done"}"#));
    };
    Sse::new(events)
}

async fn podcast(Json(_body): Json<Value>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = async_stream::stream! {
        yield Ok(Event::default().data(r#"{"type":"phase","percent":10,"message":"writing script"}"#));
        yield Ok(Event::default().data(
            r#"{"type":"transcript","transcript":[{"speaker":"Ana","text":"Hi"},{"speaker":"Ben","text":"Hello"}]}"#,
        ));
        yield Ok(Event::default().data(r#"{"type":"phase","percent":60,"message":"voicing"}"#));
        yield Ok(Event::default().data(audio_json(0, 50, "line")));
        yield Ok(Event::default().data(audio_json(1, 50, "line")));
        yield Ok(Event::default().data(r#"{"type":"done"}"#));
    };
    Sse::new(events)
}

async fn unavailable() -> (StatusCode, &'static str) {
    (StatusCode::SERVICE_UNAVAILABLE, "model loading")
}

async fn serve() -> SocketAddr {
    let app = Router::new()
        .route("/api/audiobook/generate", post(audiobook))
        .route("/api/podcast/generate", post(podcast))
        .route("/api/chat/stream", post(unavailable));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn settings(addr: SocketAddr) -> Settings {
    let mut settings = Settings::default();
    settings.stream.base_url = format!("http://{addr}");
    settings
}

fn speak_args(feature: Feature, out: Option<std::path::PathBuf>) -> SpeakArgs {
    SpeakArgs {
        feature,
        text: Some("chapter".to_string()),
        body: None,
        out,
        save: false,
        strategy: None,
        no_autoplay: false,
        headless: true,
    }
}

#[tokio::test]
async fn test_client_yields_events_in_order() {
    let addr = serve().await;
    let client = GenerationClient::new(settings(addr).stream).unwrap();

    let request = GenerationRequest::text(Feature::Audiobook, "chapter");
    let events: Vec<_> = client.start(&request).await.unwrap().collect().await;
    let kinds: Vec<&str> = events
        .iter()
        .map(|e| e.as_ref().map(StreamEvent::kind).unwrap_or("err"))
        .collect();
    assert_eq!(kinds, vec!["audio", "audio", "audio", "done"]);
}

#[tokio::test]
async fn test_error_status_is_reported() {
    let addr = serve().await;
    let client = GenerationClient::new(settings(addr).stream).unwrap();

    let request = GenerationRequest::text(Feature::Chat, "hi");
    match client.start(&request).await {
        Err(Error::UpstreamStatus { status, body }) => {
            assert_eq!(status, 503);
            assert_eq!(body, "model loading");
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("expected an error"),
    }
}

#[tokio::test]
async fn test_speak_plays_and_saves_track() {
    let addr = serve().await;
    let output = VirtualOutput::new();
    let out = std::env::temp_dir().join(format!("vocast-speak-{}.wav", std::process::id()));

    let outcome = speak_with_output(
        &settings(addr),
        speak_args(Feature::Audiobook, Some(out.clone())),
        Arc::new(output.clone()),
    )
    .await
    .unwrap();

    assert_eq!(outcome.status, PlaybackStatus::Complete);
    assert_eq!(outcome.chunks, 3);
    assert_eq!(output.completed(), vec![0, 1, 2]);

    let written = std::fs::read(outcome.written.as_ref().unwrap()).unwrap();
    std::fs::remove_file(&out).ok();
    let track = CombinedTrack::from_wav(&written).unwrap();
    assert!((track.duration() - 0.3).abs() < 1e-6);
}

#[tokio::test]
async fn test_speak_fails_on_upstream_error() {
    let addr = serve().await;
    let output = VirtualOutput::new();

    let result = speak_with_output(
        &settings(addr),
        speak_args(Feature::Chat, None),
        Arc::new(output.clone()),
    )
    .await;

    let err = result.unwrap_err();
    assert!(format!("{err:#}").contains("503"));
    assert!(output.started().is_empty());
}

#[tokio::test]
async fn test_podcast_session_forwards_progress() {
    let addr = serve().await;
    let client = GenerationClient::new(settings(addr).stream).unwrap();
    let output = VirtualOutput::new();
    let driver = PlaybackDriver::new(PlaybackMode::Wav);
    let (session, mut events) = PlaybackSession::new(
        Feature::Podcast,
        PlaybackConfig::default(),
        driver,
        Arc::new(output.clone()),
    );

    let request = GenerationRequest::text(Feature::Podcast, "rust");
    session.run_generation(&client, &request).await.unwrap();
    assert_eq!(session.wait_for_playback().await, PlaybackStatus::Complete);

    let mut phases = Vec::new();
    let mut transcript = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::Phase { percent, .. } => phases.push(percent),
            SessionEvent::Transcript(lines) => transcript = lines.len(),
            _ => {}
        }
    }
    assert_eq!(phases, vec![10.0, 60.0]);
    assert_eq!(transcript, 2);
    assert_eq!(output.completed(), vec![0, 1]);
}
