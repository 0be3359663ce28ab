//! Command handlers

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use vocast_core::{
    AudioOutput, CombinedTrack, GenerationClient, GenerationRequest, PlaybackDriver, PlaybackMode,
    PlaybackSession, PlaybackStatus, PlayerEvent, SessionEvent, Settings, TrackPlayer,
    VirtualOutput,
};

use crate::cli::{PlayArgs, SpeakArgs};
use crate::progress::{GenerationProgress, TrackProgress};

/// Output for this run; without the `device` feature everything is headless
pub fn open_output(headless: bool) -> Result<Arc<dyn AudioOutput>> {
    #[cfg(feature = "device")]
    if !headless {
        let device = vocast_core::DeviceOutput::open().context("failed to open audio device")?;
        return Ok(Arc::new(device));
    }
    #[cfg(not(feature = "device"))]
    if !headless {
        warn!("Built without audio device support; playing headless");
    }
    Ok(Arc::new(VirtualOutput::new()))
}

/// What `speak` did, for callers that need more than the exit status
#[derive(Debug, Clone)]
pub struct SpeakOutcome {
    pub status: PlaybackStatus,
    pub chunks: usize,
    pub written: Option<PathBuf>,
}

/// `vocast speak`
pub async fn speak(settings: &Settings, args: SpeakArgs) -> Result<SpeakOutcome> {
    let output = open_output(args.headless)?;
    speak_with_output(settings, args, output).await
}

/// `vocast speak` on a given output
pub async fn speak_with_output(
    settings: &Settings,
    args: SpeakArgs,
    output: Arc<dyn AudioOutput>,
) -> Result<SpeakOutcome> {
    let request = build_request(&args)?;
    let mut playback = settings.playback.clone();
    if let Some(strategy) = args.strategy {
        playback.strategy = strategy;
    }
    if args.no_autoplay {
        playback.autoplay = false;
    }

    let client = GenerationClient::new(settings.stream.clone())?;
    let driver = PlaybackDriver::new(PlaybackMode::Wav);
    let _registration = driver.register_output(&output);
    let (session, events) = PlaybackSession::new(args.feature, playback, driver, output);
    let renderer = spawn_renderer(events);

    info!(session = %session.id(), feature = %args.feature, "Speaking");

    let generation = tokio::select! {
        result = session.run_generation(&client, &request) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            session.stop();
            drop(session);
            let _ = renderer.await;
            return Ok(SpeakOutcome { status: PlaybackStatus::Idle, chunks: 0, written: None });
        }
    };
    if let Err(e) = &generation {
        warn!("Generation ended with an error: {}", e);
    }

    if args.no_autoplay && !session.chunks().is_empty() {
        session.play()?;
    }

    let status = tokio::select! {
        status = session.wait_for_playback() => status,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            session.stop();
            PlaybackStatus::Idle
        }
    };

    let chunks = session.chunks().len();
    let written = match target_path(settings, &args, &session) {
        Some(path) if chunks > 0 => {
            let track = match session.combined() {
                Some(track) => track,
                None => session.combine()?,
            };
            track.write_to(&path)?;
            Some(path)
        }
        _ => None,
    };

    drop(session);
    let _ = renderer.await;

    generation.context("generation failed")?;
    Ok(SpeakOutcome {
        status,
        chunks,
        written,
    })
}

fn build_request(args: &SpeakArgs) -> Result<GenerationRequest> {
    match (&args.text, &args.body) {
        (_, Some(body)) => {
            let body = serde_json::from_str(body).context("--body is not valid JSON")?;
            Ok(GenerationRequest::new(args.feature, body))
        }
        (Some(text), None) => Ok(GenerationRequest::text(args.feature, text.clone())),
        (None, None) => bail!("either --text or --body is required"),
    }
}

fn target_path(settings: &Settings, args: &SpeakArgs, session: &PlaybackSession) -> Option<PathBuf> {
    if let Some(out) = &args.out {
        return Some(out.clone());
    }
    args.save.then(|| {
        settings
            .output
            .dir
            .join(format!("{}-{}.wav", args.feature, session.id()))
    })
}

/// Renders session events until every sender is gone
fn spawn_renderer(mut events: mpsc::UnboundedReceiver<SessionEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut progress = GenerationProgress::new();
        while let Some(event) = events.recv().await {
            progress.handle(&event);
        }
        progress.finish();
    })
}

/// `vocast play`
pub async fn play(settings: &Settings, args: PlayArgs) -> Result<()> {
    let bytes = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let track = Arc::new(CombinedTrack::from_wav(&bytes)?);
    info!(
        "Playing {} ({:.1}s at {} Hz)",
        args.file.display(),
        track.duration(),
        track.sample_rate()
    );

    let output = open_output(args.headless)?;
    let driver = PlaybackDriver::new(PlaybackMode::Wav);
    let _registration = driver.register_output(&output);
    let (player, mut events) = TrackPlayer::new(Arc::clone(&track), driver, output);
    let progress = TrackProgress::new(track.duration());

    player.seek(args.from)?;
    player.play()?;
    let ticker = player.spawn_time_updates(settings.playback.time_update_interval());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(PlayerEvent::Ended) | None => break,
                Some(event) => progress.handle(&event),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                player.stop();
                break;
            }
        }
    }

    ticker.abort();
    progress.finish();
    Ok(())
}

/// `vocast config`
pub fn print_config(settings: &Settings) -> Result<()> {
    let rendered = toml::to_string_pretty(settings).context("failed to render settings")?;
    print!("{rendered}");
    Ok(())
}
