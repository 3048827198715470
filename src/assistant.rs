//! Assistant runtime
//!
//! Wires the microphone, the realtime channel, tool execution and the turn
//! controller into one event loop. cpal streams are not `Send`, so the loop
//! runs on the calling task; tool calls and reconnect attempts are spawned so
//! the microphone keeps draining while they run.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::RealtimeConfig;
use crate::realtime::{
    ChannelEvent, ClientEvent, RealtimeConnection, RealtimeSink, SessionConfig, ToolRequest,
};
use crate::tools::ToolRegistry;
use crate::turn::{TurnController, TurnSettings};
use crate::voice::{AudioCapture, AudioFormat, CaptureEvent, DeviceSpeakerFactory, WakeWordDetector};
use crate::{Config, Error, Result};

/// Delay before reopening a lost realtime channel
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// A finished tool call: `(call_id, output)`
type ToolResult = (String, String);

/// A pending attempt to reopen the realtime channel
type Reconnect = JoinHandle<Result<RealtimeConnection>>;

/// The voice assistant
pub struct Assistant {
    config: Config,
    tools: Arc<ToolRegistry>,
}

impl Assistant {
    /// Create an assistant with the tools its configuration enables
    #[must_use]
    pub fn new(config: Config) -> Self {
        let tools = Arc::new(ToolRegistry::from_config(&config.tools));
        Self { config, tools }
    }

    /// Run until interrupted or the microphone fails
    ///
    /// # Errors
    ///
    /// Returns error if the model, devices or first connection cannot be
    /// opened, or if capture fails while running
    #[allow(clippy::future_not_send)]
    pub async fn run(self) -> Result<()> {
        let format = AudioFormat::pcm16_mono(self.config.audio.sample_rate);
        let detector = WakeWordDetector::load_model(&self.config.wake)?;
        let setup = self.setup_messages()?;

        let first = connect(&self.config.realtime, &setup).await?;
        let mut controller = TurnController::new(
            TurnSettings::from_config(&self.config),
            format,
            detector,
            first.sender.clone(),
            DeviceSpeakerFactory::new(self.config.audio.speaker_backend),
            Instant::now(),
        )?;
        let mut connection = Some(first);
        let mut reconnecting: Option<Reconnect> = None;

        let (capture_tx, mut capture_rx) = mpsc::unbounded_channel();
        let mut capture = AudioCapture::new(format)?;
        capture.start(capture_tx)?;

        let (tool_tx, mut tool_rx) = mpsc::unbounded_channel::<ToolResult>();
        let mut ticker = tokio::time::interval(self.config.turn.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            wake_word = %self.config.wake.wake_word,
            sample_rate = format.sample_rate,
            tools = self.tools.len(),
            "listening for wake word"
        );

        let outcome = loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown requested");
                    break Ok(());
                }
                Some(event) = capture_rx.recv() => match event {
                    CaptureEvent::Audio(frame) => {
                        // While disconnected the controller stays asleep and only feeds the detector
                        if let Err(e) = controller.on_audio(&frame, Instant::now()) {
                            tracing::debug!(error = %e, "audio not forwarded");
                        }
                    }
                    CaptureEvent::Failed(reason) => {
                        let error = Error::Audio(reason);
                        controller.on_device_error(&error);
                        break Err(error);
                    }
                },
                event = next_channel_event(connection.as_mut()) => {
                    let reason = match event {
                        Some(ChannelEvent::Message(message)) => {
                            if self.config.debug {
                                tracing::debug!(kind = message.kind(), "event");
                            }
                            if let Some(request) = controller.on_server_event(message, Instant::now()) {
                                self.spawn_tool(request, tool_tx.clone());
                            }
                            continue;
                        }
                        Some(ChannelEvent::Closed(reason)) => reason,
                        None => None,
                    };

                    controller.on_channel_closed(reason.as_deref());
                    if let Some(lost) = connection.take() {
                        lost.close().await;
                    }
                    reconnecting = Some(spawn_reconnect(self.config.realtime.clone(), setup.clone()));
                }
                attempt = reconnect_finished(reconnecting.as_mut()) => {
                    reconnecting = None;
                    match attempt {
                        Ok(reopened) => {
                            tracing::info!("realtime channel reopened");
                            controller.replace_channel(reopened.sender.clone());
                            connection = Some(reopened);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "reconnect failed");
                            reconnecting = Some(spawn_reconnect(self.config.realtime.clone(), setup.clone()));
                        }
                    }
                }
                Some((call_id, output)) = tool_rx.recv() => {
                    if let Err(e) = controller.send_tool_result(call_id, output) {
                        tracing::warn!(error = %e, "could not deliver tool result");
                    }
                }
                _ = ticker.tick() => controller.on_tick(Instant::now()),
            }
        };

        capture.stop();
        controller.on_channel_closed(Some("shutdown"));
        if let Some(pending) = reconnecting {
            pending.abort();
        }
        if let Some(connection) = connection {
            connection.close().await;
        }
        tracing::info!("assistant stopped");
        outcome
    }

    /// Messages sent every time the channel opens
    fn setup_messages(&self) -> Result<Vec<ClientEvent>> {
        let realtime = &self.config.realtime;
        let mut setup = vec![ClientEvent::SessionUpdate {
            session: SessionConfig::pcm16(
                realtime.voice.clone(),
                realtime.instructions.clone(),
                self.tools.schemas(),
            ),
        }];

        if let Some(path) = &self.config.memory_path {
            setup.push(ClientEvent::system_message(load_memory(path)?));
        }

        Ok(setup)
    }

    fn spawn_tool(&self, request: ToolRequest, tx: mpsc::UnboundedSender<ToolResult>) {
        let tools = Arc::clone(&self.tools);
        tokio::spawn(async move {
            let output = tools.execute(&request).await;
            tracing::debug!(tool = %request.name, bytes = output.len(), "tool finished");
            let _ = tx.send((request.call_id, output));
        });
    }
}

/// Read the memory file and re-encode it compactly
///
/// # Errors
///
/// Returns error if the file is unreadable or not JSON
pub fn load_memory(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    tracing::debug!(path = %path.display(), "loaded memory");
    Ok(value.to_string())
}

/// Open the channel and send the setup messages
async fn connect(config: &RealtimeConfig, setup: &[ClientEvent]) -> Result<RealtimeConnection> {
    let connection = RealtimeConnection::connect(config).await?;
    let mut sender = connection.sender.clone();
    for message in setup {
        sender.send(message.clone())?;
    }
    Ok(connection)
}

/// Try to reconnect after [`RECONNECT_DELAY`] without blocking the event loop
fn spawn_reconnect(config: RealtimeConfig, setup: Vec<ClientEvent>) -> Reconnect {
    tracing::info!(delay_secs = RECONNECT_DELAY.as_secs(), "reconnecting to realtime api");
    tokio::spawn(async move {
        tokio::time::sleep(RECONNECT_DELAY).await;
        connect(&config, &setup).await
    })
}

/// Next inbound event, or never while disconnected
async fn next_channel_event(connection: Option<&mut RealtimeConnection>) -> Option<ChannelEvent> {
    match connection {
        Some(connection) => connection.events.recv().await,
        None => std::future::pending().await,
    }
}

/// Outcome of the pending reconnect, or never when none is running
async fn reconnect_finished(task: Option<&mut Reconnect>) -> Result<RealtimeConnection> {
    match task {
        Some(task) => task
            .await
            .map_err(|e| Error::Channel(format!("reconnect task failed: {e}")))?,
        None => std::future::pending().await,
    }
}
