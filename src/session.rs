//! Session Orchestrator (C6): per-call lifecycle. Opens the Realtime link,
//! triggers the greeting, then multiplexes the carrier's media-stream
//! socket (main task) against the Realtime event stream (background task)
//! until either side closes or the call ends.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use base64::Engine;
use tokio::sync::{mpsc, Mutex};

use crate::codec::{self, AudioFormat, PolyphaseResampler};
use crate::config::Config;
use crate::dispatch::calendar::CalendarClient;
use crate::dispatch::knowledge_base::KnowledgeBaseClient;
use crate::dispatch::{self, DispatchContext, ToolCatalog, ToolOutcome};
use crate::instructions;
use crate::realtime::events::{
    AudioFormatSpec, AudioInputConfig, AudioOutputConfig, AudioSessionConfig, NoiseReductionConfig,
    SessionConfig, TranscriptionConfig, TurnDetectionConfig,
};
use crate::realtime::{
    is_harmless_truncation_overshoot, ClientEvent, ConversationItem, OutputItem, RealtimeEvent, RealtimeLink,
};
use crate::store::{CallStatus, Message, MessageRole, Store};
use crate::telephony::events::TelephonyEvent;
use crate::telephony::{self, TelephonyLink};
use crate::turn::TurnState;

/// Collaborators shared across every call on this instance.
#[derive(Clone)]
pub struct SessionDeps {
    pub store: Arc<Store>,
    pub knowledge_base: Arc<KnowledgeBaseClient>,
    pub calendar: Arc<CalendarClient>,
    pub config: Arc<Config>,
}

/// A message the background Realtime-event task asks the main carrier-socket
/// task to send. The carrier socket has one owner (the main task); this is
/// the channel-based decoupling spec.md's concurrency model calls for since
/// two tasks genuinely produce outbound carrier traffic.
enum TelephonyCommand {
    Send(WsMessage),
}

struct Session {
    call_id: i64,
    agent_id: i64,
    business_id: i64,
    stream_sid: String,
    turn: Mutex<TurnState>,
    transcript_buffer: Mutex<String>,
    answered_calls: Mutex<HashSet<String>>,
    final_status: Mutex<Option<CallStatus>>,
    closing: AtomicBool,
}

impl Session {
    /// Record the first-reported reason this call is ending. Later callers
    /// racing to report a different cause are ignored — the first trigger
    /// wins, matching the four-way close race spec.md §4.6 describes.
    async fn note_close(&self, status: CallStatus) {
        let mut guard = self.final_status.lock().await;
        if guard.is_none() {
            *guard = Some(status);
        }
    }

    async fn final_status(&self) -> CallStatus {
        self.final_status.lock().await.unwrap_or(CallStatus::Completed)
    }

    /// `true` the first time this call_id is seen; `false` on a duplicate
    /// delivery, which the caller should treat as a no-op rather than
    /// dispatching twice.
    async fn claim_call_id(&self, call_id: &str) -> bool {
        self.answered_calls.lock().await.insert(call_id.to_string())
    }

    fn begin_close(&self) -> bool {
        self.closing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Drive one call end-to-end. Consumes the upgraded WebSocket once the
/// carrier identifies itself with a `start` envelope.
pub async fn run(socket: WebSocket, deps: SessionDeps) {
    let start_attempts = deps.config.session.start_envelope_attempts;
    let (mut telephony, start) = match TelephonyLink::await_start(socket, start_attempts).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!("media stream never produced a usable start envelope: {e}");
            return;
        }
    };

    let Some(call_id) = parse_param(&start.custom_parameters, "call_id") else {
        tracing::error!("start envelope missing call_id custom parameter");
        return;
    };
    let Some(agent_id) = parse_param(&start.custom_parameters, "agent_id") else {
        tracing::error!("start envelope missing agent_id custom parameter");
        return;
    };

    let snapshot = match deps.store.load_agent_config(agent_id).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(agent_id, "failed to load agent config for session: {e}");
            let _ = deps.store.finalize_call(call_id, CallStatus::Failed).await;
            return;
        }
    };
    let business_id = snapshot.business_id;

    let catalog = ToolCatalog::for_agent(&snapshot);
    let instructions_blob = instructions::build(&snapshot, &catalog);

    let realtime = match RealtimeLink::connect(&deps.config.openai.realtime_url, &snapshot.model, &deps.config.openai.api_key).await
    {
        Ok(link) => Arc::new(link),
        Err(e) => {
            tracing::error!(call_id, "failed to connect to realtime API: {e}");
            let _ = deps.store.finalize_call(call_id, CallStatus::Failed).await;
            return;
        }
    };

    let audio_format = deps.config.openai.audio_format;
    let format_spec = AudioFormatSpec {
        kind: match audio_format {
            AudioFormat::MulawPassthrough => "audio/pcmu",
            AudioFormat::LinearPcm24k => "audio/pcm",
        },
    };
    let session_config = SessionConfig {
        kind: "realtime",
        instructions: instructions_blob,
        tools: catalog.definitions(),
        tool_choice: "auto",
        output_modalities: vec!["audio"],
        voice: snapshot.voice.clone(),
        audio: AudioSessionConfig {
            input: AudioInputConfig {
                format: format_spec,
                transcription: TranscriptionConfig {
                    model: "gpt-4o-mini-transcribe",
                },
                noise_reduction: NoiseReductionConfig { kind: "near_field" },
                turn_detection: TurnDetectionConfig {
                    kind: "server_vad",
                    silence_duration_ms: deps.config.session.turn_detection_silence_ms,
                    threshold: deps.config.session.turn_detection_threshold,
                },
            },
            output: AudioOutputConfig { format: format_spec },
        },
    };

    if let Err(e) = realtime.send(&ClientEvent::SessionUpdate { session: session_config }).await {
        tracing::error!(call_id, "failed to configure realtime session: {e}");
        let _ = deps.store.finalize_call(call_id, CallStatus::Failed).await;
        return;
    }
    if let Err(e) = realtime
        .send(&ClientEvent::ConversationItemCreate {
            item: ConversationItem::call_connected_marker(),
        })
        .await
    {
        tracing::warn!(call_id, "failed to seed greeting item: {e}");
    }
    if let Err(e) = realtime.send(&ClientEvent::ResponseCreate).await {
        tracing::warn!(call_id, "failed to trigger greeting response: {e}");
    }

    let session = Arc::new(Session {
        call_id,
        agent_id,
        business_id,
        stream_sid: telephony.stream_sid.clone(),
        turn: Mutex::new(TurnState::new()),
        transcript_buffer: Mutex::new(String::new()),
        answered_calls: Mutex::new(HashSet::new()),
        final_status: Mutex::new(None),
        closing: AtomicBool::new(false),
    });

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<TelephonyCommand>(32);

    let background = tokio::spawn(run_realtime_loop(
        Arc::clone(&realtime),
        Arc::clone(&session),
        catalog,
        deps.clone(),
        outbound_tx,
        audio_format,
    ));

    let mut upsampler = PolyphaseResampler::upsample_3x();
    let max_duration = tokio::time::sleep(std::time::Duration::from_secs(deps.config.session.max_duration_secs));
    tokio::pin!(max_duration);

    loop {
        tokio::select! {
            incoming = telephony.recv() => {
                match incoming {
                    Some(Ok(event)) => {
                        if handle_telephony_event(event, &realtime, &session, audio_format, &mut upsampler).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(call_id, "carrier socket error: {e}");
                        session.note_close(CallStatus::Failed).await;
                        break;
                    }
                    None => {
                        session.note_close(CallStatus::Failed).await;
                        break;
                    }
                }
            }
            cmd = outbound_rx.recv() => {
                match cmd {
                    Some(TelephonyCommand::Send(msg)) => {
                        if let Err(e) = telephony.send(msg).await {
                            tracing::warn!(call_id, "failed to send to carrier: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = &mut max_duration => {
                tracing::info!(call_id, "max session duration reached, ending call");
                session.note_close(CallStatus::Completed).await;
                break;
            }
        }
    }

    background.abort();

    if session.begin_close() {
        let status = session.final_status().await;
        if let Err(e) = deps.store.finalize_call(call_id, status).await {
            tracing::error!(call_id, "failed to finalize call row: {e}");
        }
    }
    let _ = realtime.close().await;
    let _ = telephony.close().await;
}

fn parse_param(params: &std::collections::HashMap<String, String>, key: &str) -> Option<i64> {
    params.get(key)?.parse().ok()
}

/// Handle one inbound carrier envelope. Returns `true` if the session should
/// close.
async fn handle_telephony_event(
    event: TelephonyEvent,
    realtime: &RealtimeLink,
    session: &Session,
    audio_format: AudioFormat,
    upsampler: &mut PolyphaseResampler,
) -> bool {
    match event {
        TelephonyEvent::Connected { .. } => false,
        TelephonyEvent::Start { .. } => false,
        TelephonyEvent::Media { media, .. } => {
            session.turn.lock().await.update_media_timestamp(media.timestamp);
            let Ok(mulaw) = base64_decode(&media.payload) else {
                tracing::warn!(call_id = session.call_id, "dropping media frame with invalid base64 payload");
                return false;
            };
            let llm_bytes = codec::decode_carrier_to_llm(&mulaw, audio_format, upsampler);
            let audio = base64::engine::general_purpose::STANDARD.encode(&llm_bytes);
            if let Err(e) = realtime.send(&ClientEvent::InputAudioBufferAppend { audio }).await {
                tracing::warn!(call_id = session.call_id, "failed to forward audio to realtime link: {e}");
                return true;
            }
            false
        }
        TelephonyEvent::Mark { mark, .. } => {
            match session.turn.lock().await.pop_mark() {
                Some(expected) if expected == mark.name => {}
                Some(expected) => {
                    tracing::warn!(
                        call_id = session.call_id,
                        expected = %expected,
                        acked = %mark.name,
                        "mark queue out of sync with carrier ack"
                    );
                }
                None => {
                    tracing::warn!(call_id = session.call_id, acked = %mark.name, "mark ack with empty queue");
                }
            }
            false
        }
        TelephonyEvent::Stop { .. } => {
            tracing::info!(call_id = session.call_id, "caller hung up");
            session.note_close(CallStatus::Completed).await;
            true
        }
    }
}

fn base64_decode(payload: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(payload)
}

/// Background task: read Realtime events, forward audio/state to the carrier
/// side over `outbound_tx`, persist transcripts, and dispatch function calls.
async fn run_realtime_loop(
    realtime: Arc<RealtimeLink>,
    session: Arc<Session>,
    catalog: ToolCatalog,
    deps: SessionDeps,
    outbound_tx: mpsc::Sender<TelephonyCommand>,
    audio_format: AudioFormat,
) {
    let mut downsampler = PolyphaseResampler::downsample_3x();
    let dispatch_ctx = DispatchContext {
        agent_id: session.agent_id,
        business_id: session.business_id,
        catalog: &catalog,
        knowledge_base: deps.knowledge_base.as_ref(),
        calendar: deps.calendar.as_ref(),
        end_call_grace: std::time::Duration::from_secs(deps.config.session.goodbye_grace_secs),
    };

    loop {
        match realtime.recv().await {
            Some(Ok(event)) => {
                if handle_realtime_event(event, &realtime, &session, &dispatch_ctx, &deps, &outbound_tx, &mut downsampler, audio_format)
                    .await
                {
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(call_id = session.call_id, "realtime link error: {e}");
                session.note_close(CallStatus::Failed).await;
                break;
            }
            None => {
                session.note_close(CallStatus::Failed).await;
                break;
            }
        }
    }
}

/// Returns `true` if the realtime loop (and therefore the call) should end.
async fn handle_realtime_event(
    event: RealtimeEvent,
    realtime: &RealtimeLink,
    session: &Session,
    dispatch_ctx: &DispatchContext<'_>,
    deps: &SessionDeps,
    outbound_tx: &mpsc::Sender<TelephonyCommand>,
    downsampler: &mut PolyphaseResampler,
    audio_format: AudioFormat,
) -> bool {
    match event {
        RealtimeEvent::SessionCreated { .. } | RealtimeEvent::SessionUpdated { .. } => false,

        RealtimeEvent::SpeechStarted => {
            let instruction = session.turn.lock().await.handle_speech_started();
            if let Some(instruction) = instruction {
                let _ = realtime
                    .send(&ClientEvent::ConversationItemTruncate {
                        item_id: instruction.item_id,
                        content_index: 0,
                        audio_end_ms: instruction.elapsed_ms,
                    })
                    .await;
                // Caller barge-in is a manual interrupt: stop the in-flight
                // response in addition to truncating what's already played.
                let _ = realtime.send(&ClientEvent::ResponseCancel).await;
            }
            let _ = outbound_tx
                .send(TelephonyCommand::Send(telephony::clear_message(&session.stream_sid)))
                .await;
            false
        }

        RealtimeEvent::InputTranscriptionCompleted { transcript } => {
            if !transcript.is_empty() {
                let message = Message {
                    call_id: session.call_id,
                    role: MessageRole::User,
                    content: transcript,
                };
                if let Err(e) = deps.store.insert_message(&message).await {
                    tracing::warn!(call_id = session.call_id, "failed to persist user message: {e}");
                }
            }
            false
        }

        RealtimeEvent::OutputAudioDelta { delta, item_id } => {
            session.turn.lock().await.note_output_audio(&item_id);
            let _ = outbound_tx
                .send(TelephonyCommand::Send(telephony::mark_message(&session.stream_sid, "responsePart")))
                .await;
            match base64_decode(&delta) {
                Ok(llm_bytes) => {
                    let mulaw = codec::encode_llm_to_carrier(&llm_bytes, audio_format, downsampler);
                    let _ = outbound_tx
                        .send(TelephonyCommand::Send(telephony::media_message(&session.stream_sid, &mulaw)))
                        .await;
                }
                Err(e) => tracing::warn!(call_id = session.call_id, "dropping malformed audio delta: {e}"),
            }
            false
        }

        RealtimeEvent::OutputTranscriptDelta { delta } => {
            session.transcript_buffer.lock().await.push_str(&delta);
            false
        }

        RealtimeEvent::OutputTranscriptDone { .. } => {
            let mut buffer = session.transcript_buffer.lock().await;
            if !buffer.is_empty() {
                let message = Message {
                    call_id: session.call_id,
                    role: MessageRole::Agent,
                    content: std::mem::take(&mut *buffer),
                };
                drop(buffer);
                if let Err(e) = deps.store.insert_message(&message).await {
                    tracing::warn!(call_id = session.call_id, "failed to persist agent message: {e}");
                }
            }
            session.turn.lock().await.settle_to_idle();
            false
        }

        RealtimeEvent::OutputItemDone {
            item: OutputItem::FunctionCall { call_id, name, arguments },
        } => {
            if !session.claim_call_id(&call_id).await {
                tracing::warn!(call_id = session.call_id, function_call_id = %call_id, "ignoring duplicate function call delivery");
                return false;
            }

            match dispatch::dispatch(&name, &arguments, dispatch_ctx).await {
                ToolOutcome::Answered { output, rearm } => {
                    let _ = realtime
                        .send(&ClientEvent::ConversationItemCreate {
                            item: ConversationItem::function_output(call_id, output),
                        })
                        .await;
                    if rearm {
                        let _ = realtime.send(&ClientEvent::ResponseCreate).await;
                    }
                    false
                }
                ToolOutcome::EndCallRequested { output, .. } => {
                    let _ = realtime
                        .send(&ClientEvent::ConversationItemCreate {
                            item: ConversationItem::function_output(call_id, output),
                        })
                        .await;
                    session.note_close(CallStatus::Completed).await;
                    true
                }
            }
        }
        RealtimeEvent::OutputItemDone { item: OutputItem::Other } => false,

        RealtimeEvent::Error { error } => {
            if is_harmless_truncation_overshoot(&error.message) {
                tracing::debug!(call_id = session.call_id, "swallowed truncation overshoot: {}", error.message);
            } else {
                tracing::warn!(call_id = session.call_id, code = ?error.code, "realtime API error: {}", error.message);
            }
            false
        }

        RealtimeEvent::Other => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session {
            call_id: 1,
            agent_id: 1,
            business_id: 1,
            stream_sid: "MZ1".to_string(),
            turn: Mutex::new(TurnState::new()),
            transcript_buffer: Mutex::new(String::new()),
            answered_calls: Mutex::new(HashSet::new()),
            final_status: Mutex::new(None),
            closing: AtomicBool::new(false),
        }
    }

    #[tokio::test]
    async fn first_close_reason_wins() {
        let s = session();
        s.note_close(CallStatus::Failed).await;
        s.note_close(CallStatus::Completed).await;
        assert_eq!(s.final_status().await, CallStatus::Failed);
    }

    #[tokio::test]
    async fn call_id_is_claimed_exactly_once() {
        let s = session();
        assert!(s.claim_call_id("call_1").await);
        assert!(!s.claim_call_id("call_1").await);
    }

    #[test]
    fn begin_close_only_succeeds_once() {
        let s = session();
        assert!(s.begin_close());
        assert!(!s.begin_close());
    }
}
