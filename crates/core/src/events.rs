//! Inbound Event Demultiplexing
//!
//! The remote service speaks JSON over the transport's data channel. Each
//! message carries a `type` discriminator; this module folds the wire names
//! into a closed set of [`ChannelEvent`] variants and fans them out to
//! subscribers in arrival order.

use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How many closed turn ids are remembered for duplicate suppression.
const CLOSED_TURN_MEMORY: usize = 1024;

/// Which side of the conversation a transcript fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptSource {
    /// The user's recognized speech.
    Input,
    /// The assistant's generated reply.
    Output,
}

/// One piece of transcript text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptFragment {
    pub source: TranscriptSource,
    pub text: String,
    pub is_final: bool,
    /// Arrival order across the session, assigned by the channel.
    pub sequence: u64,
    /// Turn identity reported by the wire (`item_id` or `response_id`).
    pub turn_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Debug,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ToolPhase {
    #[serde(rename = "tool.started")]
    Started,
    #[serde(rename = "tool.completed")]
    Completed,
    #[serde(rename = "tool.failed")]
    Failed,
}

impl ToolPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolPhase::Started => "tool.started",
            ToolPhase::Completed => "tool.completed",
            ToolPhase::Failed => "tool.failed",
        }
    }
}

/// Observability record for a tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolActivity {
    pub phase: ToolPhase,
    pub name: String,
    pub call_id: String,
    pub detail: Value,
}

/// A remote request to run a locally registered function.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub name: String,
    pub call_id: String,
    pub arguments: Value,
}

/// Everything a subscriber can observe.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    TranscriptDelta(TranscriptFragment),
    TranscriptFinal(TranscriptFragment),
    Diagnostic { level: DiagnosticLevel, payload: Value },
    ToolCall(ToolCallRequest),
    Tool(ToolActivity),
    /// A well-formed message whose `type` is not in the recognized set.
    Unknown { kind: String, payload: Value },
    /// A human-readable line from the lifecycle controller.
    Log(String),
}

/// Subscriber fan-out shared by the controller and every session's channel.
///
/// Each subscriber owns an unbounded queue, so a slow reader never reorders
/// or drops events for the others.
#[derive(Clone, Default)]
pub struct EventHub {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<ChannelEvent>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Delivers the event to every live subscriber, pruning closed ones.
    pub fn publish(&self, event: ChannelEvent) {
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn log(&self, line: impl Into<String>) {
        self.publish(ChannelEvent::Log(line.into()));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<ChannelEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("subscribers", &self.lock().len())
            .finish()
    }
}

/// Why a message was dropped instead of being forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dropped {
    Malformed(String),
    EmptyText,
    DuplicateFinal,
}

type TurnKey = (TranscriptSource, String);

/// Per-session demultiplexer.
pub struct EventChannel {
    hub: EventHub,
    sequence: u64,
    closed_turns: HashSet<TurnKey>,
    closed_order: VecDeque<TurnKey>,
    /// Text of the last final per source that carried no turn id. Cleared as
    /// soon as any other fragment for that source arrives.
    last_anonymous_final: HashMap<TranscriptSource, String>,
}

impl EventChannel {
    pub fn new(hub: EventHub) -> Self {
        Self {
            hub,
            sequence: 0,
            closed_turns: HashSet::new(),
            closed_order: VecDeque::new(),
            last_anonymous_final: HashMap::new(),
        }
    }

    /// Parses and classifies one inbound message, publishing it on success.
    ///
    /// The published event is also returned so the caller can react to it
    /// (tool calls in particular) without a second subscription.
    pub fn ingest(&mut self, raw: &str) -> Result<ChannelEvent, Dropped> {
        let event = self.classify(raw).inspect_err(|reason| match reason {
            Dropped::Malformed(why) => warn!(%why, payload = %raw, "Dropping malformed event"),
            other => debug!(reason = ?other, "Dropping event"),
        })?;
        if let ChannelEvent::Unknown { kind, .. } = &event {
            debug!(%kind, payload = %raw, "Unrecognized event type");
        }
        self.hub.publish(event.clone());
        Ok(event)
    }

    fn classify(&mut self, raw: &str) -> Result<ChannelEvent, Dropped> {
        let payload: Value =
            serde_json::from_str(raw).map_err(|e| Dropped::Malformed(e.to_string()))?;
        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Dropped::Malformed("missing `type` discriminator".to_string()))?
            .to_string();

        let event = match kind.as_str() {
            "response.delta" | "response.text.delta" | "response.audio_transcript.delta" => {
                ChannelEvent::TranscriptDelta(self.fragment(&payload, TranscriptSource::Output, false)?)
            }
            "response.completed" | "response.text.done" | "response.audio_transcript.done" => {
                self.final_fragment(&payload, TranscriptSource::Output)?
            }
            "input_audio.transcript.delta" | "conversation.item.input_audio_transcription.delta" => {
                ChannelEvent::TranscriptDelta(self.fragment(&payload, TranscriptSource::Input, false)?)
            }
            "input_audio.transcript.completed"
            | "conversation.item.input_audio_transcription.completed" => {
                self.final_fragment(&payload, TranscriptSource::Input)?
            }
            "debug" => diagnostic(DiagnosticLevel::Debug, payload),
            "warning" => diagnostic(DiagnosticLevel::Warning, payload),
            "error" => diagnostic(DiagnosticLevel::Error, payload),
            "tool.call" | "response.function_call_arguments.done" => {
                ChannelEvent::ToolCall(tool_call(&payload)?)
            }
            "tool.started" => tool_activity(ToolPhase::Started, payload),
            "tool.completed" => tool_activity(ToolPhase::Completed, payload),
            "tool.failed" => tool_activity(ToolPhase::Failed, payload),
            _ => ChannelEvent::Unknown { kind, payload },
        };
        Ok(event)
    }

    fn fragment(
        &mut self,
        payload: &Value,
        source: TranscriptSource,
        is_final: bool,
    ) -> Result<TranscriptFragment, Dropped> {
        let text = ["delta", "text", "transcript"]
            .iter()
            .find_map(|key| payload.get(*key).and_then(Value::as_str))
            .filter(|t| !t.is_empty())
            .ok_or(Dropped::EmptyText)?
            .to_string();
        let turn_id = ["item_id", "response_id"]
            .iter()
            .find_map(|key| payload.get(*key).and_then(Value::as_str))
            .map(str::to_string);
        if !is_final {
            self.last_anonymous_final.remove(&source);
        }
        self.sequence += 1;
        Ok(TranscriptFragment {
            source,
            text,
            is_final,
            sequence: self.sequence,
            turn_id,
        })
    }

    fn final_fragment(
        &mut self,
        payload: &Value,
        source: TranscriptSource,
    ) -> Result<ChannelEvent, Dropped> {
        let fragment = self.fragment(payload, source, true)?;
        match &fragment.turn_id {
            Some(id) => {
                let key = (source, id.clone());
                if !self.closed_turns.insert(key.clone()) {
                    return Err(Dropped::DuplicateFinal);
                }
                self.closed_order.push_back(key);
                if self.closed_order.len() > CLOSED_TURN_MEMORY
                    && let Some(evicted) = self.closed_order.pop_front()
                {
                    self.closed_turns.remove(&evicted);
                }
                self.last_anonymous_final.remove(&source);
            }
            // Without an id only an immediate redelivery counts as a duplicate.
            None => {
                if self.last_anonymous_final.get(&source) == Some(&fragment.text) {
                    return Err(Dropped::DuplicateFinal);
                }
                self.last_anonymous_final.insert(source, fragment.text.clone());
            }
        }
        Ok(ChannelEvent::TranscriptFinal(fragment))
    }
}

fn diagnostic(level: DiagnosticLevel, payload: Value) -> ChannelEvent {
    ChannelEvent::Diagnostic { level, payload }
}

fn tool_activity(phase: ToolPhase, payload: Value) -> ChannelEvent {
    let field = |key: &str| {
        payload
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    ChannelEvent::Tool(ToolActivity {
        phase,
        name: field("name"),
        call_id: field("call_id"),
        detail: payload,
    })
}

fn tool_call(payload: &Value) -> Result<ToolCallRequest, Dropped> {
    let name = payload
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Dropped::Malformed("tool call without a name".to_string()))?;
    let call_id = ["call_id", "id", "item_id"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .unwrap_or_default();
    // The realtime wire sends arguments as a JSON-encoded string.
    let arguments = match payload.get("arguments") {
        Some(Value::String(encoded)) if encoded.trim().is_empty() => Value::Object(Default::default()),
        Some(Value::String(encoded)) => {
            serde_json::from_str(encoded).unwrap_or_else(|_| Value::String(encoded.clone()))
        }
        Some(other) => other.clone(),
        None => Value::Object(Default::default()),
    };
    Ok(ToolCallRequest {
        name: name.to_string(),
        call_id: call_id.to_string(),
        arguments,
    })
}

/// One row of the rendered transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub source: TranscriptSource,
    pub text: String,
    pub is_final: bool,
}

/// Folds transcript fragments into entries, one per turn.
#[derive(Debug, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    open: Vec<(TranscriptSource, Option<String>, usize)>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn apply(&mut self, event: &ChannelEvent) {
        match event {
            ChannelEvent::TranscriptDelta(fragment) => {
                let index = self.open_entry(fragment);
                self.entries[index].text.push_str(&fragment.text);
            }
            ChannelEvent::TranscriptFinal(fragment) => {
                let index = self.open_entry(fragment);
                let entry = &mut self.entries[index];
                entry.text = fragment.text.clone();
                entry.is_final = true;
                self.open
                    .retain(|(source, turn, _)| !(*source == fragment.source && *turn == fragment.turn_id));
            }
            _ => {}
        }
    }

    fn open_entry(&mut self, fragment: &TranscriptFragment) -> usize {
        if let Some((_, _, index)) = self
            .open
            .iter()
            .find(|(source, turn, _)| *source == fragment.source && *turn == fragment.turn_id)
        {
            return *index;
        }
        self.entries.push(TranscriptEntry {
            source: fragment.source,
            text: String::new(),
            is_final: false,
        });
        let index = self.entries.len() - 1;
        self.open.push((fragment.source, fragment.turn_id.clone(), index));
        index
    }
}
