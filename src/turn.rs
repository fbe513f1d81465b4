//! Barge-in bookkeeping: which assistant audio item is currently playing out
//! on the carrier side, and where to truncate it if the caller interrupts.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AgentSpeaking,
    UserSpeaking,
}

/// Tracks enough state to answer "what's playing, and how far in are we"
/// without needing sample-accurate playback feedback from the carrier.
#[derive(Debug, Clone)]
pub struct TurnState {
    phase: Phase,
    last_assistant_item: Option<String>,
    response_start_timestamp: Option<i64>,
    latest_media_timestamp: i64,
    mark_queue: VecDeque<String>,
}

impl Default for TurnState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            last_assistant_item: None,
            response_start_timestamp: None,
            latest_media_timestamp: 0,
            mark_queue: VecDeque::new(),
        }
    }
}

impl TurnState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Record the carrier-reported timestamp of the most recent inbound
    /// media frame. Used as the clock `elapsed_ms` is measured against.
    pub fn update_media_timestamp(&mut self, timestamp_ms: i64) {
        self.latest_media_timestamp = timestamp_ms;
    }

    /// Record that an assistant audio delta for `item_id` has arrived, and
    /// queue a mark for it — one mark per delta, so the FIFO mark queue
    /// tracks carrier playback progress at delta granularity, not item
    /// granularity. Returns `true` the first time this item is seen.
    pub fn note_output_audio(&mut self, item_id: &str) -> bool {
        self.phase = Phase::AgentSpeaking;
        let is_new = self.last_assistant_item.as_deref() != Some(item_id);
        if is_new {
            self.last_assistant_item = Some(item_id.to_string());
        }
        if self.response_start_timestamp.is_none() {
            self.response_start_timestamp = Some(self.latest_media_timestamp);
        }
        self.mark_queue.push_back("responsePart".to_string());
        is_new
    }

    pub fn pop_mark(&mut self) -> Option<String> {
        self.mark_queue.pop_front()
    }

    /// Caller started speaking over the assistant. Returns the truncate
    /// instruction to send upstream, if any assistant item is in flight, and
    /// resets interrupt-tracking state per the turn-taking contract: the next
    /// audio delta starts a fresh response.
    pub fn handle_speech_started(&mut self) -> Option<TruncateInstruction> {
        self.phase = Phase::UserSpeaking;

        let instruction = match (&self.last_assistant_item, self.response_start_timestamp) {
            (Some(item_id), Some(start_ts)) => {
                let elapsed_ms = (self.latest_media_timestamp - start_ts).max(0);
                Some(TruncateInstruction {
                    item_id: item_id.clone(),
                    elapsed_ms,
                })
            }
            _ => None,
        };

        self.mark_queue.clear();
        self.last_assistant_item = None;
        self.response_start_timestamp = None;

        instruction
    }

    /// The assistant has finished its turn and the line has gone quiet.
    pub fn settle_to_idle(&mut self) {
        if self.phase != Phase::UserSpeaking {
            self.phase = Phase::Idle;
        }
    }

    pub fn last_assistant_item(&self) -> Option<&str> {
        self.last_assistant_item.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncateInstruction {
    pub item_id: String,
    pub elapsed_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_truncate_instruction_without_active_assistant_item() {
        let mut turn = TurnState::new();
        assert_eq!(turn.handle_speech_started(), None);
    }

    #[test]
    fn truncate_instruction_uses_elapsed_time_since_response_start() {
        let mut turn = TurnState::new();
        turn.update_media_timestamp(1000);
        turn.note_output_audio("item_1");
        turn.update_media_timestamp(1350);

        let instruction = turn.handle_speech_started().unwrap();
        assert_eq!(instruction.item_id, "item_1");
        assert_eq!(instruction.elapsed_ms, 350);
    }

    #[test]
    fn elapsed_ms_never_goes_negative() {
        let mut turn = TurnState::new();
        turn.update_media_timestamp(5000);
        turn.note_output_audio("item_1");
        // Clock moved backwards somehow (out-of-order frame) — clamp to zero
        // rather than sending a negative truncate point upstream.
        turn.update_media_timestamp(4000);

        let instruction = turn.handle_speech_started().unwrap();
        assert_eq!(instruction.elapsed_ms, 0);
    }

    #[test]
    fn interrupting_resets_state_so_next_item_starts_clean() {
        let mut turn = TurnState::new();
        turn.note_output_audio("item_1");
        turn.handle_speech_started();

        assert_eq!(turn.last_assistant_item(), None);
        assert_eq!(turn.pop_mark(), None);
        assert_eq!(turn.phase(), Phase::UserSpeaking);
    }

    #[test]
    fn every_delta_for_same_item_queues_its_own_mark() {
        let mut turn = TurnState::new();
        assert!(turn.note_output_audio("item_1"));
        assert!(!turn.note_output_audio("item_1"));
        assert!(!turn.note_output_audio("item_1"));
        assert_eq!(turn.pop_mark(), Some("responsePart".to_string()));
        assert_eq!(turn.pop_mark(), Some("responsePart".to_string()));
        assert_eq!(turn.pop_mark(), Some("responsePart".to_string()));
        assert_eq!(turn.pop_mark(), None);
    }

    #[test]
    fn settle_to_idle_is_a_no_op_while_user_is_speaking() {
        let mut turn = TurnState::new();
        turn.handle_speech_started();
        turn.settle_to_idle();
        assert_eq!(turn.phase(), Phase::UserSpeaking);
    }
}
