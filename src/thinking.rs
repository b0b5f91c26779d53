//! Thinking-tag stream parser
//!
//! Splits a token stream into an answer lane and a thinking lane without
//! buffering ahead: thinking tokens are passed through optimistically,
//! tagged as provisional, and relocated retroactively once the thinking
//! region closes. The client deletes the provisional tokens from the main
//! lane and renders the extracted interior in the thinking lane.
//!
//! Tag detection runs on accumulated content, so tags split across tokens
//! are recognized; at most `tag_len - 1` trailing bytes are withheld from
//! emission while a tag prefix is pending.

use uuid::Uuid;

use crate::models::ModelProfile;

/// Output of one parser step.
#[derive(Debug, Clone, PartialEq)]
pub enum ParserEvent {
    /// Text for the main lane. `is_pending_thinking` marks provisional
    /// tokens that a later `MoveToThinking` may relocate.
    Stream {
        text: String,
        message_id: Option<String>,
        is_pending_thinking: bool,
    },
    /// Relocate the listed provisional tokens into the thinking lane.
    MoveToThinking {
        content: String,
        message_id: String,
        pending_tokens: Vec<String>,
    },
    /// The thinking region closed; no more provisional tokens follow.
    ThinkingComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Before any region marker.
    Lead,
    /// Inside the thinking region.
    Thinking,
    /// After thinking, outside any response region.
    Final,
    /// Inside the response region.
    Answer,
    /// After the response region closed.
    Done,
}

/// Per-stream parser state.
pub struct ThinkingParser {
    profile: ModelProfile,
    phase: Phase,
    /// Unemitted text withheld for tag detection.
    window: String,
    /// Everything received, for diagnostics.
    full_content: String,
    /// Accumulated thinking interior.
    thinking_buffer: String,
    pending_thinking_tokens: Vec<String>,
    thinking_message_id: Option<String>,
    has_thinking_started: bool,
    has_response_started: bool,
}

impl ThinkingParser {
    pub fn new(profile: ModelProfile) -> Self {
        Self {
            profile,
            phase: Phase::Lead,
            window: String::new(),
            full_content: String::new(),
            thinking_buffer: String::new(),
            pending_thinking_tokens: Vec::new(),
            thinking_message_id: None,
            has_thinking_started: false,
            has_response_started: false,
        }
    }

    pub fn full_content(&self) -> &str {
        &self.full_content
    }

    pub fn has_thinking_started(&self) -> bool {
        self.has_thinking_started
    }

    pub fn thinking_message_id(&self) -> Option<&str> {
        self.thinking_message_id.as_deref()
    }

    /// Feed one token; returns the events it produced.
    pub fn push(&mut self, token: &str) -> Vec<ParserEvent> {
        self.full_content.push_str(token);
        let mut events = Vec::new();

        if !self.profile.supports_thinking {
            if !token.is_empty() {
                events.push(ParserEvent::Stream {
                    text: token.to_string(),
                    message_id: None,
                    is_pending_thinking: false,
                });
            }
            return events;
        }

        self.window.push_str(token);
        self.drain_window(&mut events);
        events
    }

    /// Flush whatever the window still holds. Called once the stream ends;
    /// a withheld tag prefix that never completed is ordinary text.
    pub fn finish(&mut self) -> Vec<ParserEvent> {
        let mut events = Vec::new();
        if self.window.is_empty() {
            return events;
        }
        let text = std::mem::take(&mut self.window);
        self.emit_text(&text, &mut events);
        events
    }

    /// Process the window until no complete tag remains.
    fn drain_window(&mut self, events: &mut Vec<ParserEvent>) {
        loop {
            let watched = self.watched_tags();
            let hit = earliest_tag(&self.window, &watched);

            match hit {
                Some((pos, tag_len)) => {
                    let before = self.window[..pos].to_string();
                    let matched = self.window[pos..pos + tag_len].to_string();
                    self.window = self.window[pos + tag_len..].to_string();
                    if !before.is_empty() {
                        self.emit_text(&before, events);
                    }
                    self.transition(&matched, events);
                }
                None => {
                    let held = held_suffix_len(&self.window, &watched);
                    let emit_len = self.window.len() - held;
                    if emit_len > 0 {
                        let text = self.window[..emit_len].to_string();
                        self.window = self.window[emit_len..].to_string();
                        self.emit_text(&text, events);
                    }
                    return;
                }
            }
        }
    }

    /// Tags that can change phase right now.
    fn watched_tags(&self) -> Vec<&str> {
        let mut tags = Vec::new();
        match self.phase {
            Phase::Lead => {
                if !self.profile.think_start.is_empty() {
                    tags.push(self.profile.think_start.as_str());
                }
                if self.profile.uses_response_tags() {
                    tags.push(self.profile.response_start.as_str());
                }
            }
            Phase::Thinking => {
                if !self.profile.think_end.is_empty() {
                    tags.push(self.profile.think_end.as_str());
                }
                // For response-tagged models the answer marker also
                // terminates thinking.
                if self.profile.uses_response_tags() {
                    tags.push(self.profile.response_start.as_str());
                }
            }
            Phase::Final => {
                if self.profile.uses_response_tags() && !self.has_response_started {
                    tags.push(self.profile.response_start.as_str());
                }
            }
            Phase::Answer => {
                if !self.profile.response_end.is_empty() {
                    tags.push(self.profile.response_end.as_str());
                }
            }
            Phase::Done => {}
        }
        tags
    }

    fn transition(&mut self, matched: &str, events: &mut Vec<ParserEvent>) {
        match self.phase {
            Phase::Lead => {
                if matched == self.profile.think_start {
                    self.phase = Phase::Thinking;
                    self.has_thinking_started = true;
                    self.thinking_message_id = Some(Uuid::new_v4().to_string());
                } else {
                    // Response region with no thinking ahead of it.
                    self.phase = Phase::Answer;
                    self.has_response_started = true;
                }
            }
            Phase::Thinking => {
                let interior = std::mem::take(&mut self.thinking_buffer);
                let pending = std::mem::take(&mut self.pending_thinking_tokens);
                if !interior.trim().is_empty() {
                    let message_id = self
                        .thinking_message_id
                        .clone()
                        .unwrap_or_else(|| Uuid::new_v4().to_string());
                    events.push(ParserEvent::MoveToThinking {
                        content: interior,
                        message_id,
                        pending_tokens: pending,
                    });
                    events.push(ParserEvent::ThinkingComplete);
                }
                if matched == self.profile.response_start {
                    self.phase = Phase::Answer;
                    self.has_response_started = true;
                } else {
                    self.phase = Phase::Final;
                }
            }
            Phase::Final => {
                self.phase = Phase::Answer;
                self.has_response_started = true;
            }
            Phase::Answer => {
                self.phase = Phase::Done;
            }
            Phase::Done => {}
        }
    }

    fn emit_text(&mut self, text: &str, events: &mut Vec<ParserEvent>) {
        match self.phase {
            Phase::Thinking => {
                self.thinking_buffer.push_str(text);
                self.pending_thinking_tokens.push(text.to_string());
                events.push(ParserEvent::Stream {
                    text: text.to_string(),
                    message_id: self.thinking_message_id.clone(),
                    is_pending_thinking: true,
                });
            }
            _ => {
                events.push(ParserEvent::Stream {
                    text: text.to_string(),
                    message_id: None,
                    is_pending_thinking: false,
                });
            }
        }
    }
}

/// Earliest occurrence of any watched tag: `(byte_pos, tag_len)`.
fn earliest_tag(buffer: &str, tags: &[&str]) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;
    for tag in tags {
        if tag.is_empty() {
            continue;
        }
        if let Some(pos) = buffer.find(tag) {
            if best.map_or(true, |(p, _)| pos < p) {
                best = Some((pos, tag.len()));
            }
        }
    }
    best
}

/// Longest proper tag prefix sitting at the end of the buffer. That many
/// bytes are withheld from emission until the tag resolves.
fn held_suffix_len(buffer: &str, tags: &[&str]) -> usize {
    let mut held = 0;
    for tag in tags {
        for len in (1..tag.len()).rev() {
            if len <= held {
                break;
            }
            if buffer.ends_with(&tag[..len]) {
                held = len;
                break;
            }
        }
    }
    held
}
