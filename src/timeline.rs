use crate::types::{ChatTurn, Role, TurnKind};

/// Append-only conversation timeline. Only the in-flight assistant turn's
/// content is ever mutated, and only through `TurnBuilder`.
#[derive(Debug, Default)]
pub struct Timeline {
    turns: Vec<ChatTurn>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn push(&mut self, turn: ChatTurn) -> usize {
        self.turns.push(turn);
        self.turns.len() - 1
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(ChatTurn::new(Role::User, TurnKind::Text, content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.push(ChatTurn::new(Role::Assistant, TurnKind::Text, content));
    }

    pub fn push_status(&mut self, content: impl Into<String>) {
        self.push(ChatTurn::new(Role::System, TurnKind::Status, content));
    }

    fn set_content(&mut self, index: usize, content: &str) {
        if let Some(turn) = self.turns.get_mut(index) {
            if turn.content != content {
                turn.content = content.to_string();
            }
        }
    }
}

/// Per-turn assembler for the streamed assistant reply. Scoped to the
/// lifetime of one stream: `finish` freezes the turn and resets the builder,
/// so no assembler state survives past a `done` boundary.
#[derive(Debug, Default)]
pub struct TurnBuilder {
    open: Option<usize>,
    buf: String,
}

impl TurnBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn current_text(&self) -> &str {
        &self.buf
    }

    /// Append one token fragment, opening the assistant turn on the first.
    pub fn append_token(&mut self, timeline: &mut Timeline, fragment: &str) {
        self.buf.push_str(fragment);
        self.render(timeline);
    }

    /// Wholesale replacement from a `message` event. Idempotent: applying the
    /// same full text twice yields the same visible state.
    pub fn replace_text(&mut self, timeline: &mut Timeline, full_text: &str) {
        self.buf.clear();
        self.buf.push_str(full_text);
        self.render(timeline);
    }

    /// Freeze the current turn and reset for the next stream. Returns whether
    /// an assistant turn had been opened.
    pub fn finish(&mut self) -> bool {
        let was_open = self.open.is_some();
        self.open = None;
        self.buf.clear();
        was_open
    }

    fn render(&mut self, timeline: &mut Timeline) {
        match self.open {
            Some(index) => timeline.set_content(index, &self.buf),
            None => {
                let index = timeline.push(ChatTurn::new(
                    Role::Assistant,
                    TurnKind::Text,
                    self.buf.clone(),
                ));
                self.open = Some(index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_token_opens_one_assistant_turn() {
        let mut timeline = Timeline::new();
        let mut builder = TurnBuilder::new();

        builder.append_token(&mut timeline, "Hel");
        builder.append_token(&mut timeline, "lo");

        assert_eq!(timeline.turns().len(), 1);
        assert_eq!(timeline.turns()[0].role, Role::Assistant);
        assert_eq!(timeline.turns()[0].content, "Hello");
    }

    #[test]
    fn message_supersedes_tokens_and_is_idempotent() {
        let mut timeline = Timeline::new();
        let mut builder = TurnBuilder::new();

        builder.append_token(&mut timeline, "partial");
        builder.replace_text(&mut timeline, "final text");
        builder.replace_text(&mut timeline, "final text");

        assert_eq!(timeline.turns().len(), 1);
        assert_eq!(timeline.turns()[0].content, "final text");
    }

    #[test]
    fn message_without_prior_token_opens_the_turn() {
        let mut timeline = Timeline::new();
        let mut builder = TurnBuilder::new();

        builder.replace_text(&mut timeline, "whole reply");
        assert_eq!(timeline.turns().len(), 1);
        assert_eq!(timeline.turns()[0].content, "whole reply");
    }

    #[test]
    fn no_builder_state_survives_finish() {
        let mut timeline = Timeline::new();
        let mut builder = TurnBuilder::new();

        builder.append_token(&mut timeline, "first turn");
        assert!(builder.finish());

        builder.append_token(&mut timeline, "second turn");
        assert_eq!(timeline.turns().len(), 2);
        assert_eq!(timeline.turns()[1].content, "second turn");
        assert_eq!(timeline.turns()[0].content, "first turn");
    }
}
