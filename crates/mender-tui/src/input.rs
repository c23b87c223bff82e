use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

/// Which pane receives key input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Focus {
    Prompt,
    Failures,
    SubmitForm,
}

/// Actions produced by key input handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputAction {
    /// The prompt draft changed.
    Edited(String),
    /// Submit the prompt.
    Submit(String),
    /// Submit the failure form.
    SubmitFailure(String),
    /// Reset the flow to idle.
    Reset,
    ToggleForm,
    SelectPrev,
    SelectNext,
    /// Open the highlighted failure.
    Open,
    CloseDetail,
    Retry,
    Escalate,
    Quit,
    /// No-op (key was handled internally).
    None,
}

/// Single-line text buffer with a character cursor.
#[derive(Debug, Clone, Default)]
pub struct TextInput {
    pub buffer: String,
    pub cursor: usize,
}

impl TextInput {
    pub fn set(&mut self, text: &str) {
        self.buffer = text.to_string();
        self.cursor = self.buffer.chars().count();
    }

    pub fn take(&mut self) -> String {
        self.cursor = 0;
        std::mem::take(&mut self.buffer)
    }

    /// Apply an editing key. Returns whether the buffer changed.
    fn edit(&mut self, code: KeyCode) -> bool {
        let len = self.buffer.chars().count();
        match code {
            KeyCode::Char(c) => {
                let at = self.byte_index();
                self.buffer.insert(at, c);
                self.cursor += 1;
                true
            }
            KeyCode::Backspace if self.cursor > 0 => {
                self.cursor -= 1;
                let at = self.byte_index();
                self.buffer.remove(at);
                true
            }
            KeyCode::Delete if self.cursor < len => {
                let at = self.byte_index();
                self.buffer.remove(at);
                true
            }
            KeyCode::Left => {
                self.cursor = self.cursor.saturating_sub(1);
                false
            }
            KeyCode::Right => {
                self.cursor = (self.cursor + 1).min(len);
                false
            }
            KeyCode::Home => {
                self.cursor = 0;
                false
            }
            KeyCode::End => {
                self.cursor = len;
                false
            }
            _ => false,
        }
    }

    fn byte_index(&self) -> usize {
        self.buffer
            .char_indices()
            .nth(self.cursor)
            .map(|(i, _)| i)
            .unwrap_or(self.buffer.len())
    }
}

/// Routes keys to the focused pane.
pub struct InputHandler {
    pub focus: Focus,
    pub prompt: TextInput,
    pub form: TextInput,
}

impl InputHandler {
    pub fn new() -> Self {
        Self {
            focus: Focus::Prompt,
            prompt: TextInput::default(),
            form: TextInput::default(),
        }
    }

    /// Cycle focus; the form only takes part while it is open.
    pub fn cycle_focus(&mut self, form_open: bool) {
        self.focus = match self.focus {
            Focus::Prompt => Focus::Failures,
            Focus::Failures if form_open => Focus::SubmitForm,
            Focus::Failures | Focus::SubmitForm => Focus::Prompt,
        };
    }

    /// Handle a key event, returning an action.
    ///
    /// `prompt_locked` is set while the trigger's run is in flight.
    pub fn handle_key(&mut self, key: KeyEvent, prompt_locked: bool, form_open: bool) -> InputAction {
        if key.modifiers.contains(KeyModifiers::CONTROL) {
            return match key.code {
                KeyCode::Char('c') | KeyCode::Char('q') => InputAction::Quit,
                KeyCode::Char('r') => InputAction::Reset,
                KeyCode::Char('n') => {
                    self.focus = if form_open { Focus::Prompt } else { Focus::SubmitForm };
                    InputAction::ToggleForm
                }
                _ => InputAction::None,
            };
        }
        if key.code == KeyCode::Tab {
            self.cycle_focus(form_open);
            return InputAction::None;
        }

        match self.focus {
            Focus::Prompt => match key.code {
                KeyCode::Enter => {
                    let text = self.prompt.buffer.trim();
                    if text.is_empty() || prompt_locked {
                        InputAction::None
                    } else {
                        InputAction::Submit(text.to_string())
                    }
                }
                code => {
                    if !prompt_locked && self.prompt.edit(code) {
                        InputAction::Edited(self.prompt.buffer.clone())
                    } else {
                        InputAction::None
                    }
                }
            },
            Focus::Failures => match key.code {
                KeyCode::Up | KeyCode::Char('k') => InputAction::SelectPrev,
                KeyCode::Down | KeyCode::Char('j') => InputAction::SelectNext,
                KeyCode::Enter => InputAction::Open,
                KeyCode::Esc => InputAction::CloseDetail,
                KeyCode::Char('r') => InputAction::Retry,
                KeyCode::Char('e') => InputAction::Escalate,
                KeyCode::Char('q') => InputAction::Quit,
                _ => InputAction::None,
            },
            Focus::SubmitForm => match key.code {
                KeyCode::Enter => {
                    let text = self.form.take();
                    if text.trim().is_empty() {
                        InputAction::None
                    } else {
                        InputAction::SubmitFailure(text)
                    }
                }
                KeyCode::Esc => {
                    self.focus = Focus::Prompt;
                    InputAction::ToggleForm
                }
                code => {
                    self.form.edit(code);
                    InputAction::None
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn type_text(input: &mut InputHandler, text: &str, locked: bool) -> InputAction {
        let mut last = InputAction::None;
        for c in text.chars() {
            last = input.handle_key(key(KeyCode::Char(c)), locked, false);
        }
        last
    }

    #[test]
    fn test_typing_edits_prompt() {
        let mut input = InputHandler::new();
        assert_eq!(type_text(&mut input, "héllo", false), InputAction::Edited("héllo".into()));
        input.handle_key(key(KeyCode::Left), false, false);
        input.handle_key(key(KeyCode::Backspace), false, false);
        assert_eq!(input.prompt.buffer, "hélo");
        assert_eq!(
            input.handle_key(key(KeyCode::Enter), false, false),
            InputAction::Submit("hélo".into())
        );
    }

    #[test]
    fn test_locked_prompt_ignores_edits_and_submit() {
        let mut input = InputHandler::new();
        type_text(&mut input, "run", false);
        assert_eq!(type_text(&mut input, "x", true), InputAction::None);
        assert_eq!(input.prompt.buffer, "run");
        assert_eq!(input.handle_key(key(KeyCode::Enter), true, false), InputAction::None);
    }

    #[test]
    fn test_blank_prompt_does_not_submit() {
        let mut input = InputHandler::new();
        type_text(&mut input, "   ", false);
        assert_eq!(input.handle_key(key(KeyCode::Enter), false, false), InputAction::None);
    }

    #[test]
    fn test_failure_pane_commands() {
        let mut input = InputHandler::new();
        input.handle_key(key(KeyCode::Tab), false, false);
        assert_eq!(input.focus, Focus::Failures);
        assert_eq!(input.handle_key(key(KeyCode::Char('j')), false, false), InputAction::SelectNext);
        assert_eq!(input.handle_key(key(KeyCode::Enter), false, false), InputAction::Open);
        assert_eq!(input.handle_key(key(KeyCode::Char('r')), false, false), InputAction::Retry);
        assert_eq!(input.handle_key(key(KeyCode::Esc), false, false), InputAction::CloseDetail);
        input.handle_key(key(KeyCode::Tab), false, false);
        assert_eq!(input.focus, Focus::Prompt);
    }

    #[test]
    fn test_form_submit_clears_buffer() {
        let mut input = InputHandler::new();
        let ctrl_n = KeyEvent::new(KeyCode::Char('n'), KeyModifiers::CONTROL);
        assert_eq!(input.handle_key(ctrl_n, false, false), InputAction::ToggleForm);
        assert_eq!(input.focus, Focus::SubmitForm);
        for c in "a.ts::b | boom".chars() {
            input.handle_key(key(KeyCode::Char(c)), false, true);
        }
        assert_eq!(
            input.handle_key(key(KeyCode::Enter), false, true),
            InputAction::SubmitFailure("a.ts::b | boom".into())
        );
        assert!(input.form.buffer.is_empty());
    }
}
