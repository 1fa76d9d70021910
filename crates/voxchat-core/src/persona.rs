//! Reply personas selected by the `prompt-template` form field.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of personas. Unknown keys resolve to [`Persona::Assistant`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Persona {
    #[default]
    Assistant,
    Friend,
    Tutor,
}

impl Persona {
    pub const ALL: [Persona; 3] = [Persona::Assistant, Persona::Friend, Persona::Tutor];

    /// Resolve a template key (case-insensitive, surrounding whitespace ignored).
    /// Anything unrecognized silently becomes the default persona.
    pub fn from_key(key: &str) -> Self {
        let key = key.trim();
        if key.eq_ignore_ascii_case("friend") {
            Persona::Friend
        } else if key.eq_ignore_ascii_case("tutor") {
            Persona::Tutor
        } else {
            Persona::Assistant
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Persona::Assistant => "assistant",
            Persona::Friend => "friend",
            Persona::Tutor => "tutor",
        }
    }

    /// Instruction placed in front of the user's words.
    pub fn instruction(self) -> &'static str {
        match self {
            Persona::Assistant => {
                "You are a helpful assistant. Respond politely and provide useful information."
            }
            Persona::Friend => "You are a friendly companion. Respond in a casual, relaxed manner.",
            Persona::Tutor => {
                "You are a knowledgeable tutor. Respond with educational and helpful explanations."
            }
        }
    }
}

impl fmt::Display for Persona {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}
