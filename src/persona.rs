//! Persona system prompt
//!
//! The prompt is assembled from an identity file, a soul file and fixed
//! voice runtime rules. Missing or empty files fall back to built-in text.

use std::path::Path;

const DEFAULT_IDENTITY: &str = "# IDENTITY

- Name: VoicePi
- Creature: Desktop voice familiar
- Vibe: Sharp, concise, practical
";

const DEFAULT_SOUL: &str = "# SOUL

## Core Truths
- Be useful first. Do not waste words.
- Speak directly and concretely; avoid vague filler.
- Have a point of view when the user needs a decision.
- Respect user privacy and local context.

## Boundaries
- Never perform external actions or spend money without explicit user approval.
- Do not pretend to have done work you have not actually done.
- Do not reveal secrets, API keys, or private data.
- If uncertain, say what is unknown and how to verify it.

## Vibe
- Crisp, grounded, and practical.
- Friendly without flattery.
- Keep default answers short, expand only when asked.
";

const RUNTIME_RULES: &str = "# VOICEPI_RUNTIME_RULES

- Always reply in English only.
- Keep responses concise and natural for voice chat.
- Usually answer in 1-2 short sentences.
- Avoid long explanations unless the user asks for detail.
";

/// An assembled system prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemPrompt {
    /// Prompt text sent with every request
    pub text: String,
    /// One entry per file that fell back to built-in text
    pub warnings: Vec<String>,
}

/// Build the system prompt from persona files
#[must_use]
pub fn build_system_prompt(identity_path: &Path, soul_path: &Path) -> SystemPrompt {
    let mut warnings = Vec::new();

    let identity = read_or_fallback(identity_path, DEFAULT_IDENTITY, "IDENTITY", &mut warnings);
    let soul = read_or_fallback(soul_path, DEFAULT_SOUL, "SOUL", &mut warnings);

    let text = [identity.trim(), soul.trim(), RUNTIME_RULES.trim()].join("\n\n");

    for warning in &warnings {
        tracing::warn!("{warning}");
    }

    SystemPrompt { text, warnings }
}

fn read_or_fallback(path: &Path, fallback: &str, label: &str, warnings: &mut Vec<String>) -> String {
    match std::fs::read_to_string(path) {
        Ok(text) if !text.trim().is_empty() => text,
        _ => {
            warnings.push(format!(
                "Using built-in {label} fallback because file is missing or empty: {}",
                path.display()
            ));
            fallback.to_string()
        }
    }
}
