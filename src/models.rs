//! Model profiles
//!
//! Maps a model id or display name to its thinking-tag protocol. Models
//! that interleave chain-of-thought with the answer mark the thinking
//! region with `(think_start, think_end)`; some additionally bracket the
//! answer with `(response_start, response_end)`. For models without
//! thinking support all four tags are empty and the stream parser is a
//! pass-through.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Tag protocol for a single model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub id: String,
    pub name: String,
    pub supports_thinking: bool,
    #[serde(default)]
    pub think_start: String,
    #[serde(default)]
    pub think_end: String,
    #[serde(default)]
    pub response_start: String,
    #[serde(default)]
    pub response_end: String,
}

impl ModelProfile {
    /// A profile with no thinking markup; the parser passes tokens through.
    pub fn passthrough(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            supports_thinking: false,
            think_start: String::new(),
            think_end: String::new(),
            response_start: String::new(),
            response_end: String::new(),
        }
    }

    /// Whether the answer region is bracketed by response tags. For these
    /// profiles the `response_start` marker also terminates the thinking
    /// region.
    pub fn uses_response_tags(&self) -> bool {
        !self.response_start.is_empty()
    }
}

/// Built-in profiles plus a cache of profiles learned at runtime.
///
/// The cache is flushed at logout together with the rest of the
/// per-process state.
pub struct ModelTable {
    builtin: Vec<ModelProfile>,
    cache: RwLock<Vec<ModelProfile>>,
}

impl Default for ModelTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelTable {
    pub fn new() -> Self {
        Self {
            builtin: builtin_profiles(),
            cache: RwLock::new(Vec::new()),
        }
    }

    /// Look up a profile by model id or display name. Unknown models get a
    /// pass-through profile so streaming still works.
    pub fn profile_for(&self, model: &str) -> ModelProfile {
        let needle = model.trim().to_ascii_lowercase();
        if let Some(profile) = self
            .cache
            .read()
            .iter()
            .find(|p| p.id.to_ascii_lowercase() == needle || p.name.to_ascii_lowercase() == needle)
        {
            return profile.clone();
        }
        if let Some(profile) = self.builtin.iter().find(|p| {
            p.id.to_ascii_lowercase() == needle || p.name.to_ascii_lowercase() == needle
        }) {
            return profile.clone();
        }
        // Family match: "deepseek-r1:70b" should resolve like "deepseek-r1".
        if let Some(profile) = self
            .builtin
            .iter()
            .find(|p| needle.starts_with(&p.id.to_ascii_lowercase()))
        {
            return profile.clone();
        }
        ModelProfile::passthrough(model, model)
    }

    /// Register or replace a runtime profile.
    pub fn register(&self, profile: ModelProfile) {
        let mut cache = self.cache.write();
        cache.retain(|p| p.id != profile.id);
        cache.push(profile);
    }

    /// List every known profile, built-in first.
    pub fn list(&self) -> Vec<ModelProfile> {
        let mut out = self.builtin.clone();
        out.extend(self.cache.read().iter().cloned());
        out
    }

    /// Drop every runtime-registered profile.
    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }
}

fn builtin_profiles() -> Vec<ModelProfile> {
    vec![
        ModelProfile {
            id: "deepseek-r1".to_string(),
            name: "DeepSeek R1".to_string(),
            supports_thinking: true,
            think_start: "<think>".to_string(),
            think_end: "</think>".to_string(),
            response_start: String::new(),
            response_end: String::new(),
        },
        ModelProfile {
            id: "qwen3".to_string(),
            name: "Qwen 3".to_string(),
            supports_thinking: true,
            think_start: "<think>".to_string(),
            think_end: "</think>".to_string(),
            response_start: String::new(),
            response_end: String::new(),
        },
        // The gpt-oss family emits channel markers; the final-channel marker
        // doubles as the thinking terminator.
        ModelProfile {
            id: "gpt-oss".to_string(),
            name: "GPT-OSS".to_string(),
            supports_thinking: true,
            think_start: "<|channel|>analysis<|message|>".to_string(),
            think_end: "<|end|>".to_string(),
            response_start: "<|channel|>final<|message|>".to_string(),
            response_end: "<|return|>".to_string(),
        },
        ModelProfile::passthrough("llama3", "Llama 3"),
        ModelProfile::passthrough("mistral", "Mistral"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_thinking_model() {
        let table = ModelTable::new();
        let profile = table.profile_for("deepseek-r1");
        assert!(profile.supports_thinking);
        assert_eq!(profile.think_start, "<think>");
        assert!(!profile.uses_response_tags());
    }

    #[test]
    fn test_family_prefix_match() {
        let table = ModelTable::new();
        let profile = table.profile_for("deepseek-r1:70b");
        assert!(profile.supports_thinking);
        assert_eq!(profile.id, "deepseek-r1");
    }

    #[test]
    fn test_gpt_oss_uses_response_tags() {
        let table = ModelTable::new();
        let profile = table.profile_for("gpt-oss");
        assert!(profile.supports_thinking);
        assert!(profile.uses_response_tags());
        assert_eq!(profile.response_start, "<|channel|>final<|message|>");
    }

    #[test]
    fn test_unknown_model_is_passthrough() {
        let table = ModelTable::new();
        let profile = table.profile_for("some-unknown-model");
        assert!(!profile.supports_thinking);
        assert!(profile.think_start.is_empty());
    }

    #[test]
    fn test_lookup_by_display_name() {
        let table = ModelTable::new();
        let profile = table.profile_for("DeepSeek R1");
        assert_eq!(profile.id, "deepseek-r1");
    }

    #[test]
    fn test_register_and_clear_cache() {
        let table = ModelTable::new();
        table.register(ModelProfile {
            id: "custom".to_string(),
            name: "Custom".to_string(),
            supports_thinking: true,
            think_start: "[[".to_string(),
            think_end: "]]".to_string(),
            response_start: String::new(),
            response_end: String::new(),
        });
        assert!(table.profile_for("custom").supports_thinking);

        table.clear_cache();
        assert!(!table.profile_for("custom").supports_thinking);
    }
}
