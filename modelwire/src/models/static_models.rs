use crate::config::ProviderKind;
use crate::types::Model;

fn model(provider: &str, id: &str, name: &str, max_tokens: u32) -> Model {
    Model {
        id: id.into(),
        name: name.into(),
        provider: provider.into(),
        max_tokens,
        supports_tools: true,
    }
}

pub fn claude_models() -> Vec<Model> {
    let p = "claude";
    vec![
        model(p, "claude-opus-4-1", "Claude Opus 4.1", 32000),
        model(p, "claude-sonnet-4-5", "Claude Sonnet 4.5", 64000),
        model(p, "claude-haiku-4-5", "Claude Haiku 4.5", 64000),
        model(p, "claude-3-5-haiku-latest", "Claude 3.5 Haiku", 8192),
    ]
}

pub fn openai_models() -> Vec<Model> {
    let p = "openai";
    vec![
        model(p, "gpt-4o", "GPT-4o", 16384),
        model(p, "gpt-4o-mini", "GPT-4o Mini", 16384),
        model(p, "gpt-4.1", "GPT-4.1", 32768),
        model(p, "o3-mini", "o3-mini", 65536),
    ]
}

pub fn gemini_models() -> Vec<Model> {
    let p = "gemini";
    vec![
        model(p, "gemini-2.5-pro", "Gemini 2.5 Pro", 65536),
        model(p, "gemini-2.5-flash", "Gemini 2.5 Flash", 65536),
        model(p, "gemini-2.0-flash", "Gemini 2.0 Flash", 8192),
    ]
}

/// Built-in catalog for a backend. Ollama has none; its models come from the
/// local daemon.
pub fn static_models_for(kind: ProviderKind) -> Vec<Model> {
    match kind {
        ProviderKind::Claude => claude_models(),
        ProviderKind::OpenAi => openai_models(),
        ProviderKind::Gemini => gemini_models(),
        ProviderKind::Ollama => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogs_are_tagged_with_their_provider() {
        for kind in [ProviderKind::Claude, ProviderKind::OpenAi, ProviderKind::Gemini] {
            let models = static_models_for(kind);
            assert!(!models.is_empty());
            assert!(models.iter().all(|m| m.provider == kind.as_str()));
        }
        assert!(static_models_for(ProviderKind::Ollama).is_empty());
    }

    #[test]
    fn each_call_returns_an_independent_list() {
        let mut first = claude_models();
        first.clear();
        assert!(!claude_models().is_empty());
    }
}
