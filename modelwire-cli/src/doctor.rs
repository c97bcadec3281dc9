use anyhow::Context;
use modelwire::{
    CancellationToken, ChatRequest, ChunkType, Message, ProviderConfig, ProviderKind,
};
use std::io::Write;

fn provider_for(kind: ProviderKind) -> anyhow::Result<std::sync::Arc<dyn modelwire::Provider>> {
    ProviderConfig::from_env(kind)
        .build()
        .with_context(|| format!("cannot configure {}", kind))
}

/// Print the model list for one provider.
pub async fn run_models(kind: ProviderKind) -> anyhow::Result<()> {
    let provider = provider_for(kind)?;
    let models = provider.list_models().await?;
    if models.is_empty() {
        println!("No models reported by {}.", kind);
        return Ok(());
    }
    for m in models {
        let tools = if m.supports_tools { "tools" } else { "-" };
        println!("{:<32} {:<28} {:>7}  {}", m.id, m.name, m.max_tokens, tools);
    }
    Ok(())
}

/// Validate credentials for one provider, or every provider that has
/// credentials in the environment.
pub async fn run_check(kind: Option<ProviderKind>) -> anyhow::Result<()> {
    let kinds: Vec<ProviderKind> = match kind {
        Some(k) => vec![k],
        None => ProviderKind::ALL.to_vec(),
    };
    let cancel = CancellationToken::new();
    let mut failed = 0;

    for kind in kinds {
        let config = ProviderConfig::from_env(kind);
        if kind.requires_key() && config.api_key.is_none() {
            println!("  {:<8} - No credentials", kind);
            continue;
        }
        let provider = match config.build() {
            Ok(p) => p,
            Err(e) => {
                println!("  {:<8} ❌ {}", kind, e.user_message);
                failed += 1;
                continue;
            }
        };
        match provider.validate_credentials(&cancel).await {
            Ok(()) => println!("  {:<8} ✅ OK", kind),
            Err(e) => {
                tracing::debug!(provider = %kind, error = %e, "credential check failed");
                println!("  {:<8} ❌ [{}] {}", kind, e.code, e.user_message);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} provider check(s) failed", failed);
    }
    Ok(())
}

/// Stream a single prompt. Ctrl-C fires the same token the producer races.
pub async fn run_chat(
    kind: ProviderKind,
    model: &str,
    max_tokens: u32,
    system: Option<String>,
    prompt: &str,
    json: bool,
) -> anyhow::Result<()> {
    let provider = provider_for(kind)?;
    let mut request = ChatRequest::new(model, max_tokens, vec![Message::user(prompt)]);
    if let Some(system) = system {
        request = request.with_system_prompt(system);
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let mut rx = provider.send_message(cancel.clone(), request)?;
    let mut stdout = std::io::stdout();

    while let Some(chunk) = rx.recv().await {
        if json {
            println!("{}", serde_json::to_string(&chunk)?);
            if let (ChunkType::Error, Some(code)) = (chunk.kind, chunk.error_code) {
                anyhow::bail!("{}: {}", code, chunk.content);
            }
            continue;
        }
        match chunk.kind {
            ChunkType::Chunk => {
                write!(stdout, "{}", chunk.content)?;
                stdout.flush()?;
            }
            ChunkType::ToolCallStart => {
                writeln!(stdout, "\n[tool call {} ({})]", chunk.tool_name, chunk.tool_id)?;
            }
            ChunkType::ToolCallDelta => write!(stdout, "{}", chunk.content)?,
            ChunkType::ToolCallEnd => writeln!(stdout)?,
            ChunkType::End => {
                writeln!(stdout)?;
                if let Some(usage) = chunk.usage {
                    eprintln!(
                        "[{} in / {} out tokens]",
                        usage.input_tokens, usage.output_tokens
                    );
                }
            }
            ChunkType::Error => {
                writeln!(stdout)?;
                let code = chunk.error_code.map(|c| c.to_string()).unwrap_or_default();
                anyhow::bail!("{}: {}", code, chunk.content);
            }
            ChunkType::Start => {}
        }
    }

    if cancel.is_cancelled() {
        eprintln!("\n[canceled]");
    }
    Ok(())
}
