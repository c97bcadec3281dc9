mod doctor;

use clap::{Parser, Subcommand};
use modelwire::ProviderKind;

#[derive(Parser)]
#[command(name = "modelwire", version, about = "Talk to LLM backends through one streaming contract")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the models a provider can serve
    Models {
        /// claude, openai, gemini or ollama
        provider: ProviderKind,
    },

    /// Validate credentials (or reachability, for Ollama)
    Check {
        /// Provider to check; all configured providers when omitted
        provider: Option<ProviderKind>,
    },

    /// Stream one completion to stdout (Ctrl-C cancels)
    Chat {
        provider: ProviderKind,

        /// Model id, e.g. claude-sonnet-4-5 or llama3.2
        #[arg(short, long)]
        model: String,

        #[arg(long, default_value = "1024")]
        max_tokens: u32,

        #[arg(long)]
        system: Option<String>,

        /// Print every chunk as a JSON line instead of plain text
        #[arg(long)]
        json: bool,

        prompt: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "modelwire=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Models { provider } => {
            doctor::run_models(provider).await?;
        }
        Commands::Check { provider } => {
            doctor::run_check(provider).await?;
        }
        Commands::Chat {
            provider,
            model,
            max_tokens,
            system,
            json,
            prompt,
        } => {
            doctor::run_chat(provider, &model, max_tokens, system, &prompt, json).await?;
        }
    }

    Ok(())
}
