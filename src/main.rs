//! `prag`: ask questions about a person from their knowledge base.
//!
//! ```sh
//! prag init
//! prag ask "What's your name?"
//! RUST_LOG=profile_rag=debug prag search "notice period"
//! ```

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use once_cell::sync::OnceCell;
use std::{
    error::Error,
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use profile_rag::{
    commands::{Cli, Commands},
    config::{self, RagConfig},
    config_dir,
    response::{AnswerPayload, ErrorPayload},
    service::RagService,
    template::PromptTemplate,
};

static TRACING: OnceCell<()> = OnceCell::new();

const DEFAULT_TEMPLATE: &str = "default";

fn main() -> Result<(), Box<dyn Error>> {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_writer(io::stderr)
            .init();
    });
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => config_dir()?.join("config.yaml"),
    };

    match cli.command {
        Commands::Init { force } => init(&config_path, force),
        Commands::Ask {
            question,
            json,
            timestamp,
        } => {
            let config = config::load_config(&config_path)?;
            let service = RagService::from_config(&config).await?;
            let outcome = service.answer_with_timestamp(&question, timestamp).await;
            match &outcome {
                Ok(result) if json => {
                    let payload = AnswerPayload::from(result.clone());
                    println!("{}", serde_json::to_string_pretty(&payload)?);
                }
                Ok(result) => println!("{}", result.generated_answer),
                Err(e) if json => {
                    println!("{}", serde_json::to_string_pretty(&ErrorPayload::from(e))?);
                }
                Err(_) => {}
            }
            // A flagged cache is rebuilt once the answer is out, so the next run searches by vector.
            service.rebuild_if_due().await;
            outcome.map(|_| ()).map_err(Into::into)
        }
        Commands::Search {
            question,
            top_k,
            json,
        } => {
            let mut config = config::load_config(&config_path)?;
            if let Some(k) = top_k {
                config.retrieval.top_k = k.max(1);
            }
            let service = RagService::from_config(&config).await?;
            let ranking = service.retrieve(&question).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&ranking)?);
                service.rebuild_if_due().await;
                return Ok(());
            }
            match ranking.fallback {
                Some(reason) => println!("tier: lexical ({reason:?})"),
                None => println!("tier: vector"),
            }
            for (rank, m) in ranking.matches.iter().enumerate() {
                let score = m
                    .score
                    .similarity()
                    .map(|s| format!("{s:.3}"))
                    .unwrap_or_else(|| "-".to_string());
                if let Some(record) = service.store().get(m.record_id) {
                    println!("{:>2}. [{}] #{} {}", rank + 1, score, record.id, record.question);
                }
            }
            service.rebuild_if_due().await;
            Ok(())
        }
        Commands::Warm { rebuild } => {
            let config = config::load_config(&config_path)?;
            if rebuild && config.cache_path.exists() {
                info!("Removing {}", config.cache_path.display());
                fs::remove_file(&config.cache_path)?;
            }

            let spinner = ProgressBar::new_spinner();
            spinner.set_style(ProgressStyle::with_template("{spinner} {msg}")?);
            spinner.set_message(format!("Embedding {}", config.knowledge_path.display()));
            spinner.enable_steady_tick(Duration::from_millis(120));
            let service = RagService::from_config(&config).await;
            spinner.finish_and_clear();

            let service = service?;
            println!("{}", serde_json::to_string_pretty(service.report())?);
            Ok(())
        }
        Commands::Interactive => {
            let config = config::load_config(&config_path)?;
            interactive(RagService::from_config(&config).await?).await
        }
    }
}

async fn interactive(mut service: RagService) -> Result<(), Box<dyn Error>> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let Some(line) = lines.next() else {
            break;
        };
        let question = line?;
        let question = question.trim();
        if question.is_empty() {
            continue;
        }
        if question == "exit" || question == "quit" {
            break;
        }

        match service.answer(question).await {
            Ok(result) => println!("{}\n", result.generated_answer),
            Err(e) => eprintln!("{e}\n"),
        }

        service = service.rebuild_if_due().await;
    }
    Ok(())
}

/// Write a default configuration and prompt template next to `config_path`.
fn init(config_path: &Path, force: bool) -> Result<(), Box<dyn Error>> {
    let base = match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let templates = config_dir()?.join("templates");
    info!("Creating template directory: {}", templates.display());
    fs::create_dir_all(&templates)?;
    fs::create_dir_all(&base)?;

    let template_path = templates.join(format!("{DEFAULT_TEMPLATE}.yaml"));
    write_unless_present(
        &template_path,
        &serde_yaml::to_string(&PromptTemplate::default())?,
        force,
    )?;

    let config = RagConfig {
        knowledge_path: base.join("knowledge.json"),
        cache_path: base.join("embeddings.bin"),
        template: Some(DEFAULT_TEMPLATE.to_string()),
        ..RagConfig::default()
    };
    write_unless_present(config_path, &serde_yaml::to_string(&config)?, force)?;

    println!("Configuration written to {}", config_path.display());
    println!("Put your knowledge base at {}", config.knowledge_path.display());
    Ok(())
}

fn write_unless_present(path: &Path, content: &str, force: bool) -> Result<(), Box<dyn Error>> {
    if path.exists() && !force {
        println!("Keeping existing {}", path.display());
        return Ok(());
    }
    debug!("Writing {}", path.display());
    fs::write(path, content)?;
    Ok(())
}
