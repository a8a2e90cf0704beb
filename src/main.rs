use std::io::Write;
use std::sync::Arc;

use futures_util::StreamExt;
use rmcp::{ServiceExt, transport::stdio};
use tokio_util::sync::CancellationToken;

use gust::config::Config;
use gust::gateway::Gateway;
use gust::request::{Capability, Request};
use gust::server::GustServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env from the binary's directory (MCP servers may start with any CWD).
    if let Some(dir) = std::env::current_exe().ok().and_then(|e| e.parent().map(|p| p.to_path_buf())) {
        let env_path = dir.join(".env");
        if env_path.exists() {
            dotenvy::from_path(&env_path).ok();
        } else {
            dotenvy::dotenv().ok();
        }
    } else {
        dotenvy::dotenv().ok();
    }

    let config = Config::load();
    let gateway = Arc::new(Gateway::from_config(&config));

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Some(pos) = args.iter().position(|a| a == "--ask") {
        let query = args[pos + 1..].join(" ");
        if query.trim().is_empty() {
            anyhow::bail!("usage: gust --ask <question>");
        }
        return ask_once(&gateway, query).await;
    }

    tracing::info!("gust starting");

    let server = GustServer::new(gateway);
    let service = server
        .serve(stdio())
        .await
        .inspect_err(|e| tracing::error!("serving error: {e:?}"))?;

    service.waiting().await?;

    tracing::info!("gust shutting down");
    Ok(())
}

/// Resolve one question and print the paced stream to stdout. Ctrl-C cancels.
async fn ask_once(gateway: &Gateway, query: String) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let request = Request::new(query, Capability::AnswerQuestion);
    let mut chunks = gateway
        .resolve_streaming(&request, cancel)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;

    let mut stdout = std::io::stdout();
    while let Some(chunk) = chunks.next().await {
        stdout.write_all(chunk.as_bytes())?;
        stdout.flush()?;
    }
    writeln!(stdout)?;
    Ok(())
}
