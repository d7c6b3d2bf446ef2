use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

use chat_orchestrator::channels::{ChannelGateway, CliGateway, HttpGateway};
use chat_orchestrator::config::OrchestratorConfig;
use chat_orchestrator::llm::{ResponderConfig, create_responder};
use chat_orchestrator::pipeline::{InboundMessage, Orchestrator};
use chat_orchestrator::store::{LibSqlStore, MemoryStore, Storage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = OrchestratorConfig::from_env()?;
    let tenant = std::env::var("CHAT_ORCH_TENANT").unwrap_or_else(|_| "default".to_string());
    let account =
        std::env::var("CHAT_ORCH_ACCOUNT").unwrap_or_else(|_| "6280000000000".to_string());

    // ── Storage ──────────────────────────────────────────────────────────
    let store: Arc<dyn Storage> = match std::env::var("CHAT_ORCH_DB_PATH") {
        Ok(path) if !path.trim().is_empty() => Arc::new(
            LibSqlStore::new_local(std::path::Path::new(&path))
                .await
                .with_context(|| format!("failed to open database at {path}"))?,
        ),
        _ => Arc::new(MemoryStore::new()),
    };

    // ── Collaborators ────────────────────────────────────────────────────
    let responder = create_responder(&ResponderConfig::from_env())?;
    let gateway: Arc<dyn ChannelGateway> = match std::env::var("CHAT_ORCH_GATEWAY_URL") {
        Ok(url) if !url.trim().is_empty() => {
            let token = std::env::var("CHAT_ORCH_GATEWAY_TOKEN")
                .ok()
                .map(secrecy::SecretString::from);
            Arc::new(HttpGateway::new(&url, token))
        }
        _ => Arc::new(CliGateway::new()),
    };

    eprintln!("💬 Chat Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Tenant: {tenant}  Account: {account}");
    eprintln!("   Responder: {}  Gateway: {}", responder.model_name(), gateway.name());
    eprintln!("   Enter messages as `<sender>: <text>`. Ctrl-D to exit.\n");

    let orchestrator = Orchestrator::new(config, store, responder, gateway);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some((sender, text)) = line.split_once(": ") else {
            if !line.trim().is_empty() {
                eprintln!("expected `<sender>: <text>`");
            }
            continue;
        };
        let message = InboundMessage::text(&tenant, &account, sender.trim(), text.trim());
        let result = orchestrator.process(message).await;
        tracing::debug!(outcome = ?result.outcome, intent = ?result.intent, "Turn complete");
    }

    Ok(())
}
