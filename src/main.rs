mod agent;
mod bridge;
mod config;
mod errors;
mod integrations;
mod knowledge;
mod tools;
mod types;

use std::{
    io::{self, BufRead, Write},
    sync::Arc,
};

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use agent::{
    planner::Planner,
    provider::{LlmGateway, build_http_client},
    scheduler::Agent,
};
use bridge::Bridge;
use config::Config;
use integrations::Integrations;
use knowledge::{Embedder, KnowledgeIndex};
use tools::Toolbox;
use types::Attachment;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (cfg, warnings) = Config::load();
    for w in &warnings {
        warn!("{w}");
    }

    let (request, image_paths) = parse_args()?;

    let gateway = LlmGateway::from_env()?;
    let bridge = Bridge::connect(cfg.remote_addr(), cfg.queue_capacity);
    let integrations =
        Integrations::new(bridge.clone(), cfg.breaker_threshold, cfg.breaker_cooldown);

    let knowledge = match &cfg.db_connection {
        Some(url) => {
            let embedder = Embedder::from_env(build_http_client()?, cfg.embedding_dim)?;
            match KnowledgeIndex::connect(url, embedder).await {
                Ok(index) => Some(index),
                Err(e) => {
                    warn!(error = %e, "knowledge index unavailable; continuing without it");
                    None
                }
            }
        }
        None => None,
    };

    info!(
        remote = %cfg.remote_addr(),
        model = gateway.model_name(),
        knowledge = knowledge.is_some(),
        "scenebot starting"
    );

    let toolbox = Arc::new(Toolbox {
        bridge,
        knowledge,
        integrations,
        planner: Planner::new(gateway.clone()).with_attempts(cfg.llm_repair_attempts),
        gateway,
        code_exec_retries: cfg.code_exec_retries,
    });
    let agent = Agent::new(Arc::clone(&toolbox), cfg.max_loops);

    // 一次性模式：命令行给出请求，执行完直接退出
    if let Some(request) = request {
        let attachments = load_attachments(&image_paths)?;
        let status = toolbox.integrations.probe_status().await;
        let response = agent.run(&request, attachments, status).await;
        println!("{response}");
        return Ok(());
    }

    // Interactive mode: one request per line.
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("scenebot> ");
        io::stdout().flush()?;
        let Some(line) = lines.next() else { break };
        let line = line?;
        let request = line.trim();
        if request.is_empty() {
            continue;
        }
        if request == "exit" || request == "quit" {
            break;
        }
        let status = toolbox.integrations.probe_status().await;
        let response = agent.run(request, Vec::new(), status).await;
        println!("{response}\n");
    }
    Ok(())
}

fn parse_args() -> Result<(Option<String>, Vec<String>)> {
    let mut images = Vec::new();
    let mut words = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--image" => images.push(args.next().context("--image needs a file path")?),
            other => words.push(other.to_string()),
        }
    }
    let request = if words.is_empty() { None } else { Some(words.join(" ")) };
    Ok((request, images))
}

fn load_attachments(paths: &[String]) -> Result<Vec<Attachment>> {
    paths
        .iter()
        .map(|p| {
            let bytes = std::fs::read(p).with_context(|| format!("reading image `{p}`"))?;
            Ok(Attachment {
                name: p.clone(),
                bytes,
            })
        })
        .collect()
}
