//! taskgate 演示程序
//!
//! 进程内同时运行规划端与执行端：加载配置与密钥、配对，然后把标准输入的每一行当作一个目标下发，
//! 打印回复。Ctrl-C 退出。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

use taskgate::config::load_config;
use taskgate::core::{run_with_graceful_shutdown, ShutdownManager};
use taskgate::executor::{register_builtin, ActionRegistry};
use taskgate::identity::Identity;
use taskgate::llm::OpenAiClient;
use taskgate::node::{spawn_connector, spawn_orchestrator, Connector, Orchestrator};
use taskgate::observability;
use taskgate::planner::{KeywordPlanner, LlmPlanner, Planner};
use taskgate::policy::{resolve_dirs, PolicyEngine};
use taskgate::transport::InMemoryTransport;

const ORCHESTRATOR_ADDRESS: &str = "orchestrator";
const CONNECTOR_ADDRESS: &str = "connector";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;
    let identity =
        Identity::load_or_generate(&config.app.key_dir).context("Failed to load signing key")?;
    tracing::info!(address = %identity.address(), "Orchestrator identity ready");

    let transport = Arc::new(InMemoryTransport::new());
    let orchestrator_inbox = transport.register(ORCHESTRATOR_ADDRESS).await;
    let connector_inbox = transport.register(CONNECTOR_ADDRESS).await;

    // 执行端：内置动作与本地策略共用同一个解析后的基准目录
    let (base_dir, home) =
        resolve_dirs(&config.local_policy).context("Failed to resolve local policy dirs")?;
    let mut actions = ActionRegistry::new();
    register_builtin(&mut actions, &base_dir);
    let action_descriptions = actions.action_descriptions();
    let local_policy =
        PolicyEngine::with_dirs("local", config.local_policy.clone(), base_dir, home);
    let connector = Arc::new(
        Connector::new(CONNECTOR_ADDRESS, &config, actions, transport.clone())
            .context("Failed to start connector")?
            .with_policy(local_policy),
    );

    // 规划端：provider = openai 时用 LLM，其他情况用关键词规划器
    let planner: Arc<dyn Planner> = match config.planner.provider.as_str() {
        "openai" => {
            let llm = OpenAiClient::new(config.planner.base_url.as_deref(), &config.planner.model, None);
            Arc::new(LlmPlanner::new(
                Arc::new(llm),
                &action_descriptions,
                config.planner.timeout_seconds,
            ))
        }
        _ => Arc::new(KeywordPlanner::new()),
    };
    let (orchestrator, mut replies) = Orchestrator::new(
        ORCHESTRATOR_ADDRESS,
        identity,
        &config,
        planner,
        transport.clone(),
    )
    .context("Failed to start orchestrator")?;
    let orchestrator = Arc::new(orchestrator);

    let shutdown = Arc::new(ShutdownManager::new());
    let connector_task = spawn_connector(connector, connector_inbox, shutdown.token());
    let orchestrator_task =
        spawn_orchestrator(orchestrator.clone(), orchestrator_inbox, shutdown.token());

    let capabilities = action_descriptions.into_iter().map(|(name, _)| name).collect();
    orchestrator
        .request_pairing(CONNECTOR_ADDRESS, capabilities)
        .await
        .context("Failed to request pairing")?;
    for _ in 0..50 {
        if orchestrator
            .device_address(&config.app.owner_id, &config.app.device_id)
            .await
            .is_some()
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let printer = tokio::spawn(async move {
        while let Some(reply) = replies.recv().await {
            println!("[{}] {}\n", reply.origin.sender_id, reply.text);
        }
    });

    let app = {
        let orchestrator = orchestrator.clone();
        async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let orchestrator = orchestrator.clone();
                        tokio::spawn(async move {
                            if let Err(e) = orchestrator.handle_objective("cli", &line).await {
                                tracing::error!("Dispatch failed: {}", e);
                            }
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("Failed to read stdin: {}", e);
                        break;
                    }
                }
            }
            // 输入结束后等在途任务回完（待办超时也会被清理）
            while orchestrator.correlator().pending_len().await > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    };

    let token = shutdown.token();
    run_with_graceful_shutdown(shutdown.clone(), app, || async move {
        token.cancel();
        let _ = connector_task.await;
        let _ = orchestrator_task.await;
        printer.abort();
    })
    .await;

    Ok(())
}
