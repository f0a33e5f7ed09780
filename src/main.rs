//! Atelier CLI
//!
//! 入口：加载配置、初始化日志，用离线 Mock 模型对一条请求跑完整个 Planner 循环；
//! 进度事件与最终结果以 JSON 行输出到 stdout。用法：`atelier <message...>`，`ATELIER_CONFIG` 指定额外配置文件。

use std::path::PathBuf;

use anyhow::Context;
use atelier::core::create_agent_builder;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    atelier::observability::init();

    let message = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if message.trim().is_empty() {
        anyhow::bail!("usage: atelier <message>");
    }
    let config_path = std::env::var("ATELIER_CONFIG").ok().map(PathBuf::from);

    let components = create_agent_builder(config_path)
        .build_components()
        .context("Failed to build agent")?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, cancelling");
            ctrl_c.cancel();
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!(error = %e, "failed to encode event"),
            }
        }
    });

    let session_id = uuid::Uuid::new_v4().to_string();
    let outcome = components
        .process_message(&session_id, &message, Some(tx), cancel)
        .await
        .context("Request failed")?;
    printer.await.context("Event printer failed")?;

    println!(
        "{}",
        serde_json::to_string(&outcome).context("Failed to encode outcome")?
    );
    Ok(())
}
