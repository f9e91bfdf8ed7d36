use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use exec_manager::jobs::process_job;
use exec_manager::queue::{keys, JobQueue};
use exec_manager::{Config, Manager};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("exec_manager=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    info!("Starting execution manager worker...");

    let redis_url = config.redis_url.clone();
    let manager = Arc::new(Manager::connect(config).await?);
    let mut queue = JobQueue::connect(&redis_url).await?;

    info!("Waiting for jobs on {}...", keys::EXEC_QUEUE);

    loop {
        let job = queue.pop_job().await;
        let manager = manager.clone();
        let mut replies = queue.clone();

        // Each job blocks for the whole sandboxed run
        tokio::spawn(async move {
            let reply = process_job(&manager, &job).await;
            if let Err(e) = replies.store_reply(&reply).await {
                error!("Failed to store reply for {}: {:#}", reply.request_id, e);
            }
        });
    }
}
