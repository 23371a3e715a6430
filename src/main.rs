use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use codeexec::jobs::{self, JobReply};
use codeexec::redis_manager::{RedisManager, ReplySink};
use codeexec::{storage, Config, ErrorKind, ExecutorRegistry, SessionManager};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("codeexec=info".parse()?),
        )
        .init();

    let config = Config::from_env().context("Invalid configuration")?;
    if config.disable_network {
        info!("Network isolation requested; it must be enforced by the deployment");
    }

    let executors = ExecutorRegistry::from_config(&config)?;
    let storage = storage::from_config(&config.storage)
        .await
        .context("Failed to initialize storage backend")?;
    let mut manager = SessionManager::new(storage, executors);
    if let Some(dir) = &config.scratch_dir {
        info!("Scratch directories go to {}", dir.display());
        manager = manager.with_scratch_root(dir);
    }
    let manager = Arc::new(manager);

    info!("Starting Code Execution Worker...");

    let mut redis = RedisManager::connect(&config.redis_url, config.queue_name.clone()).await?;
    let replies = redis.reply_sink().await?;

    info!("Waiting for jobs on {}...", redis.queue());

    let mut in_flight = JoinSet::new();

    loop {
        // Reap finished jobs so the set does not grow without bound
        while in_flight.try_join_next().is_some() {}

        let payload = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested, no longer accepting jobs");
                break;
            }
            popped = redis.pop_job() => popped?,
        };

        let Some(payload) = payload else {
            continue;
        };

        match jobs::decode(&payload) {
            Ok(job) => {
                info!("Received {} job", job.name());
                let manager = manager.clone();
                let mut replies = replies.clone();
                in_flight.spawn(async move {
                    let key = job.result_key().to_string();
                    let reply = jobs::process_job(&manager, job).await;
                    deliver(&mut replies, &key, &reply).await;
                });
            }
            Err(malformed) => {
                warn!("Failed to parse job data: {}. Data: {}", malformed.reason, payload);
                if let Some(key) = malformed.result_key {
                    let reply = JobReply::failure(
                        ErrorKind::InvalidRequest,
                        format!("Malformed job: {}", malformed.reason),
                    );
                    let mut replies = replies.clone();
                    deliver(&mut replies, &key, &reply).await;
                }
            }
        }
    }

    if !in_flight.is_empty() {
        info!("Waiting for {} running jobs to finish", in_flight.len());
        while in_flight.join_next().await.is_some() {}
    }

    Ok(())
}

async fn deliver(replies: &mut ReplySink, key: &str, reply: &JobReply) {
    if let Err(e) = replies.push(key, reply).await {
        error!("Failed to deliver reply to {}: {:#}", key, e);
    }
}
