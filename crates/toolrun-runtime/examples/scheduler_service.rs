//! Scheduler service wired from the environment.
//!
//! Connects to the container engine, follows its event feed, and submits the
//! images given on the command line as processes.
//!
//! Run with:
//!   TOOLRUN_DOCKER_URL=http://127.0.0.1:2375 cargo run -p toolrun-runtime --example scheduler_service -- alpine:3.20 busybox:latest
//!   TOOLRUN_STORE_BACKEND=redis TOOLRUN_REDIS_URL=redis://127.0.0.1/ cargo run -p toolrun-runtime --example scheduler_service --features redis-store -- alpine:3.20

use std::sync::Arc;
use std::time::Duration;

use toolrun_runtime::container::{DockerClient, RuntimeEventConsumer};
use toolrun_runtime::process::{event_channel, ProcessQuery, ProcessScheduler, ProcessSpec};
use toolrun_runtime::RuntimeConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = RuntimeConfig::from_env()?;
    config.startup_health_check().await?;

    let client = DockerClient::new(config.docker_client_config())?;
    let (repository, publisher) = config.build_store().await?;
    let scheduler = ProcessScheduler::new(
        Arc::new(client.clone()),
        Arc::clone(&repository),
        publisher,
        config.scheduler_config(),
    );

    let (events_tx, events_rx) = event_channel(256);
    let event_loop = scheduler.spawn_event_loop(events_rx);
    let consumer = RuntimeEventConsumer::new(client, Arc::clone(&repository), events_tx);
    let feed = tokio::spawn(async move { consumer.run().await });

    for image in std::env::args().skip(1) {
        let spec = ProcessSpec::new(image.as_str()).with_requester("scheduler_service");
        let outcome = scheduler.run_process_post(spec).await?;
        println!(
            "{} {} -> {}",
            outcome.process().id,
            image,
            if outcome.is_started() { "started" } else { "pending" }
        );
    }

    loop {
        let status = scheduler.queue_status().await?;
        println!(
            "queue: waiting={} running={} finished={} (max_running={})",
            status.waiting, status.running, status.finished, status.max_running
        );
        if status.waiting == 0 && status.running == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    let summary = scheduler
        .get_all_process_info(
            &ProcessQuery::new()
                .with_fields("id,image,status,startedAt,finishedAt")
                .sorted_by("createdAt", "asc"),
        )
        .await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    feed.abort();
    let _ = event_loop.await;
    Ok(())
}
