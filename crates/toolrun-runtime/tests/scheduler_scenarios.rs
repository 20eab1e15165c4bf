use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mockito::{Matcher, Server};
use serde_json::json;

use toolrun_runtime::container::{
    ContainerInfo, ContainerRuntime, ContainerSpec, DockerClient, DockerClientConfig, ImageInfo,
    ImageListOptions, ImageSummary, RuntimeError, RuntimeEventConsumer,
};
use toolrun_runtime::process::{
    event_channel, BroadcastPublisher, InMemoryProcessRepository, ProcessEvent, ProcessEventKind,
    ProcessRepository, ProcessScheduler, ProcessSpec, ProcessStatus, SchedulerConfig,
};

async fn wait_for_status(repository: &InMemoryProcessRepository, id: &str, status: ProcessStatus) {
    for _ in 0..200 {
        if let Ok(Some(record)) = repository.get_process(id).await {
            if record.status == status {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{id} never reached {status}");
}

#[tokio::test]
async fn engine_events_finish_process_and_cascade_to_next() {
    let mut server = Server::new_async().await;
    let mut engine_mocks = Vec::new();
    for (process, container) in [("a", "ca"), ("b", "cb")] {
        let create = server
            .mock("POST", "/containers/create")
            .match_body(Matcher::PartialJson(
                json!({"Labels": {"toolrun.process": process}}),
            ))
            .with_status(201)
            .with_body(json!({"Id": container, "Warnings": []}).to_string())
            .create_async()
            .await;
        let inspect = server
            .mock("GET", format!("/containers/{container}/json").as_str())
            .with_status(200)
            .with_body(json!({"Id": container, "State": {"Status": "created"}}).to_string())
            .create_async()
            .await;
        engine_mocks.push(create);
        engine_mocks.push(inspect);
    }
    let start_a = server
        .mock("POST", "/containers/ca/start")
        .with_status(204)
        .create_async()
        .await;
    let start_b = server
        .mock("POST", "/containers/cb/start")
        .with_status(204)
        .create_async()
        .await;
    let _events = server
        .mock("GET", "/events")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            [
                json!({"Type": "container", "Action": "start", "Actor": {"ID": "ca"}}),
                json!({"Type": "container", "Action": "die", "Actor": {"ID": "ca", "Attributes": {"exitCode": "0"}}}),
            ]
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("\n"),
        )
        .create_async()
        .await;

    let client = DockerClient::new(DockerClientConfig {
        base_url: server.url(),
        ..DockerClientConfig::default()
    })
    .expect("client");
    let repository = Arc::new(InMemoryProcessRepository::new());
    let scheduler = ProcessScheduler::new(
        Arc::new(client.clone()),
        repository.clone(),
        Arc::new(BroadcastPublisher::default()),
        SchedulerConfig {
            max_running: 1,
            finalize_delay: Duration::from_secs(60),
            remove_finished_containers: false,
            ..SchedulerConfig::default()
        },
    );

    for id in ["a", "b"] {
        scheduler
            .create_process(ProcessSpec::new("tool/foo:1.0").with_id(id))
            .await
            .expect("create");
        scheduler.enqueue_process(id).await.expect("enqueue");
    }
    let first = scheduler.dequeue_process(true).await.expect("dequeue");
    assert_eq!(first.started().map(|p| p.id.as_str()), Some("a"));
    assert_eq!(
        repository.get_process("b").await.expect("get").map(|r| r.status),
        Some(ProcessStatus::Waiting)
    );

    let (tx, rx) = event_channel(16);
    let event_loop = scheduler.spawn_event_loop(rx);
    let stats = RuntimeEventConsumer::new(client, repository.clone(), tx)
        .run()
        .await
        .expect("consume");
    assert_eq!(stats.dispatched, 2);

    wait_for_status(&repository, "a", ProcessStatus::Finished).await;
    wait_for_status(&repository, "b", ProcessStatus::Running).await;
    assert_eq!(event_loop.await.expect("event loop"), 2);
    start_a.assert_async().await;
    start_b.assert_async().await;
    assert_eq!(repository.running_len().await.expect("len"), 1);
}

#[derive(Default)]
struct StubRuntime {
    next_id: Mutex<u64>,
    containers: Mutex<HashMap<String, bool>>,
}

#[async_trait]
impl ContainerRuntime for StubRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn create_container(&self, _spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut next = self.next_id.lock().expect("id lock");
        *next += 1;
        let id = format!("stub-{next}");
        self.containers
            .lock()
            .expect("containers lock")
            .insert(id.clone(), false);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        match self.containers.lock().expect("containers lock").get_mut(id) {
            Some(running) => {
                *running = true;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(format!("No such container: {id}"))),
        }
    }

    async fn stop_container(&self, _id: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn kill_container(&self, _id: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.containers.lock().expect("containers lock").remove(id);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        if self.containers.lock().expect("containers lock").contains_key(id) {
            Ok(ContainerInfo {
                id: id.to_string(),
                ..ContainerInfo::default()
            })
        } else {
            Err(RuntimeError::NotFound(format!("No such container: {id}")))
        }
    }

    async fn list_images(
        &self,
        _options: &ImageListOptions,
    ) -> Result<Vec<ImageSummary>, RuntimeError> {
        Ok(Vec::new())
    }

    async fn get_image(&self, id: &str) -> Result<ImageInfo, RuntimeError> {
        Err(RuntimeError::NotFound(id.to_string()))
    }
}

#[tokio::test]
async fn running_set_stays_within_limit_through_event_churn() {
    let runtime = Arc::new(StubRuntime::default());
    let repository = Arc::new(InMemoryProcessRepository::new());
    let publisher = Arc::new(BroadcastPublisher::new(256));
    let mut updates = publisher.subscribe();
    let scheduler = ProcessScheduler::new(
        runtime,
        repository.clone(),
        publisher,
        SchedulerConfig {
            max_running: 2,
            finalize_delay: Duration::from_millis(10),
            ..SchedulerConfig::default()
        },
    );

    let ids: Vec<String> = (0..6).map(|i| format!("p{i}")).collect();
    for id in &ids {
        scheduler
            .create_process(ProcessSpec::new("tool/bar").with_id(id.as_str()))
            .await
            .expect("create");
        scheduler.enqueue_process(id).await.expect("enqueue");
    }
    for _ in 0..2 {
        scheduler.dequeue_process(true).await.expect("dequeue");
    }

    let (tx, rx) = event_channel(32);
    let event_loop = scheduler.spawn_event_loop(rx);

    // Each process dies once it has started; the cascade starts the next one.
    for id in &ids {
        wait_for_status(&repository, id, ProcessStatus::Running).await;
        assert!(repository.running_len().await.expect("len") <= 2);
        let container_id = repository
            .get_process(id)
            .await
            .expect("get")
            .expect("record")
            .container_id;
        tx.send(ProcessEvent::new(id.as_str(), container_id, ProcessEventKind::ContainerDied))
            .await
            .expect("send");
    }
    drop(tx);
    event_loop.await.expect("event loop");

    for id in &ids {
        wait_for_status(&repository, id, ProcessStatus::Finished).await;
    }
    let status = scheduler.queue_status().await.expect("status");
    assert_eq!((status.waiting, status.running, status.finished), (0, 0, 6));

    let mut finished = 0;
    while let Ok(message) = updates.try_recv() {
        if message.ends_with(":FINISHED") {
            finished += 1;
        }
    }
    assert_eq!(finished, 6);
}
