//! Container engine adapter: HTTP client, image selection and the event feed.

pub mod client;
pub mod error;
pub mod events;
pub mod images;
pub mod models;

pub use client::{ContainerRuntime, DockerClient, DockerClientConfig, DEFAULT_MAX_RUNNING_TIME};
pub use error::{ConflictKind, RuntimeError, RuntimeOperation};
pub use events::{
    ConsumerStats, JsonRecordDecoder, RuntimeEventConsumer, RuntimeEventKind, RuntimeEventStream,
};
pub use images::{compare_versions, select_images};
pub use models::{
    ContainerInfo, ContainerSpec, ContainerState, ImageInfo, ImageListOptions, ImageSummary,
    RuntimeEventRecord, PROCESS_LABEL,
};
