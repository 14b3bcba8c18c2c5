mod baseline;
mod engine;
mod entity;
mod message;
mod world;

pub use baseline::{AckHistory, select_baseline};
pub use engine::{EntitySerializer, SnapshotEngine};
pub use entity::{EntityIds, MAX_ENTITY_ID};
pub use message::{SnapshotCodec, SnapshotFrame, SnapshotHeader};
pub use world::{DEFAULT_SNAPSHOT_WORDS, EntityEntry, WorldSnapshot};
