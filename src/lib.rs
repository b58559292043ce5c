// ABOUTME: Queue-backed replication engine propagating local POS writes to a cloud store
// ABOUTME: Capture -> dedup guard -> operation queue -> dispatch loop -> idempotent applier

pub mod applier;
pub mod config;
pub mod connectivity;
pub mod dedup;
pub mod engine;
pub mod event;
pub mod postgres;
pub mod queue;
pub mod registry;
pub mod sqlite;

pub use applier::{Applier, ApplyError, SecondaryStore};
pub use config::{DatabaseMode, ReplicationConfig};
pub use engine::{CaptureOutcome, KindCounts, ReplicationEngine, SyncStatus};
pub use event::{ChangeEvent, InvalidEvent, Operation};
pub use registry::{EntityDef, Registry};
