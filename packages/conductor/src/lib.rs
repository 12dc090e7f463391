//! conductor — a manifest-driven workflow orchestrator.
//!
//! Manifests define runnable jobs (schedule, retry policy, DAG placement);
//! every execution attempt is an immutable metadata record; a work queue
//! feeds a bounded dispatcher that launches workflows through the
//! [`junction`] bus.
//!
//! ```text
//! ManifestManager (every 5s)
//!     ├─► reap stuck executions            (Timeout)
//!     ├─► promote exhausted manifests      (DeadLetter)
//!     ├─► retention cleanup
//!     └─► due manifests ──► WorkQueue
//!
//! JobDispatcher (every 5s)
//!     └─► claim WorkQueue ──► Metadata(Pending)
//!             └─► TaskServer ──► WorkflowBus ──► workflow code
//!                     └─► Metadata(InProgress → Completed | Failed | Cancelled)
//!                             └─► retry backoff / lastSuccessfulRunAt
//! ```
//!
//! Crash safety: the store is the only shared mutable state, and every loop
//! can resume from the database alone. The dispatcher's claim is atomic,
//! metadata transitions are compare-and-set, and counters that drift are
//! reconciled against the store.

pub mod config;
pub mod dag;
pub mod dispatcher;
pub mod kernel;
pub mod manager;
pub mod ops;
pub mod retry;
pub mod schedule;
pub mod seeding;
pub mod service;
pub mod store;
pub mod taskserver;

pub use config::{Config, MetadataCleanup};
pub use dispatcher::{DispatcherConfig, GroupSlots, JobDispatcher};
pub use manager::{CleanupSweeper, ManagerConfig, ManifestManager, Reaper};
pub use ops::Controller;
pub use seeding::{seed, ManifestSeed, SeedReport};
pub use service::{RunningHost, Service, ServiceHost};
pub use taskserver::{completion_channel, CompletionEvent, TokioTaskServer};
