//! junction — an in-process workflow bus.
//!
//! junction owns the seams between an orchestrator and the workflow code it
//! launches: a name-keyed registry built at startup, a self-describing JSON
//! payload envelope, the bus that decodes-and-runs, and the task-server
//! contract for background hosts.
//!
//! ```text
//! Orchestrator                         junction                Workflow code
//!     │                                    │                        │
//!     ├─ enqueue(TaskUnit) ──────────► TaskServer                   │
//!     │                                    │                        │
//!     │                         run_by_name(name, input)            │
//!     │                                    ├─► WorkflowRegistry     │
//!     │                                    │     decode ($type)     │
//!     │                                    │     run ───────────────►
//!     │ ◄── serde_json::Value / WorkflowFailure ◄──────────────────┤
//! ```
//!
//! # Design Philosophy
//!
//! junction owns interfaces only. Policy decisions (polling cadence, retry
//! backoff, concurrency limits, persistence) belong to the orchestrator.
//! The registry is the source of truth for dispatch; the embedded `$type`
//! discriminator is a rehydration fallback, never a routing mechanism.

pub mod bus;
pub mod core;
pub mod error;
pub mod payload;
pub mod registry;
pub mod task_server;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use bus::{RegistryBus, WorkflowBus};
pub use error::{BusError, DecodeError, EnqueueError, WorkflowFailure};
pub use self::core::{RunContext, StepError, Workflow};
pub use registry::{AlreadyRegistered, SharedWorkflowRegistry, WorkflowRegistry};
pub use task_server::{RecurringCallback, TaskHandle, TaskServer, TaskUnit};
