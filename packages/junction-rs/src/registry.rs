//! Name-keyed workflow registry.
//!
//! The registry maps workflow names to a `(decode, run)` pair built at
//! startup from a discovery list. It is the source of truth for dispatch:
//! the `$type` discriminator embedded in payloads is only a fallback for
//! rehydration, never a routing mechanism.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::core::{RunContext, Workflow};
use crate::error::{BusError, DecodeError, WorkflowFailure};
use crate::payload;

type BoxedRun = Box<
    dyn Fn(Value, Option<String>, RunContext) -> Pin<Box<dyn Future<Output = Result<Value, BusError>> + Send>>
        + Send
        + Sync,
>;

type BoxedCheck = Box<dyn Fn(&Value, Option<&str>) -> Result<(), DecodeError> + Send + Sync>;

struct Registration {
    input_type_name: &'static str,
    run: BoxedRun,
    check: BoxedCheck,
}

/// Error raised when the discovery list registers the same name twice.
#[derive(Debug, thiserror::Error)]
#[error("workflow {0} is already registered")]
pub struct AlreadyRegistered(pub String);

/// Registry mapping workflow names to decode and run closures.
///
/// Built once at startup; shared read-only afterwards.
#[derive(Default)]
pub struct WorkflowRegistry {
    entries: HashMap<&'static str, Registration>,
}

impl WorkflowRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a workflow under its declared name.
    pub fn register<W: Workflow>(&mut self, workflow: W) -> Result<(), AlreadyRegistered> {
        let name = workflow.name();
        if self.entries.contains_key(name) {
            return Err(AlreadyRegistered(name.to_string()));
        }

        let input_type_name = workflow.input_type_name();
        let workflow = Arc::new(workflow);

        let check_workflow = name;
        let check: BoxedCheck = Box::new(move |value, hint| {
            payload::decode::<W::Input>(check_workflow, input_type_name, value, hint).map(|_| ())
        });

        let run: BoxedRun = Box::new(move |value, hint, ctx| {
            let workflow = Arc::clone(&workflow);
            Box::pin(async move {
                let input = payload::decode::<W::Input>(
                    workflow.name(),
                    workflow.input_type_name(),
                    &value,
                    hint.as_deref(),
                )?;
                match workflow.run(input, ctx).await {
                    Ok(output) => {
                        let output = serde_json::to_value(output).map_err(|e| {
                            BusError::Failure(WorkflowFailure::from_reason(format!(
                                "output serialization failed: {e}"
                            )))
                        })?;
                        Ok(output)
                    }
                    Err(error) => Err(BusError::Failure(WorkflowFailure::from_error(&error))),
                }
            })
        });

        self.entries.insert(
            name,
            Registration {
                input_type_name,
                run,
                check,
            },
        );
        Ok(())
    }

    /// Whether a workflow name resolves.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, sorted for reproducible listings.
    pub fn registered_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.entries.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// The input discriminator a workflow was registered with.
    pub fn input_type_name(&self, name: &str) -> Option<&'static str> {
        self.entries.get(name).map(|r| r.input_type_name)
    }

    /// Validate that a payload would rehydrate for `name`, without running.
    ///
    /// Dispatchers call this before committing an execution record, so
    /// undecodable inputs are born failed instead of burning a worker slot.
    pub fn check_input(
        &self,
        name: &str,
        value: &Value,
        hint: Option<&str>,
    ) -> Result<(), DecodeError> {
        let registration = self
            .entries
            .get(name)
            .ok_or_else(|| DecodeError::UnknownWorkflow(name.to_string()))?;
        (registration.check)(value, hint)
    }

    /// Decode and execute the named workflow.
    pub async fn run(
        &self,
        name: &str,
        value: Value,
        hint: Option<String>,
        ctx: RunContext,
    ) -> Result<Value, BusError> {
        let registration = self
            .entries
            .get(name)
            .ok_or_else(|| DecodeError::UnknownWorkflow(name.to_string()))?;
        (registration.run)(value, hint, ctx).await
    }
}

/// Thread-safe registry handle shared by the bus and dispatchers.
pub type SharedWorkflowRegistry = Arc<WorkflowRegistry>;
