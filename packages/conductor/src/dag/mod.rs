//! Cross-group dependency DAG: validation and layout.
//!
//! Nodes are manifest groups; ungrouped manifests each form a singleton
//! group keyed by their external id. An edge `parent → child` exists iff a
//! manifest in the child group depends on a manifest in the parent group.
//! Same-group edges are ignored.
//!
//! Acyclicity is a precondition of scheduler start. The layout engine feeds
//! the dashboard and is not needed for scheduling correctness, only for
//! reproducible rendering.

pub mod layout;
pub mod validator;

pub use layout::{layout, DagLayout};
pub use validator::{build_graph, validate, DagError, DagGraph, DagNode, GroupKey};
