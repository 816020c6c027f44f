//! Tool selection: inclusion policies and bounded per-agent tool sets.

mod policy;
mod selector;

pub use policy::{InclusionSpec, PolicyError, ServerPolicy, ToolFilter};
pub use selector::{
    EmptyReason, Selection, SelectionReport, ServerSelection, ToolSelector, UnavailableServer,
};
