// engine/src/workflow/mod.rs
//! Workflow engine: definitions and their lifecycle, prompt templates, and
//! run execution.

pub mod definition;
pub mod executor;
pub mod template;

pub use definition::{
    CriteriaList, NewStep, NewWorkflow, Workflow, WorkflowStatus, WorkflowStep, WorkflowUpdate,
};
pub use executor::{
    BatchOutcome, BatchRequest, RunDetail, RunFilter, RunRequest, RunStatus, StepRun, StepStatus,
    WorkflowRun,
};
