//! The iteration orchestrator (§4.7): the centerpiece "fresh context every iteration"
//! supervisor loop and the run record it exposes to observers.

pub mod run_record;
pub mod supervisor;

pub use run_record::RunRecord;
pub use supervisor::{RunParams, Supervisor};
