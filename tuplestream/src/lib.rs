//! Motor de flujos de tuplas: fuentes, filtros, maps, group_by con
//! reducers y sinks, ejecutados en paralelo con particionado por clave.

pub mod config;
pub mod error;
mod executor;
pub mod graph;
pub mod grouper;
pub mod io;
pub mod pipeline;
pub mod report;
pub mod stage;
pub mod tuple;
pub mod value;

pub use config::{FilterErrorPolicy, GroupStrategy, RecordErrorPolicy, RunOptions};
pub use error::{PipelineError, Result};
pub use graph::{Plan, PlanNode, StageId, StageRef};
pub use grouper::{partition_for, Group, GroupMembers};
pub use pipeline::{Flow, FlowState, Pipe};
pub use report::{RunReport, RunStatus};
pub use stage::{emit_all, emit_none, emit_one, Filter, Map, MapMode, ReduceFn, ReduceOutput, Reducer};
pub use tuple::{FieldRef, Schema, Tuple};
pub use value::Value;

/// Todo lo necesario para armar y correr un flujo.
pub mod prelude {
    pub use crate::config::{FilterErrorPolicy, GroupStrategy, RecordErrorPolicy, RunOptions};
    pub use crate::error::PipelineError;
    pub use crate::io::{
        CollectSink, CsvSource, JsonlSink, JsonlSource, Sink, Source, TextLineSource, TsvSink,
        VecSource,
    };
    pub use crate::pipeline::{Flow, FlowState};
    pub use crate::stage::{emit_all, emit_none, emit_one, Filter, Map, Reducer};
    pub use crate::tuple::{Schema, Tuple};
    pub use crate::value::Value;
    pub use crate::grouper::GroupMembers;
    pub use crate::report::RunReport;
}
