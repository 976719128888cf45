//! Construcción y ejecución de flujos.
//!
//! Un [`Flow`] se arma encadenando etapas a partir de una fuente:
//!
//! ```no_run
//! use tuplestream::prelude::*;
//!
//! # fn main() -> tuplestream::Result<()> {
//! let mut flow = Flow::new();
//! flow.source(TextLineSource::new("data/town.txt"))?
//!     .filter(Filter::new("no_vacia", |t: &Tuple, _: &[Value]| {
//!         Ok(!t.get_str("line")?.is_empty())
//!     }))?
//!     .sink(TsvSink::create("out/lines.tsv"))?;
//! let _report = flow.run_blocking(RunOptions::default())?;
//! # Ok(())
//! # }
//! ```
//!
//! Cada operación de cableado valida los campos contra el esquema de la
//! etapa anterior, así que un flujo mal armado falla antes de leer datos.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::config::RunOptions;
use crate::error::{PipelineError, Result};
use crate::executor;
use crate::graph::{Graph, GroupBy, Plan, StageId, StageKind};
use crate::io::{Sink, Source};
use crate::report::RunReport;
use crate::stage::{Filter, Map, Reducer};
use crate::tuple::{Schema, Tuple};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowState {
    /// Se pueden agregar etapas.
    Building,
    Running,
    Completed,
    Failed,
}

/// Grafo de etapas más su estado de ejecución. Se ejecuta una sola vez.
pub struct Flow {
    graph: Graph,
    state: FlowState,
    report: Option<RunReport>,
}

impl Default for Flow {
    fn default() -> Self {
        Self::new()
    }
}

impl Flow {
    pub fn new() -> Self {
        Self {
            graph: Graph::default(),
            state: FlowState::Building,
            report: None,
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Reporte de la última ejecución (también si falló).
    pub fn report(&self) -> Option<&RunReport> {
        self.report.as_ref()
    }

    fn ensure_building(&self) -> Result<()> {
        match self.state {
            FlowState::Building => Ok(()),
            state => Err(PipelineError::AlreadyRun { state }),
        }
    }

    /// Agrega una fuente. Un flujo puede tener varias.
    pub fn source<S: Source + 'static>(&mut self, source: S) -> Result<Pipe<'_>> {
        self.ensure_building()?;
        let label = source.name();
        let schema = source.schema();
        let at = self
            .graph
            .add_source(StageKind::Source(Some(Box::new(source))), label, schema);
        Ok(Pipe { flow: self, at })
    }

    /// Retoma el flujo en una etapa ya agregada, para abrir otra rama.
    pub fn at(&mut self, id: StageId) -> Result<Pipe<'_>> {
        self.graph.node(id)?;
        Ok(Pipe { flow: self, at: id })
    }

    /// Esquema de salida de una etapa (para un sink, el que recibe).
    pub fn schema(&self, id: StageId) -> Result<Arc<Schema>> {
        Ok(self.graph.node(id)?.schema.clone())
    }

    pub fn plan(&self) -> Plan {
        self.graph.plan()
    }

    pub fn filter(&mut self, at: StageId, filter: Filter) -> Result<StageId> {
        self.ensure_building()?;
        let input = self.schema(at)?;
        input.positions(filter.read_fields())?;
        let label = format!("filter({})", filter.name());
        self.graph.attach(at, StageKind::Filter(filter), label, input)
    }

    pub fn map(&mut self, at: StageId, map: Map) -> Result<StageId> {
        self.ensure_building()?;
        let input = self.schema(at)?;
        input.positions(map.read_fields())?;
        let output = Arc::new(map.output_schema(&input)?);
        let label = map.name().to_string();
        self.graph.attach(at, StageKind::Map(map), label, output)
    }

    /// Agrupa por `keys` y aplica `reducer` a cada grupo. La salida tiene
    /// los campos que el reducer declara en `produces`.
    pub fn group_by(&mut self, at: StageId, keys: &[&str], reducer: Reducer) -> Result<StageId> {
        self.ensure_building()?;
        if keys.is_empty() {
            return Err(PipelineError::EmptyKey);
        }
        let input = self.schema(at)?;
        let key_schema = Schema::shared(keys.iter().copied())?;
        let key_positions = input.positions(keys)?;
        let output = Schema::shared(reducer.produces().iter().cloned())?;

        let label = format!("group_by({}) {}", keys.join(", "), reducer.name());
        let group = GroupBy {
            key_fields: key_schema.fields().to_vec(),
            key_positions,
            key_schema,
            input_schema: input,
            reducer,
        };
        self.graph
            .attach(at, StageKind::GroupReduce(group), label, output)
    }

    /// Termina una rama. Si el sink declara campos esperados, deben estar
    /// todos en el esquema que le llega.
    pub fn sink<S: Sink + 'static>(&mut self, at: StageId, sink: S) -> Result<StageId> {
        self.ensure_building()?;
        let input = self.schema(at)?;
        if let Some(expected) = sink.expects() {
            input.positions(expected.as_slice())?;
        }
        let label = sink.name();
        self.graph
            .attach(at, StageKind::Sink(Some(Box::new(sink))), label, input)
    }

    /// Ejecuta el flujo hasta el final.
    ///
    /// Las validaciones previas (fuentes, ramas sin sink, opciones) dejan
    /// el flujo en `Building` para poder corregirlo. Una vez que empieza a
    /// correr, el flujo no se puede volver a ejecutar.
    pub async fn run(&mut self, opts: RunOptions) -> Result<RunReport> {
        self.ensure_building()?;
        self.graph.check_runnable()?;
        opts.validate()?;
        executor::check_capacity(&self.graph, &opts)?;

        self.state = FlowState::Running;
        let mut report = RunReport::started(Uuid::new_v4(), opts.num_reducers);
        info!(
            "ejecución {} iniciada: {} etapas, {} reducers",
            report.run_id,
            self.graph.len(),
            opts.num_reducers
        );

        let result = executor::execute(&mut self.graph, &opts, &mut report).await;
        self.state = match result {
            Ok(()) => FlowState::Completed,
            Err(_) => FlowState::Failed,
        };
        self.report = Some(report.clone());
        result.map(|()| report)
    }

    /// Igual que [`Flow::run`] con un runtime propio. No llamar desde
    /// dentro de otro runtime de tokio.
    pub fn run_blocking(&mut self, opts: RunOptions) -> Result<RunReport> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| PipelineError::runtime(format!("no se pudo crear el runtime: {e}")))?;
        rt.block_on(self.run(opts))
    }
}

/// Extremo de una rama en construcción.
pub struct Pipe<'f> {
    flow: &'f mut Flow,
    at: StageId,
}

impl<'f> Pipe<'f> {
    pub fn id(&self) -> StageId {
        self.at
    }

    pub fn schema(&self) -> Result<Arc<Schema>> {
        self.flow.schema(self.at)
    }

    fn then(self, id: StageId) -> Pipe<'f> {
        Pipe {
            flow: self.flow,
            at: id,
        }
    }

    pub fn filter(self, filter: Filter) -> Result<Pipe<'f>> {
        let id = self.flow.filter(self.at, filter)?;
        Ok(self.then(id))
    }

    pub fn map(self, map: Map) -> Result<Pipe<'f>> {
        let id = self.flow.map(self.at, map)?;
        Ok(self.then(id))
    }

    pub fn map_replace<F>(self, fields: &[&str], transform: F) -> Result<Pipe<'f>>
    where
        F: Fn(&Tuple) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    {
        self.map(Map::replace(fields, transform))
    }

    pub fn map_add<F>(self, fields: &[&str], transform: F) -> Result<Pipe<'f>>
    where
        F: Fn(&Tuple) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    {
        self.map(Map::add(fields, transform))
    }

    pub fn group_by(self, keys: &[&str], reducer: Reducer) -> Result<Pipe<'f>> {
        let id = self.flow.group_by(self.at, keys, reducer)?;
        Ok(self.then(id))
    }

    pub fn sink<S: Sink + 'static>(self, sink: S) -> Result<StageId> {
        self.flow.sink(self.at, sink)
    }
}
