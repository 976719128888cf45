//! Ejecución de un flujo sobre tareas bloqueantes de tokio.
//!
//! Una tarea por fuente, `W` tareas (workers) por cada group_by y una
//! tarea escritora por sink, conectadas con canales acotados. Los filtros
//! y maps no tienen tarea propia: se aplican dentro de la tarea que
//! produjo el registro (fuente o worker), siguiendo un árbol de [`Route`].
//!
//! Cancelación: la primera falla queda registrada en [`RunState`] y se
//! levanta la señal de aborto, que todas las tareas consultan entre
//! registros. Al cortarse una tarea se sueltan sus canales y el resto
//! termina en cadena.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tokio::{
    sync::mpsc::{self, Receiver, Sender},
    task::{spawn_blocking, JoinHandle},
};
use tracing::{debug, error, info, warn};

use crate::config::{GroupStrategy, RecordErrorPolicy, RunOptions};
use crate::error::{PipelineError, Result};
use crate::graph::{Graph, GroupBy, StageId, StageKind, StageRef};
use crate::grouper::{partition_for, GroupCursor, GroupMembers, Grouper};
use crate::io::{Sink, Source};
use crate::report::{RunCounters, RunReport};
use crate::stage::{guarded, Filter, FilterOutcome, Map};
use crate::tuple::{Schema, Tuple};

/// Tope de tareas simultáneas: el pool bloqueante de tokio no crece más
/// allá de esto y todas las tareas de un flujo deben correr a la vez.
const MAX_TASKS: usize = 512;

/* =========================
   Estado compartido
   ========================= */

pub(crate) struct RunState {
    abort: AtomicBool,
    failure: Mutex<Option<PipelineError>>,
    pub counters: RunCounters,
    policy: RecordErrorPolicy,
}

/// La tarea debe cortar; la causa ya quedó registrada.
struct Stop;

type Step = std::result::Result<(), Stop>;

impl RunState {
    fn new(policy: RecordErrorPolicy) -> Self {
        Self {
            abort: AtomicBool::new(false),
            failure: Mutex::new(None),
            counters: RunCounters::default(),
            policy,
        }
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Registra la falla (sólo la primera cuenta) y levanta el aborto.
    fn fail(&self, err: PipelineError) {
        let mut slot = self.failure.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            error!("ejecución abortada: {err}");
            *slot = Some(err);
        } else {
            debug!("falla adicional ignorada: {err}");
        }
        self.cancel();
    }

    fn take_failure(&self) -> Option<PipelineError> {
        self.failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Fallo de lógica de usuario sobre un registro o grupo.
    fn record_error(&self, stage: &StageRef, record: String, cause: anyhow::Error) -> Step {
        match self.policy {
            RecordErrorPolicy::Abort => {
                self.fail(PipelineError::Record {
                    stage: stage.clone(),
                    record,
                    cause,
                });
                Err(Stop)
            }
            RecordErrorPolicy::DropAndLog => {
                warn!("{stage}: se descarta {record}: {cause:#}");
                RunCounters::inc(&self.counters.dropped_records);
                Ok(())
            }
        }
    }
}

fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/* =========================
   Rutas dentro de una tarea
   ========================= */

/// Camino que recorre una tupla desde la tarea que la produjo hasta el
/// próximo canal (shuffle hacia un group_by o escritor de un sink).
enum Route {
    Filter {
        stage: StageRef,
        filter: Filter,
        next: Vec<Route>,
    },
    Map {
        stage: StageRef,
        map: Map,
        schema: Arc<Schema>,
        next: Vec<Route>,
    },
    Shuffle {
        key_positions: Vec<usize>,
        senders: Vec<Sender<Tuple>>,
    },
    Sink {
        sender: Sender<Tuple>,
    },
}

impl Route {
    fn push(&self, t: Tuple, st: &RunState) -> Step {
        match self {
            Route::Filter {
                stage,
                filter,
                next,
            } => match filter.evaluate(&t) {
                FilterOutcome::Keep => push_all(next, t, st),
                FilterOutcome::Drop => {
                    RunCounters::inc(&st.counters.filtered_out);
                    Ok(())
                }
                FilterOutcome::Excluded(e) => {
                    debug!("{stage}: predicado falló sobre {t}, se excluye: {e:#}");
                    RunCounters::inc(&st.counters.filter_errors);
                    RunCounters::inc(&st.counters.filtered_out);
                    Ok(())
                }
                FilterOutcome::Failed(e) => st.record_error(stage, t.to_string(), e),
            },
            Route::Map {
                stage,
                map,
                schema,
                next,
            } => match map.apply(&t, schema) {
                Ok(out) => push_all(next, out, st),
                Err(e) => st.record_error(stage, t.to_string(), e),
            },
            Route::Shuffle {
                key_positions,
                senders,
            } => {
                let key = t.project_values(key_positions);
                let target = partition_for(&key, senders.len());
                send(&senders[target], t, st)
            }
            Route::Sink { sender } => send(sender, t, st),
        }
    }
}

/// Un envío fallido significa que el receptor ya cortó: cancelamos.
fn send(tx: &Sender<Tuple>, t: Tuple, st: &RunState) -> Step {
    tx.blocking_send(t).map_err(|_| {
        st.cancel();
        Stop
    })
}

fn push_all(routes: &[Route], t: Tuple, st: &RunState) -> Step {
    if let Some((last, rest)) = routes.split_last() {
        for r in rest {
            r.push(t.clone(), st)?;
        }
        last.push(t, st)?;
    }
    Ok(())
}

/* =========================
   Tareas
   ========================= */

struct SourceTask {
    stage: StageRef,
    source: Box<dyn Source>,
    schema: Arc<Schema>,
    routes: Vec<Route>,
}

struct WorkerTask {
    stage: StageRef,
    index: usize,
    rx: Receiver<Tuple>,
    group: GroupBy,
    out_schema: Arc<Schema>,
    routes: Vec<Route>,
    strategy: GroupStrategy,
    spill_dir: PathBuf,
    threshold: usize,
}

struct SinkTask {
    stage: StageRef,
    sink: Box<dyn Sink>,
    rx: Receiver<Tuple>,
}

fn run_source(task: SourceTask, st: &RunState) {
    let SourceTask {
        stage,
        mut source,
        schema,
        routes,
    } = task;

    let mut iter = match guarded(|| source.open()) {
        Ok(it) => it,
        Err(cause) => {
            st.fail(PipelineError::SourceReadFailure { stage, cause });
            return;
        }
    };

    let mut read = 0u64;
    while !st.aborted() {
        let item = match guarded(|| Ok(iter.next())) {
            Ok(item) => item,
            Err(e) => Some(Err(e)),
        };
        let t = match item {
            None => break,
            Some(Ok(t)) => t,
            Some(Err(cause)) => {
                st.fail(PipelineError::SourceReadFailure {
                    stage: stage.clone(),
                    cause,
                });
                break;
            }
        };
        if !Arc::ptr_eq(t.schema(), &schema) && t.schema().fields() != schema.fields() {
            st.fail(PipelineError::SourceReadFailure {
                stage: stage.clone(),
                cause: anyhow::anyhow!(
                    "tupla con esquema [{}], se declaró [{}]",
                    t.schema(),
                    schema
                ),
            });
            break;
        }
        read += 1;
        RunCounters::inc(&st.counters.records_read);
        if push_all(&routes, t, st).is_err() {
            break;
        }
    }
    debug!("fuente {stage}: {read} registros leídos");
}

fn run_worker(task: WorkerTask, st: &RunState) {
    let WorkerTask {
        stage,
        index,
        mut rx,
        group,
        out_schema,
        routes,
        strategy,
        spill_dir,
        threshold,
    } = task;

    // 1) juntar toda la partición
    let mut grouper = Grouper::new(strategy, spill_dir, threshold);
    let mut received = 0u64;
    while let Some(t) = rx.blocking_recv() {
        if st.aborted() {
            return;
        }
        received += 1;
        let key = t.project_values(&group.key_positions);
        if let Err(e) = grouper.push(key, t.values().to_vec()) {
            st.fail(PipelineError::runtime(format!(
                "spill de {stage} (worker {index}): {e}"
            )));
            return;
        }
    }
    drop(rx);
    if st.aborted() {
        return;
    }

    let runs = grouper.spilled_runs();
    add(&st.counters.spilled_runs, runs as u64);
    let stream = match grouper.finish() {
        Ok(s) => s,
        Err(e) => {
            st.fail(PipelineError::runtime(format!(
                "merge de {stage} (worker {index}): {e}"
            )));
            return;
        }
    };

    // 2) reducir grupo por grupo
    let ctx = ReduceCtx {
        stage: &stage,
        group: &group,
        out_schema: &out_schema,
        routes: &routes,
    };
    let mut cursor = GroupCursor::new(stream, group.input_schema.clone(), group.key_schema.clone());
    let mut groups = 0u64;
    while let Some(g) = cursor.next_group() {
        if st.aborted() {
            return;
        }
        groups += 1;
        RunCounters::inc(&st.counters.groups);
        if reduce_group(&ctx, &g.key, g.members, st).is_err() {
            return;
        }
    }
    if let Some(e) = cursor.take_error() {
        st.fail(PipelineError::runtime(format!(
            "lectura de spill en {stage} (worker {index}): {e}"
        )));
        return;
    }
    info!("{stage} worker {index}: {received} tuplas, {groups} grupos, {runs} runs en disco");
}

struct ReduceCtx<'w> {
    stage: &'w StageRef,
    group: &'w GroupBy,
    out_schema: &'w Arc<Schema>,
    routes: &'w [Route],
}

/// Invoca el reducer sobre un grupo y reenvía cada fila antes de pedir
/// la siguiente.
fn reduce_group<'a>(
    ctx: &ReduceCtx<'_>,
    key: &'a Tuple,
    members: GroupMembers<'a>,
    st: &RunState,
) -> Step {
    let reducer = &ctx.group.reducer;
    let expected = reducer.produces().len();

    let mut rows = match guarded(|| Ok(reducer.func().reduce(key, members))) {
        Ok(rows) => rows,
        Err(e) => return st.record_error(ctx.stage, format!("grupo {key}"), e),
    };

    loop {
        if st.aborted() {
            return Err(Stop);
        }
        let row = match guarded(|| Ok(rows.next())) {
            Ok(None) => return Ok(()),
            Ok(Some(Ok(row))) => row,
            Ok(Some(Err(e))) | Err(e) => {
                return st.record_error(ctx.stage, format!("grupo {key}"), e)
            }
        };
        if row.len() != expected {
            let err = PipelineError::ReducerArityMismatch {
                stage: ctx.stage.clone(),
                key: key.to_string(),
                expected,
                found: row.len(),
            };
            warn!("fila descartada: {err}");
            RunCounters::inc(&st.counters.rejected_rows);
            continue;
        }
        push_all(ctx.routes, Tuple::from_parts(ctx.out_schema.clone(), row), st)?;
    }
}

/// Devuelve el sink para que el executor decida entre `complete` y `abort`.
fn run_sink(task: SinkTask, st: &RunState) -> (StageRef, Box<dyn Sink>) {
    let SinkTask {
        stage,
        mut sink,
        mut rx,
    } = task;

    let mut written = 0u64;
    while let Some(t) = rx.blocking_recv() {
        if st.aborted() {
            break;
        }
        match guarded(|| sink.accept(t)) {
            Ok(()) => {
                written += 1;
                RunCounters::inc(&st.counters.records_written);
            }
            Err(cause) => {
                st.fail(PipelineError::SinkWriteFailure {
                    stage: stage.clone(),
                    cause,
                });
                break;
            }
        }
    }
    debug!("sink {stage}: {written} tuplas recibidas");
    (stage, sink)
}

/* =========================
   Armado del plan de tareas
   ========================= */

/// Cantidad de tareas que necesita el flujo con estas opciones.
fn task_count(graph: &Graph, num_reducers: usize) -> usize {
    graph
        .ids()
        .filter_map(|id| graph.node(id).ok())
        .map(|n| match n.kind {
            StageKind::Source(_) | StageKind::Sink(_) => 1,
            StageKind::GroupReduce(_) => num_reducers,
            StageKind::Filter(_) | StageKind::Map(_) => 0,
        })
        .sum()
}

/// Falla con `InvalidConfig` si el flujo no entra en el pool de tareas.
pub(crate) fn check_capacity(graph: &Graph, opts: &RunOptions) -> Result<()> {
    let n = task_count(graph, opts.num_reducers);
    if n > MAX_TASKS {
        return Err(PipelineError::InvalidConfig(format!(
            "el flujo necesita {n} tareas con {} reducers; el máximo es {MAX_TASKS}",
            opts.num_reducers
        )));
    }
    Ok(())
}

/// Extremos de escritura de todos los canales. Se sueltan apenas se
/// arman las rutas, para que cada canal se cierre cuando terminan sus
/// productores.
#[derive(Default)]
struct Senders {
    shuffle: HashMap<StageId, Vec<Sender<Tuple>>>,
    sinks: HashMap<StageId, Sender<Tuple>>,
}

fn build_routes(graph: &Graph, children: &[StageId], tx: &Senders) -> Result<Vec<Route>> {
    children
        .iter()
        .map(|&id| build_route(graph, id, tx))
        .collect()
}

fn build_route(graph: &Graph, id: StageId, tx: &Senders) -> Result<Route> {
    let node = graph.node(id)?;
    let missing = || PipelineError::runtime(format!("canal faltante para la etapa #{}", id.0));
    Ok(match &node.kind {
        StageKind::Filter(filter) => Route::Filter {
            stage: graph.stage_ref(id),
            filter: filter.clone(),
            next: build_routes(graph, &node.downstream, tx)?,
        },
        StageKind::Map(map) => Route::Map {
            stage: graph.stage_ref(id),
            map: map.clone(),
            schema: node.schema.clone(),
            next: build_routes(graph, &node.downstream, tx)?,
        },
        StageKind::GroupReduce(g) => Route::Shuffle {
            key_positions: g.key_positions.clone(),
            senders: tx.shuffle.get(&id).cloned().ok_or_else(missing)?,
        },
        StageKind::Sink(_) => Route::Sink {
            sender: tx.sinks.get(&id).cloned().ok_or_else(missing)?,
        },
        StageKind::Source(_) => {
            return Err(PipelineError::runtime(format!(
                "la fuente #{} no puede tener etapa previa",
                id.0
            )))
        }
    })
}

struct TaskPlan {
    sources: Vec<SourceTask>,
    workers: Vec<WorkerTask>,
    sinks: Vec<SinkTask>,
}

fn prepare(graph: &mut Graph, opts: &RunOptions, run_dir: &Path) -> Result<TaskPlan> {
    let w = opts.num_reducers;
    let ids: Vec<StageId> = graph.ids().collect();

    // 1) canales
    let mut tx = Senders::default();
    let mut worker_rx: HashMap<StageId, Vec<Receiver<Tuple>>> = HashMap::new();
    let mut sink_rx: HashMap<StageId, Receiver<Tuple>> = HashMap::new();
    for &id in &ids {
        match graph.node(id)?.kind {
            StageKind::GroupReduce(_) => {
                let (senders, receivers): (Vec<Sender<Tuple>>, Vec<Receiver<Tuple>>) =
                    (0..w).map(|_| mpsc::channel(opts.channel_capacity)).unzip();
                tx.shuffle.insert(id, senders);
                worker_rx.insert(id, receivers);
            }
            StageKind::Sink(_) => {
                let (s, r) = mpsc::channel(opts.channel_capacity);
                tx.sinks.insert(id, s);
                sink_rx.insert(id, r);
            }
            _ => {}
        }
    }

    // 2) rutas de cada tarea productora
    let mut plan = TaskPlan {
        sources: Vec::new(),
        workers: Vec::new(),
        sinks: Vec::new(),
    };
    let mut source_routes = Vec::new();
    for &id in &ids {
        let node = graph.node(id)?;
        match &node.kind {
            StageKind::Source(_) => {
                source_routes.push((id, build_routes(graph, &node.downstream, &tx)?));
            }
            StageKind::GroupReduce(g) => {
                let receivers = worker_rx.remove(&id).unwrap_or_default();
                for (index, rx) in receivers.into_iter().enumerate() {
                    plan.workers.push(WorkerTask {
                        stage: graph.stage_ref(id),
                        index,
                        rx,
                        group: g.clone(),
                        out_schema: node.schema.clone(),
                        routes: build_routes(graph, &node.downstream, &tx)?,
                        strategy: opts.group_strategy,
                        spill_dir: run_dir.join(format!("stage{}-w{index}", id.0)),
                        threshold: opts.max_in_mem_tuples,
                    });
                }
            }
            _ => {}
        }
    }
    drop(tx);

    // 3) fuentes y sinks salen del grafo: se consumen una sola vez
    for (id, routes) in source_routes {
        let stage = graph.stage_ref(id);
        let node = graph.node_mut(id)?;
        let StageKind::Source(slot) = &mut node.kind else {
            continue;
        };
        let source = slot
            .take()
            .ok_or_else(|| PipelineError::runtime(format!("la fuente {stage} ya fue consumida")))?;
        plan.sources.push(SourceTask {
            stage,
            source,
            schema: node.schema.clone(),
            routes,
        });
    }
    for (id, rx) in sink_rx {
        let stage = graph.stage_ref(id);
        let node = graph.node_mut(id)?;
        let StageKind::Sink(slot) = &mut node.kind else {
            continue;
        };
        let sink = slot
            .take()
            .ok_or_else(|| PipelineError::runtime(format!("el sink {stage} ya fue consumido")))?;
        plan.sinks.push(SinkTask { stage, sink, rx });
    }
    plan.sinks.sort_by_key(|s| s.stage.id);
    Ok(plan)
}

/* =========================
   Entrada
   ========================= */

/// Corre el flujo y completa `report`. Devuelve la primera falla.
pub(crate) async fn execute(
    graph: &mut Graph,
    opts: &RunOptions,
    report: &mut RunReport,
) -> Result<()> {
    let st = Arc::new(RunState::new(opts.record_error_policy));
    let run_dir = opts.spill_dir.join(report.run_id.to_string());

    let plan = match prepare(graph, opts, &run_dir) {
        Ok(plan) => plan,
        Err(e) => {
            report.finish(&st.counters, Some(e.to_string()));
            return Err(e);
        }
    };
    info!(
        "ejecución {}: {} fuentes, {} workers, {} sinks",
        report.run_id,
        plan.sources.len(),
        plan.workers.len(),
        plan.sinks.len()
    );

    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    let mut sink_handles: Vec<JoinHandle<(StageRef, Box<dyn Sink>)>> = Vec::new();
    for task in plan.sinks {
        let st = st.clone();
        sink_handles.push(spawn_blocking(move || run_sink(task, &st)));
    }
    for task in plan.workers {
        let st = st.clone();
        handles.push(spawn_blocking(move || run_worker(task, &st)));
    }
    for task in plan.sources {
        let st = st.clone();
        handles.push(spawn_blocking(move || run_source(task, &st)));
    }

    for h in handles {
        if let Err(e) = h.await {
            st.fail(PipelineError::runtime(format!("tarea terminó con error: {e}")));
        }
    }
    let mut sinks = Vec::new();
    for h in sink_handles {
        match h.await {
            Ok(pair) => sinks.push(pair),
            Err(e) => st.fail(PipelineError::runtime(format!("escritor terminó con error: {e}"))),
        }
    }

    // confirmar sólo si todo salió bien
    for (stage, mut sink) in sinks {
        if st.aborted() {
            debug!("abortando sink {stage}");
            sink.abort();
            continue;
        }
        if let Err(cause) = guarded(|| sink.complete()) {
            st.fail(PipelineError::SinkWriteFailure { stage, cause });
        }
    }

    if run_dir.exists() {
        if let Err(e) = fs::remove_dir_all(&run_dir) {
            debug!("no se pudo borrar {}: {e}", run_dir.display());
        }
    }

    let failure = st.take_failure();
    report.finish(&st.counters, failure.as_ref().map(|e| e.to_string()));
    info!(
        "ejecución {} terminada: {:?}, {} leídos, {} grupos, {} escritos",
        report.run_id, report.status, report.records_read, report.groups, report.records_written
    );
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
