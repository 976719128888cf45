use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

use crate::error::{PipelineError, Result};
use crate::io::{Sink, Source};
use crate::stage::{Filter, Map, Reducer};
use crate::tuple::Schema;

/// Identificador de una etapa dentro de su flujo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageId(pub(crate) usize);

impl StageId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Etapa tal como aparece en los errores: id y descripción.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRef {
    pub id: StageId,
    pub label: String,
}

impl fmt::Display for StageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.id.0, self.label)
    }
}

/// group_by ya resuelto contra el esquema de entrada.
#[derive(Clone)]
pub(crate) struct GroupBy {
    pub key_fields: Vec<String>,
    pub key_positions: Vec<usize>,
    pub key_schema: Arc<Schema>,
    /// Esquema de las tuplas que llegan al grupo (los miembros).
    pub input_schema: Arc<Schema>,
    pub reducer: Reducer,
}

pub(crate) enum StageKind {
    /// Se vacía al ejecutar: la fuente se consume una sola vez.
    Source(Option<Box<dyn Source>>),
    Filter(Filter),
    Map(Map),
    GroupReduce(GroupBy),
    Sink(Option<Box<dyn Sink>>),
}

impl StageKind {
    pub fn op(&self) -> &'static str {
        match self {
            StageKind::Source(_) => "source",
            StageKind::Filter(_) => "filter",
            StageKind::Map(_) => "map",
            StageKind::GroupReduce(_) => "group_by",
            StageKind::Sink(_) => "sink",
        }
    }
}

pub(crate) struct Node {
    pub kind: StageKind,
    pub label: String,
    /// Esquema de salida (para un sink, el de entrada).
    pub schema: Arc<Schema>,
    pub downstream: Vec<StageId>,
}

/// Bosque de etapas: cada nodo cuelga de a lo sumo un padre y tiene
/// cualquier cantidad de hijos (ramas). Las raíces son fuentes.
#[derive(Default)]
pub(crate) struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    pub fn add_source(&mut self, kind: StageKind, label: String, schema: Arc<Schema>) -> StageId {
        let id = StageId(self.nodes.len());
        self.nodes.push(Node {
            kind,
            label,
            schema,
            downstream: Vec::new(),
        });
        id
    }

    pub fn attach(
        &mut self,
        parent: StageId,
        kind: StageKind,
        label: String,
        schema: Arc<Schema>,
    ) -> Result<StageId> {
        let parent_node = self.node(parent)?;
        if matches!(parent_node.kind, StageKind::Sink(_)) {
            return Err(PipelineError::NoOutputStream {
                stage: self.stage_ref(parent),
            });
        }
        let id = StageId(self.nodes.len());
        self.nodes.push(Node {
            kind,
            label,
            schema,
            downstream: Vec::new(),
        });
        self.nodes[parent.0].downstream.push(id);
        Ok(id)
    }

    pub fn node(&self, id: StageId) -> Result<&Node> {
        self.nodes.get(id.0).ok_or(PipelineError::UnknownStage(id.0))
    }

    pub fn node_mut(&mut self, id: StageId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.0)
            .ok_or(PipelineError::UnknownStage(id.0))
    }

    pub fn ids(&self) -> impl Iterator<Item = StageId> {
        (0..self.nodes.len()).map(StageId)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn stage_ref(&self, id: StageId) -> StageRef {
        StageRef {
            id,
            label: self
                .nodes
                .get(id.0)
                .map(|n| n.label.clone())
                .unwrap_or_default(),
        }
    }

    /// Validaciones previas a la ejecución: al menos una fuente y ninguna
    /// rama sin sink.
    pub fn check_runnable(&self) -> Result<()> {
        if !self
            .nodes
            .iter()
            .any(|n| matches!(n.kind, StageKind::Source(_)))
        {
            return Err(PipelineError::NoSource);
        }
        for id in self.ids() {
            let node = &self.nodes[id.0];
            if node.downstream.is_empty() && !matches!(node.kind, StageKind::Sink(_)) {
                return Err(PipelineError::DanglingStage {
                    stage: self.stage_ref(id),
                });
            }
        }
        Ok(())
    }

    pub fn plan(&self) -> Plan {
        let nodes = self
            .ids()
            .map(|id| {
                let n = &self.nodes[id.0];
                PlanNode {
                    id: id.0,
                    op: n.kind.op().to_string(),
                    label: n.label.clone(),
                    fields: n.schema.fields().to_vec(),
                    key: match &n.kind {
                        StageKind::GroupReduce(g) => Some(g.key_fields.clone()),
                        _ => None,
                    },
                }
            })
            .collect();
        let edges = self
            .nodes
            .iter()
            .enumerate()
            .flat_map(|(from, n)| n.downstream.iter().map(move |to| (from, to.0)))
            .collect();
        Plan { nodes, edges }
    }
}

/// Vista serializable del flujo, para mostrarlo (por ejemplo `--explain`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub nodes: Vec<PlanNode>,
    pub edges: Vec<(usize, usize)>, // (from, to)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: usize,
    pub op: String, // "source", "filter", "map", "group_by", "sink"
    pub label: String,
    /// Campos de salida del nodo.
    pub fields: Vec<String>,
    /// Campos clave, sólo en nodos group_by.
    pub key: Option<Vec<String>>,
}
