//! Taxonomía de errores del motor.
//!
//! - Errores de construcción: cableado inválido, detectado antes de leer datos.
//! - Errores de acceso a tuplas: campos inexistentes, índices, tipos.
//! - Errores de ejecución: fallos por registro, fuentes y sinks.

use thiserror::Error;

use crate::graph::StageRef;
use crate::pipeline::FlowState;

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /* ---------- construcción ---------- */
    /// Un campo referenciado no existe en el esquema de entrada.
    #[error("campo `{field}` no existe en el esquema [{schema}]")]
    FieldNotFound { field: String, schema: String },

    /// Nombres de campo repetidos en un esquema.
    #[error("campo `{0}` duplicado en el esquema")]
    DuplicateField(String),

    /// group_by sin campos clave.
    #[error("group_by necesita al menos un campo clave")]
    EmptyKey,

    /// Opciones de ejecución fuera de rango.
    #[error("configuración inválida: {0}")]
    InvalidConfig(String),

    /// Una rama del flujo termina sin sink.
    #[error("la etapa {stage} no termina en ningún sink")]
    DanglingStage { stage: StageRef },

    #[error("el flujo no tiene ninguna fuente")]
    NoSource,

    #[error("la etapa #{0} no existe en este flujo")]
    UnknownStage(usize),

    /// No se puede conectar nada a la salida de un sink.
    #[error("la etapa {stage} es un sink y no produce tuplas")]
    NoOutputStream { stage: StageRef },

    /// El flujo ya se ejecutó (o se está ejecutando).
    #[error("el flujo ya no admite cambios ni ejecuciones (estado {state:?})")]
    AlreadyRun { state: FlowState },

    /* ---------- acceso a tuplas ---------- */
    #[error("índice {index} fuera de rango (la tupla tiene {len} campos)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("campo `{field}`: se esperaba {expected}, hay {found}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    /// Cantidad de valores distinta de la cantidad de campos declarados.
    #[error("se declararon {expected} campos pero llegaron {found} valores")]
    SchemaArityMismatch { expected: usize, found: usize },

    /* ---------- ejecución ---------- */
    /// Una fila del reducer no respeta los campos declarados. Se descarta
    /// esa fila; la ejecución sigue.
    #[error("reducer de {stage} emitió {found} valores para la clave {key}, declara {expected}")]
    ReducerArityMismatch {
        stage: StageRef,
        key: String,
        expected: usize,
        found: usize,
    },

    /// Fallo de la lógica de usuario sobre un registro (o grupo).
    #[error("fallo en {stage} procesando {record}: {cause:#}")]
    Record {
        stage: StageRef,
        record: String,
        #[source]
        cause: anyhow::Error,
    },

    #[error("fallo leyendo la fuente {stage}: {cause:#}")]
    SourceReadFailure {
        stage: StageRef,
        #[source]
        cause: anyhow::Error,
    },

    #[error("fallo escribiendo en el sink {stage}: {cause:#}")]
    SinkWriteFailure {
        stage: StageRef,
        #[source]
        cause: anyhow::Error,
    },

    /// Fallos del propio motor (spill a disco, tareas caídas).
    #[error("error del runtime: {0}")]
    Runtime(String),
}

impl PipelineError {
    /// Verdadero para errores detectados al construir el flujo.
    pub fn is_construction(&self) -> bool {
        matches!(
            self,
            PipelineError::FieldNotFound { .. }
                | PipelineError::DuplicateField(_)
                | PipelineError::EmptyKey
                | PipelineError::InvalidConfig(_)
                | PipelineError::DanglingStage { .. }
                | PipelineError::NoSource
                | PipelineError::UnknownStage(_)
                | PipelineError::NoOutputStream { .. }
        )
    }

    /// Etapa a la que se atribuye el fallo, si se conoce.
    pub fn stage(&self) -> Option<&StageRef> {
        match self {
            PipelineError::DanglingStage { stage }
            | PipelineError::NoOutputStream { stage }
            | PipelineError::ReducerArityMismatch { stage, .. }
            | PipelineError::Record { stage, .. }
            | PipelineError::SourceReadFailure { stage, .. }
            | PipelineError::SinkWriteFailure { stage, .. } => Some(stage),
            _ => None,
        }
    }

    pub(crate) fn runtime(msg: impl std::fmt::Display) -> Self {
        PipelineError::Runtime(msg.to_string())
    }
}
