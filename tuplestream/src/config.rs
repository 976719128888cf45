use serde::{Deserialize, Serialize};
use std::{env, path::PathBuf, str::FromStr};

use crate::error::{PipelineError, Result};

const DEFAULT_NUM_REDUCERS: usize = 1;
const DEFAULT_MAX_IN_MEM_TUPLES: usize = 100_000;
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Cómo agrupa cada worker las tuplas de su partición.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStrategy {
    /// Ordena por clave; por encima de `max_in_mem_tuples` vuelca runs
    /// ordenados a disco y al final los mezcla. Memoria acotada.
    #[default]
    Sort,
    /// Acumula cada grupo completo en un mapa en memoria. Sin spill.
    Hash,
}

impl FromStr for GroupStrategy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sort" => Ok(GroupStrategy::Sort),
            "hash" => Ok(GroupStrategy::Hash),
            other => Err(PipelineError::InvalidConfig(format!(
                "estrategia de agrupación desconocida: {other}"
            ))),
        }
    }
}

/// Qué hacer cuando un map o un reducer falla sobre un registro.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordErrorPolicy {
    /// El fallo aborta toda la ejecución.
    #[default]
    Abort,
    /// Se descarta el registro (o grupo), se loguea y se cuenta.
    DropAndLog,
}

impl FromStr for RecordErrorPolicy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "abort" => Ok(RecordErrorPolicy::Abort),
            "drop_and_log" | "drop" => Ok(RecordErrorPolicy::DropAndLog),
            other => Err(PipelineError::InvalidConfig(format!(
                "política de errores desconocida: {other}"
            ))),
        }
    }
}

/// Qué hacer cuando el predicado de un filtro falla.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterErrorPolicy {
    /// Un predicado que falla cuenta como `false`: el registro se excluye.
    #[default]
    Exclude,
    /// El fallo del predicado es un error de registro, como en un map.
    Fail,
}

/// Opciones de una ejecución.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Workers (particiones) por cada etapa group_by. Mínimo 1.
    pub num_reducers: usize,
    pub group_strategy: GroupStrategy,
    /// Umbral de tuplas en memoria por worker antes de volcar un run a disco.
    pub max_in_mem_tuples: usize,
    /// Directorio base para los runs volcados.
    pub spill_dir: PathBuf,
    /// Capacidad de los canales entre tareas (backpressure).
    pub channel_capacity: usize,
    pub record_error_policy: RecordErrorPolicy,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            num_reducers: DEFAULT_NUM_REDUCERS,
            group_strategy: GroupStrategy::default(),
            max_in_mem_tuples: DEFAULT_MAX_IN_MEM_TUPLES,
            spill_dir: env::temp_dir().join("tuplestream-spill"),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            record_error_policy: RecordErrorPolicy::default(),
        }
    }
}

impl RunOptions {
    pub fn with_reducers(num_reducers: usize) -> Self {
        Self {
            num_reducers,
            ..Self::default()
        }
    }

    /// Valores por defecto sobreescritos con variables de entorno:
    /// `NUM_REDUCERS`, `GROUP_STRATEGY`, `MAX_IN_MEM_TUPLES`, `SPILL_DIR`,
    /// `CHANNEL_CAPACITY`, `RECORD_ERROR_POLICY`.
    pub fn from_env() -> Result<Self> {
        let mut opts = Self::default();
        if let Some(n) = env_parse::<usize>("NUM_REDUCERS")? {
            opts.num_reducers = n;
        }
        if let Some(s) = env_parse::<GroupStrategy>("GROUP_STRATEGY")? {
            opts.group_strategy = s;
        }
        if let Some(n) = env_parse::<usize>("MAX_IN_MEM_TUPLES")? {
            opts.max_in_mem_tuples = n;
        }
        if let Ok(dir) = env::var("SPILL_DIR") {
            opts.spill_dir = PathBuf::from(dir);
        }
        if let Some(n) = env_parse::<usize>("CHANNEL_CAPACITY")? {
            opts.channel_capacity = n;
        }
        if let Some(p) = env_parse::<RecordErrorPolicy>("RECORD_ERROR_POLICY")? {
            opts.record_error_policy = p;
        }
        Ok(opts)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_reducers == 0 {
            return Err(PipelineError::InvalidConfig(
                "num_reducers debe ser >= 1".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(PipelineError::InvalidConfig(
                "channel_capacity debe ser >= 1".to_string(),
            ));
        }
        if self.max_in_mem_tuples == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_in_mem_tuples debe ser >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            PipelineError::InvalidConfig(format!("{name}={raw}: {e}"))
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_son_validos() {
        let opts = RunOptions::default();
        assert_eq!(opts.num_reducers, 1);
        assert_eq!(opts.group_strategy, GroupStrategy::Sort);
        assert_eq!(opts.record_error_policy, RecordErrorPolicy::Abort);
        opts.validate().unwrap();
    }

    #[test]
    fn cero_reducers_es_invalido() {
        let err = RunOptions::with_reducers(0).validate().unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn from_env_respeta_variables() {
        env::set_var("MAX_IN_MEM_TUPLES", "1234");
        env::set_var("GROUP_STRATEGY", "hash");
        let opts = RunOptions::from_env().unwrap();
        env::remove_var("MAX_IN_MEM_TUPLES");
        env::remove_var("GROUP_STRATEGY");

        assert_eq!(opts.max_in_mem_tuples, 1234);
        assert_eq!(opts.group_strategy, GroupStrategy::Hash);
    }

    #[test]
    fn parseo_de_politicas() {
        assert_eq!(
            "drop-and-log".parse::<RecordErrorPolicy>().unwrap(),
            RecordErrorPolicy::DropAndLog
        );
        assert!("nunca".parse::<RecordErrorPolicy>().is_err());
        assert!("bucket".parse::<GroupStrategy>().is_err());
    }
}
