//! Operadores de usuario: filtros, maps y reducers sobre grupos.
//!
//! Cada operador guarda su función detrás de un `Arc`, de modo que el
//! executor puede clonarlo dentro de cada tarea que procesa registros
//! (la fuente antes del primer group_by, cada worker después).

use anyhow::anyhow;
use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use crate::config::FilterErrorPolicy;
use crate::error::{PipelineError, Result};
use crate::grouper::GroupMembers;
use crate::tuple::{Schema, Tuple};
use crate::value::Value;

/// Ejecuta lógica de usuario convirtiendo un panic en error.
pub(crate) fn guarded<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(res) => res,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic sin mensaje".to_string());
            Err(anyhow!("panic en función de usuario: {msg}"))
        }
    }
}

/* =========================
   filter
   ========================= */

pub type PredicateFn = dyn Fn(&Tuple, &[Value]) -> anyhow::Result<bool> + Send + Sync;

/// Resultado de evaluar un filtro sobre una tupla.
pub(crate) enum FilterOutcome {
    Keep,
    Drop,
    /// El predicado falló y la política es `Exclude`.
    Excluded(anyhow::Error),
    /// El predicado falló y la política es `Fail`.
    Failed(anyhow::Error),
}

/// Deja pasar las tuplas para las que el predicado devuelve `Ok(true)`.
///
/// Los argumentos se fijan al construir el flujo y se pasan en cada
/// invocación. Un predicado que devuelve `Err` (o hace panic) cuenta,
/// por defecto, como `false`: ver [`FilterErrorPolicy`].
#[derive(Clone)]
pub struct Filter {
    name: String,
    predicate: Arc<PredicateFn>,
    args: Vec<Value>,
    reads: Vec<String>,
    on_error: FilterErrorPolicy,
}

impl Filter {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Tuple, &[Value]) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
            args: Vec::new(),
            reads: Vec::new(),
            on_error: FilterErrorPolicy::default(),
        }
    }

    pub fn with_args<I, V>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Campos que lee el predicado; se verifican al cablear.
    pub fn reads(mut self, fields: &[&str]) -> Self {
        self.reads = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn on_error(mut self, policy: FilterErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub(crate) fn read_fields(&self) -> &[String] {
        &self.reads
    }

    pub(crate) fn evaluate(&self, t: &Tuple) -> FilterOutcome {
        match guarded(|| (self.predicate)(t, &self.args)) {
            Ok(true) => FilterOutcome::Keep,
            Ok(false) => FilterOutcome::Drop,
            Err(e) => match self.on_error {
                FilterErrorPolicy::Exclude => FilterOutcome::Excluded(e),
                FilterErrorPolicy::Fail => FilterOutcome::Failed(e),
            },
        }
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("on_error", &self.on_error)
            .finish()
    }
}

/* =========================
   map
   ========================= */

pub type TransformFn = dyn Fn(&Tuple) -> anyhow::Result<Vec<Value>> + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    /// La salida tiene sólo los campos declarados.
    Replace,
    /// La salida conserva los campos de entrada y agrega los declarados.
    Add,
}

/// Una tupla de salida por cada tupla de entrada.
#[derive(Clone)]
pub struct Map {
    name: String,
    fields: Vec<String>,
    transform: Arc<TransformFn>,
    mode: MapMode,
    reads: Vec<String>,
}

impl Map {
    pub fn replace<F>(fields: &[&str], transform: F) -> Self
    where
        F: Fn(&Tuple) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    {
        Self::with_mode(MapMode::Replace, fields, transform)
    }

    pub fn add<F>(fields: &[&str], transform: F) -> Self
    where
        F: Fn(&Tuple) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    {
        Self::with_mode(MapMode::Add, fields, transform)
    }

    fn with_mode<F>(mode: MapMode, fields: &[&str], transform: F) -> Self
    where
        F: Fn(&Tuple) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    {
        let prefix = match mode {
            MapMode::Replace => "map_replace",
            MapMode::Add => "map_add",
        };
        Self {
            name: format!("{prefix}({})", fields.join(", ")),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            transform: Arc::new(transform),
            mode,
            reads: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn reads(mut self, fields: &[&str]) -> Self {
        self.reads = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn mode(&self) -> MapMode {
        self.mode
    }

    pub(crate) fn read_fields(&self) -> &[String] {
        &self.reads
    }

    /// Esquema de salida dado el de entrada.
    pub(crate) fn output_schema(&self, input: &Schema) -> Result<Schema> {
        let declared = Schema::new(self.fields.iter().cloned())?;
        match self.mode {
            MapMode::Replace => Ok(declared),
            MapMode::Add => input.concat(&declared),
        }
    }

    /// Aplica la transformación. La aridad se valida en cada registro:
    /// un desajuste es `SchemaArityMismatch`.
    pub(crate) fn apply(&self, t: &Tuple, out_schema: &Arc<Schema>) -> anyhow::Result<Tuple> {
        let produced = guarded(|| (self.transform)(t))?;
        if produced.len() != self.fields.len() {
            return Err(PipelineError::SchemaArityMismatch {
                expected: self.fields.len(),
                found: produced.len(),
            }
            .into());
        }
        let values = match self.mode {
            MapMode::Replace => produced,
            MapMode::Add => {
                let mut v = Vec::with_capacity(t.len() + produced.len());
                v.extend_from_slice(t.values());
                v.extend(produced);
                v
            }
        };
        Ok(Tuple::from_parts(out_schema.clone(), values))
    }
}

impl fmt::Debug for Map {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Map")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .field("mode", &self.mode)
            .finish()
    }
}

/* =========================
   reduce (buffer sobre grupos)
   ========================= */

/// Salida perezosa de un reducer: cero o más filas. El executor la
/// consume de a una, reenviando cada fila antes de pedir la siguiente.
pub type ReduceOutput<'a> = Box<dyn Iterator<Item = anyhow::Result<Vec<Value>>> + 'a>;

/// Lógica de reducción sobre un grupo.
///
/// Recibe la clave (tupla proyectada sobre los campos clave) y los
/// miembros del grupo como iterador de una sola pasada.
pub trait ReduceFn: Send + Sync {
    fn reduce<'a>(&self, key: &'a Tuple, members: GroupMembers<'a>) -> ReduceOutput<'a>;
}

impl<F> ReduceFn for F
where
    F: for<'a> Fn(&'a Tuple, GroupMembers<'a>) -> ReduceOutput<'a> + Send + Sync,
{
    fn reduce<'a>(&self, key: &'a Tuple, members: GroupMembers<'a>) -> ReduceOutput<'a> {
        self(key, members)
    }
}

/// Un reducer junto con los campos que promete emitir.
#[derive(Clone)]
pub struct Reducer {
    name: String,
    produces: Vec<String>,
    func: Arc<dyn ReduceFn>,
}

impl Reducer {
    pub fn new<F>(produces: &[&str], func: F) -> Self
    where
        F: for<'a> Fn(&'a Tuple, GroupMembers<'a>) -> ReduceOutput<'a> + Send + Sync + 'static,
    {
        Self::from_fn(produces, func)
    }

    /// Para tipos propios que implementan [`ReduceFn`].
    pub fn from_fn<R: ReduceFn + 'static>(produces: &[&str], func: R) -> Self {
        Self {
            name: "reducer".to_string(),
            produces: produces.iter().map(|f| f.to_string()).collect(),
            func: Arc::new(func),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn produces(&self) -> &[String] {
        &self.produces
    }

    pub(crate) fn func(&self) -> &dyn ReduceFn {
        self.func.as_ref()
    }
}

impl fmt::Debug for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reducer")
            .field("name", &self.name)
            .field("produces", &self.produces)
            .finish()
    }
}

/// Una sola fila.
pub fn emit_one<'a>(row: Vec<Value>) -> ReduceOutput<'a> {
    Box::new(std::iter::once(Ok(row)))
}

/// Filas ya calculadas.
pub fn emit_all<'a>(rows: Vec<Vec<Value>>) -> ReduceOutput<'a> {
    Box::new(rows.into_iter().map(Ok))
}

/// Ninguna fila para este grupo.
pub fn emit_none<'a>() -> ReduceOutput<'a> {
    Box::new(std::iter::empty())
}
