//! Colaboradores externos: de dónde salen las tuplas y a dónde van.
//!
//! El motor sólo necesita un iterador de tuplas de entrada ([`Source`]) y
//! un consumidor de tuplas de salida ([`Sink`]). Se incluyen algunas
//! implementaciones concretas (texto, JSONL, CSV/TSV, memoria).

use std::sync::Arc;

use crate::tuple::{Schema, Tuple};

mod delimited;
mod jsonl;
mod memory;
mod text;

pub use delimited::{CsvSource, TsvSink};
pub use jsonl::{JsonlSink, JsonlSource};
pub use memory::{CollectHandle, CollectSink, VecSource};
pub use text::TextLineSource;

/// Secuencia perezosa de tuplas. Un `Err` hace fallar la ejecución.
pub type TupleIter = Box<dyn Iterator<Item = anyhow::Result<Tuple>> + Send>;

pub trait Source: Send {
    /// Descripción para logs y errores.
    fn name(&self) -> String;

    /// Esquema de todas las tuplas que produce.
    fn schema(&self) -> Arc<Schema>;

    /// Se llama una única vez por ejecución.
    fn open(&mut self) -> anyhow::Result<TupleIter>;
}

/// Destino de las tuplas finales.
///
/// Un único escritor por sink serializa las tuplas de todos los workers.
/// `complete` se llama exactamente una vez y sólo si toda la ejecución
/// terminó bien; si falla se llama `abort` en su lugar. Lo que el sink
/// ya haya escrito antes de un fallo puede quedar visible (los sinks de
/// archivo dejan lo ya volcado), pero la ejecución se reporta como fallida.
///
/// Con varios sinks, `complete` se llama en orden de id de etapa. Si el
/// `complete` de uno falla, los anteriores ya quedaron confirmados y la
/// ejecución igual termina como fallida; los siguientes reciben `abort`.
pub trait Sink: Send {
    fn name(&self) -> String;

    /// Campos que el sink espera, si le importan. Se validan al cablear.
    fn expects(&self) -> Option<Vec<String>> {
        None
    }

    fn accept(&mut self, tuple: Tuple) -> anyhow::Result<()>;

    fn complete(&mut self) -> anyhow::Result<()>;

    fn abort(&mut self) {}
}
