use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard,
};

use super::{Sink, Source, TupleIter};
use crate::error::Result;
use crate::tuple::{Schema, Tuple};
use crate::value::Value;

/// Filas en memoria. Útil para tests y flujos pequeños.
pub struct VecSource {
    schema: Arc<Schema>,
    rows: Vec<Tuple>,
}

impl VecSource {
    /// Valida que cada fila tenga un valor por campo.
    pub fn new(fields: &[&str], rows: Vec<Vec<Value>>) -> Result<Self> {
        let schema = Schema::shared(fields.iter().copied())?;
        let rows = rows
            .into_iter()
            .map(|r| Tuple::new(schema.clone(), r))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { schema, rows })
    }
}

impl Source for VecSource {
    fn name(&self) -> String {
        format!("memoria({} filas)", self.rows.len())
    }

    fn schema(&self) -> Arc<Schema> {
        self.schema.clone()
    }

    fn open(&mut self) -> anyhow::Result<TupleIter> {
        let rows = std::mem::take(&mut self.rows);
        Ok(Box::new(rows.into_iter().map(Ok)))
    }
}

#[derive(Default)]
struct Collected {
    tuples: Mutex<Vec<Tuple>>,
    completed: AtomicBool,
    aborted: AtomicBool,
}

impl Collected {
    fn lock(&self) -> MutexGuard<'_, Vec<Tuple>> {
        // un panic dentro del lock no invalida las tuplas ya guardadas
        self.tuples.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Junta las tuplas en memoria. El [`CollectHandle`] sigue siendo
/// accesible después de que el flujo se queda con el sink.
#[derive(Default)]
pub struct CollectSink {
    shared: Arc<Collected>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> CollectHandle {
        CollectHandle {
            shared: self.shared.clone(),
        }
    }
}

impl Sink for CollectSink {
    fn name(&self) -> String {
        "collect".to_string()
    }

    fn accept(&mut self, tuple: Tuple) -> anyhow::Result<()> {
        self.shared.lock().push(tuple);
        Ok(())
    }

    fn complete(&mut self) -> anyhow::Result<()> {
        self.shared.completed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn abort(&mut self) {
        self.shared.aborted.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct CollectHandle {
    shared: Arc<Collected>,
}

impl CollectHandle {
    /// Copia de lo recibido hasta ahora, en orden de llegada al sink.
    pub fn tuples(&self) -> Vec<Tuple> {
        self.shared.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_completed(&self) -> bool {
        self.shared.completed.load(Ordering::SeqCst)
    }

    pub fn was_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::SeqCst)
    }
}
