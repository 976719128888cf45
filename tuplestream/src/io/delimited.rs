use anyhow::{bail, Context};
use std::{
    fs::File,
    io::BufWriter,
    path::PathBuf,
    sync::Arc,
};

use super::jsonl::create_output;
use super::{Sink, Source, TupleIter};
use crate::tuple::{Schema, Tuple};
use crate::value::Value;

/// CSV con encabezado. El esquema sale de la primera línea, que se lee al
/// construir la fuente; todos los valores llegan como texto.
pub struct CsvSource {
    path: PathBuf,
    schema: Arc<Schema>,
}

impl CsvSource {
    pub fn open_path(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&path)
            .with_context(|| format!("no se pudo abrir {}", path.display()))?;

        // limpia BOM por si viene de Excel/Windows
        let headers: Vec<String> = rdr
            .headers()
            .with_context(|| format!("no se pudo leer el encabezado de {}", path.display()))?
            .iter()
            .map(|h| h.trim().trim_start_matches('\u{feff}').to_string())
            .collect();
        if headers.iter().all(|h| h.is_empty()) {
            bail!("{} no tiene encabezado", path.display());
        }

        Ok(Self {
            schema: Schema::shared(headers)?,
            path,
        })
    }
}

impl Source for CsvSource {
    fn name(&self) -> String {
        format!("csv({})", self.path.display())
    }

    fn schema(&self) -> Arc<Schema> {
        self.schema.clone()
    }

    fn open(&mut self) -> anyhow::Result<TupleIter> {
        let rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&self.path)
            .with_context(|| format!("no se pudo abrir {}", self.path.display()))?;
        let schema = self.schema.clone();

        let iter = rdr.into_records().filter_map(move |rec| {
            let rec = match rec {
                Ok(r) => r,
                Err(e) => return Some(Err(e.into())),
            };
            if rec.iter().all(|c| c.trim().is_empty()) {
                return None;
            }
            // columnas faltantes quedan vacías, las sobrantes se ignoran
            let values = (0..schema.len())
                .map(|idx| Value::from(rec.get(idx).unwrap_or("").trim()))
                .collect();
            Some(Ok(Tuple::from_parts(schema.clone(), values)))
        });
        Ok(Box::new(iter))
    }
}

/// Valores separados por tabulador, una tupla por línea. `Null` se
/// escribe como campo vacío.
pub struct TsvSink {
    path: PathBuf,
    header: bool,
    writer: Option<csv::Writer<BufWriter<File>>>,
}

impl TsvSink {
    pub fn create(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            header: false,
            writer: None,
        }
    }

    /// Escribe los nombres de campo como primera línea.
    pub fn with_header(mut self, header: bool) -> Self {
        self.header = header;
        self
    }

    fn open_writer(&mut self, fields: Option<&[String]>) -> anyhow::Result<()> {
        if self.writer.is_some() {
            return Ok(());
        }
        let mut w = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(create_output(&self.path)?);
        if let (true, Some(fields)) = (self.header, fields) {
            w.write_record(fields)?;
        }
        self.writer = Some(w);
        Ok(())
    }
}

impl Sink for TsvSink {
    fn name(&self) -> String {
        format!("tsv({})", self.path.display())
    }

    fn accept(&mut self, tuple: Tuple) -> anyhow::Result<()> {
        self.open_writer(Some(tuple.schema().fields()))?;
        let Some(w) = self.writer.as_mut() else {
            bail!("writer no inicializado");
        };
        w.write_record(tuple.values().iter().map(|v| v.to_string()))?;
        Ok(())
    }

    fn complete(&mut self) -> anyhow::Result<()> {
        self.open_writer(None)?;
        if let Some(w) = self.writer.as_mut() {
            w.flush()?;
        }
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(w) = self.writer.as_mut() {
            let _ = w.flush();
        }
    }
}
