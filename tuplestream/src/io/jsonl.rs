use anyhow::{bail, Context};
use std::{
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use super::{Sink, Source, TupleIter};
use crate::tuple::{Schema, Tuple};
use crate::value::Value;

/// Un objeto JSON por línea. El esquema lo declara quien crea la fuente;
/// las claves ausentes se leen como `Null` y las sobrantes se ignoran.
pub struct JsonlSource {
    path: PathBuf,
    schema: Arc<Schema>,
}

impl JsonlSource {
    pub fn new(path: impl Into<PathBuf>, fields: &[&str]) -> crate::Result<Self> {
        Ok(Self {
            path: path.into(),
            schema: Schema::shared(fields.iter().copied())?,
        })
    }
}

impl Source for JsonlSource {
    fn name(&self) -> String {
        format!("jsonl({})", self.path.display())
    }

    fn schema(&self) -> Arc<Schema> {
        self.schema.clone()
    }

    fn open(&mut self) -> anyhow::Result<TupleIter> {
        let file = File::open(&self.path)
            .with_context(|| format!("no se pudo abrir {}", self.path.display()))?;
        let schema = self.schema.clone();
        let path = self.path.clone();

        let lines = BufReader::new(file).lines().enumerate();
        let iter = lines.filter_map(move |(idx, line)| {
            let line = match line {
                Ok(l) => l,
                Err(e) => return Some(Err(e.into())),
            };
            if line.trim().is_empty() {
                return None;
            }
            Some(parse_object(&line, &schema).with_context(|| {
                format!("{} línea {}", path.display(), idx + 1)
            }))
        });
        Ok(Box::new(iter))
    }
}

fn parse_object(line: &str, schema: &Arc<Schema>) -> anyhow::Result<Tuple> {
    let rec: serde_json::Value = serde_json::from_str(line)?;
    let Some(obj) = rec.as_object() else {
        bail!("se esperaba un objeto JSON");
    };
    let values = schema
        .fields()
        .iter()
        .map(|f| obj.get(f).map(Value::from_json).unwrap_or(Value::Null))
        .collect();
    Ok(Tuple::new(schema.clone(), values)?)
}

/// Escribe cada tupla como objeto JSON en una línea.
/// El archivo se crea con la primera tupla (o al completar, si no hubo ninguna).
pub struct JsonlSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
        }
    }

    fn writer(&mut self) -> anyhow::Result<&mut BufWriter<File>> {
        if self.writer.is_none() {
            self.writer = Some(create_output(&self.path)?);
        }
        match self.writer.as_mut() {
            Some(w) => Ok(w),
            None => bail!("writer no inicializado"),
        }
    }
}

/// Crea el archivo de salida y sus carpetas intermedias.
pub(super) fn create_output(path: &Path) -> anyhow::Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("no se pudo crear {}", parent.display()))?;
        }
    }
    let file =
        File::create(path).with_context(|| format!("no se pudo crear {}", path.display()))?;
    Ok(BufWriter::new(file))
}

impl Sink for JsonlSink {
    fn name(&self) -> String {
        format!("jsonl({})", self.path.display())
    }

    fn accept(&mut self, tuple: Tuple) -> anyhow::Result<()> {
        let w = self.writer()?;
        serde_json::to_writer(&mut *w, &tuple.to_json())?;
        w.write_all(b"\n")?;
        Ok(())
    }

    fn complete(&mut self) -> anyhow::Result<()> {
        self.writer()?.flush()?;
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(w) = self.writer.as_mut() {
            let _ = w.flush();
        }
    }
}
