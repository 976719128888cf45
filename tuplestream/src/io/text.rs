use anyhow::{anyhow, bail, Context};
use glob::glob;
use std::{
    collections::VecDeque,
    fs::{self, File},
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    sync::Arc,
};

use super::{Source, TupleIter};
use crate::tuple::{Schema, Tuple};
use crate::value::Value;

/// Una tupla `(offset, line)` por línea de texto.
///
/// `offset` es la posición en bytes del comienzo de la línea dentro de su
/// archivo. La ruta puede ser un archivo, un directorio (se leen sus
/// archivos, salvo los ocultos o que empiezan con `_`) o un patrón glob
/// como `data/*.txt`. Los archivos se leen en orden alfabético.
pub struct TextLineSource {
    path: String,
    schema: Arc<Schema>,
}

impl TextLineSource {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            schema: text_schema(),
        }
    }
}

fn text_schema() -> Arc<Schema> {
    Arc::new(Schema::new(["offset", "line"]).expect("campos fijos sin duplicados"))
}

impl Source for TextLineSource {
    fn name(&self) -> String {
        format!("text_line({})", self.path)
    }

    fn schema(&self) -> Arc<Schema> {
        self.schema.clone()
    }

    fn open(&mut self) -> anyhow::Result<TupleIter> {
        let files = resolve_inputs(&self.path)?;
        Ok(Box::new(TextLines {
            files: files.into(),
            current: None,
            offset: 0,
            schema: self.schema.clone(),
        }))
    }
}

fn is_glob(path: &str) -> bool {
    path.contains(['*', '?', '['])
}

fn is_visible(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| !n.starts_with('.') && !n.starts_with('_'))
        .unwrap_or(false)
}

/// Lista de archivos a leer para `path`.
fn resolve_inputs(path: &str) -> anyhow::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = if is_glob(path) {
        glob(path)
            .with_context(|| format!("patrón inválido: {path}"))?
            .filter_map(|entry| entry.ok())
            .filter(|p| p.is_file())
            .collect()
    } else {
        let p = Path::new(path);
        if p.is_dir() {
            fs::read_dir(p)
                .with_context(|| format!("no se pudo listar {path}"))?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|p| p.is_file() && is_visible(p))
                .collect()
        } else if p.is_file() {
            vec![p.to_path_buf()]
        } else {
            bail!("no existe la entrada {path}");
        }
    };
    files.sort();
    Ok(files)
}

struct TextLines {
    files: VecDeque<PathBuf>,
    current: Option<(PathBuf, BufReader<File>)>,
    offset: u64,
    schema: Arc<Schema>,
}

impl TextLines {
    fn read_line(&mut self) -> anyhow::Result<Option<Tuple>> {
        loop {
            if self.current.is_none() {
                let Some(path) = self.files.pop_front() else {
                    return Ok(None);
                };
                let file =
                    File::open(&path).with_context(|| format!("no se pudo abrir {}", path.display()))?;
                self.current = Some((path, BufReader::new(file)));
                self.offset = 0;
            }
            let Some((path, reader)) = self.current.as_mut() else {
                return Err(anyhow!("lector de texto sin archivo abierto"));
            };

            let mut buf = String::new();
            let read = reader
                .read_line(&mut buf)
                .with_context(|| format!("error leyendo {}", path.display()))?;
            if read == 0 {
                self.current = None;
                continue;
            }

            let start = self.offset;
            self.offset += read as u64;
            let line = buf.trim_end_matches(['\n', '\r']).to_string();
            return Ok(Some(Tuple::from_parts(
                self.schema.clone(),
                vec![Value::Int(start as i64), Value::Str(line)],
            )));
        }
    }
}

impl Iterator for TextLines {
    type Item = anyhow::Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_line() {
            Ok(Some(t)) => Some(Ok(t)),
            Ok(None) => None,
            Err(e) => {
                // tras un error no seguimos leyendo
                self.files.clear();
                self.current = None;
                Some(Err(e))
            }
        }
    }
}
