//! Particionado y agrupación por clave dentro de cada worker.
//!
//! Cada tupla va al worker `hash(clave) % W`. Dentro del worker el
//! [`Grouper`] junta toda la partición y la entrega como un flujo donde
//! las tuplas con la misma clave quedan contiguas y en orden de llegada:
//!
//! - `Sort`: ordena por `(clave, secuencia)`; si el buffer supera el umbral
//!   vuelca un run ordenado a disco (JSONL) y al final mezcla todos los runs.
//! - `Hash`: acumula grupos completos en memoria, en orden de primera aparición.
//!
//! El [`GroupCursor`] recorre ese flujo grupo por grupo.

use serde::{Deserialize, Serialize};
use std::{
    cmp::{Ordering, Reverse},
    collections::{hash_map::DefaultHasher, BinaryHeap, HashMap},
    fs::{self, File},
    hash::{Hash, Hasher},
    io::{self, BufRead, BufReader, BufWriter, Lines, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::debug;

use crate::config::GroupStrategy;
use crate::tuple::{Schema, Tuple};
use crate::value::Value;

/// Runs abiertos a la vez en una mezcla. Con más runs se mezclan por
/// tandas en runs intermedios, así los descriptores abiertos no crecen con
/// el tamaño de la partición.
const MERGE_FAN_IN: usize = 64;

/// Worker al que va una clave. Determinista entre ejecuciones.
pub fn partition_for(key: &[Value], num_partitions: usize) -> usize {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() % num_partitions.max(1) as u64) as usize
}

/// Tupla de la partición junto con su clave y su orden de llegada.
/// Es también el formato de cada línea de un run volcado a disco.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Keyed {
    #[serde(rename = "k")]
    pub key: Vec<Value>,
    #[serde(rename = "s")]
    pub seq: u64,
    #[serde(rename = "v")]
    pub values: Vec<Value>,
}

impl Keyed {
    fn sort_key(&self) -> (&[Value], u64) {
        (&self.key, self.seq)
    }
}

/// Flujo con claves contiguas; lo que consume el cursor.
pub(crate) type KeyedStream = Box<dyn Iterator<Item = io::Result<Keyed>> + Send>;

/* =========================
   Grouper
   ========================= */

/// Buffer de una partición, según la estrategia elegida.
pub(crate) enum Grouper {
    Sort(SortBuffer),
    Hash(HashBuffer),
}

impl Grouper {
    /// `spill_dir` es exclusivo de este worker.
    pub fn new(strategy: GroupStrategy, spill_dir: PathBuf, threshold: usize) -> Self {
        match strategy {
            GroupStrategy::Sort => {
                Grouper::Sort(SortBuffer::new(spill_dir, threshold, MERGE_FAN_IN))
            }
            GroupStrategy::Hash => Grouper::Hash(HashBuffer::default()),
        }
    }

    pub fn push(&mut self, key: Vec<Value>, values: Vec<Value>) -> io::Result<()> {
        match self {
            Grouper::Sort(b) => b.push(key, values),
            Grouper::Hash(b) => {
                b.push(key, values);
                Ok(())
            }
        }
    }

    /// Runs volcados a disco hasta ahora.
    pub fn spilled_runs(&self) -> usize {
        match self {
            Grouper::Sort(b) => b.spilled,
            Grouper::Hash(_) => 0,
        }
    }

    pub fn finish(self) -> io::Result<KeyedStream> {
        match self {
            Grouper::Sort(b) => b.finish(),
            Grouper::Hash(b) => Ok(b.finish()),
        }
    }
}

/// Borra el directorio de spill al soltarse.
struct SpillDir {
    path: PathBuf,
}

impl Drop for SpillDir {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = fs::remove_dir_all(&self.path) {
                debug!("no se pudo borrar el spill {}: {e}", self.path.display());
            }
        }
    }
}

/// Buffer ordenado con spill a disco cuando crece demasiado.
pub(crate) struct SortBuffer {
    buf: Vec<Keyed>,
    runs: Vec<PathBuf>,
    dir: SpillDir,
    threshold: usize,
    fan_in: usize,
    next_seq: u64,
    /// Runs volcados desde el buffer (no cuenta los intermedios).
    spilled: usize,
    next_file: usize,
}

impl SortBuffer {
    fn new(dir: PathBuf, threshold: usize, fan_in: usize) -> Self {
        Self {
            buf: Vec::new(),
            runs: Vec::new(),
            dir: SpillDir { path: dir },
            threshold: threshold.max(1),
            fan_in: fan_in.max(2),
            next_seq: 0,
            spilled: 0,
            next_file: 0,
        }
    }

    fn next_run_path(&mut self) -> PathBuf {
        let path = self.dir.path.join(format!("run-{}.jsonl", self.next_file));
        self.next_file += 1;
        path
    }

    fn push(&mut self, key: Vec<Value>, values: Vec<Value>) -> io::Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.buf.push(Keyed { key, seq, values });
        if self.buf.len() >= self.threshold {
            self.spill_run()?;
        }
        Ok(())
    }

    fn spill_run(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir.path)?;

        // la secuencia es única, así que no hace falta orden estable
        self.buf.sort_unstable_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        let path = self.next_run_path();
        write_run(&path, self.buf.drain(..).map(Ok))?;

        debug!("run volcado a disco: {}", path.display());
        self.runs.push(path);
        self.spilled += 1;
        Ok(())
    }

    /// Mezcla los primeros `fan_in` runs en uno nuevo y borra los originales.
    fn merge_pass(&mut self) -> io::Result<()> {
        let batch: Vec<PathBuf> = self.runs.drain(..self.fan_in).collect();
        let sources = batch
            .iter()
            .map(|p| RunSource::open(p))
            .collect::<io::Result<Vec<_>>>()?;
        let merger = RunMerger::new(sources, None)?;

        let path = self.next_run_path();
        write_run(&path, merger)?;
        for done in &batch {
            fs::remove_file(done)?;
        }

        debug!("{} runs mezclados en {}", batch.len(), path.display());
        self.runs.push(path);
        Ok(())
    }

    fn finish(mut self) -> io::Result<KeyedStream> {
        self.buf
            .sort_unstable_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        if self.runs.is_empty() {
            return Ok(Box::new(std::mem::take(&mut self.buf).into_iter().map(Ok)));
        }

        // el run en memoria también ocupa un lugar en la mezcla final
        while self.runs.len() >= self.fan_in {
            self.merge_pass()?;
        }

        let mut sources: Vec<RunSource> = Vec::with_capacity(self.runs.len() + 1);
        for path in &self.runs {
            sources.push(RunSource::open(path)?);
        }
        sources.push(RunSource::Memory(std::mem::take(&mut self.buf).into_iter()));

        let merger = RunMerger::new(sources, Some(self.dir))?;
        Ok(Box::new(merger))
    }
}

/// Escribe un run ordenado, una entrada JSON por línea.
fn write_run<I>(path: &Path, entries: I) -> io::Result<()>
where
    I: IntoIterator<Item = io::Result<Keyed>>,
{
    let mut writer = BufWriter::new(File::create(path)?);
    for entry in entries {
        serde_json::to_writer(&mut writer, &entry?).map_err(|e| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("error al escribir spill en {}: {e}", path.display()),
            )
        })?;
        writer.write_all(b"\n")?;
    }
    writer.flush()
}

/// Grupos completos en memoria, en orden de primera aparición.
#[derive(Default)]
pub(crate) struct HashBuffer {
    order: Vec<Vec<Value>>,
    groups: HashMap<Vec<Value>, Vec<Keyed>>,
    next_seq: u64,
}

impl HashBuffer {
    fn push(&mut self, key: Vec<Value>, values: Vec<Value>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let members = self.groups.entry(key.clone()).or_insert_with(|| {
            self.order.push(key.clone());
            Vec::new()
        });
        members.push(Keyed { key, seq, values });
    }

    fn finish(mut self) -> KeyedStream {
        let groups: Vec<Vec<Keyed>> = self
            .order
            .iter()
            .filter_map(|k| self.groups.remove(k))
            .collect();
        Box::new(groups.into_iter().flatten().map(Ok))
    }
}

/* =========================
   Merge de runs ordenados
   ========================= */

enum RunSource {
    Memory(std::vec::IntoIter<Keyed>),
    File { lines: Lines<BufReader<File>>, path: PathBuf },
}

impl RunSource {
    fn open(path: &Path) -> io::Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(RunSource::File {
            lines: reader.lines(),
            path: path.to_path_buf(),
        })
    }

    fn pull(&mut self) -> io::Result<Option<Keyed>> {
        match self {
            RunSource::Memory(it) => Ok(it.next()),
            RunSource::File { lines, path } => {
                for line in lines.by_ref() {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    let entry: Keyed = serde_json::from_str(&line).map_err(|e| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("error al parsear spill {}: {e}", path.display()),
                        )
                    })?;
                    return Ok(Some(entry));
                }
                Ok(None)
            }
        }
    }
}

struct HeapItem {
    entry: Keyed,
    run: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.entry.sort_key().cmp(&other.entry.sort_key())
    }
}

/// Mezcla k-way de runs ordenados por `(clave, secuencia)`.
/// Sólo mantiene en memoria una entrada por run.
struct RunMerger {
    sources: Vec<RunSource>,
    heap: BinaryHeap<Reverse<HeapItem>>,
    failed: Option<io::Error>,
    /// Sólo la mezcla final es dueña del directorio.
    _dir: Option<SpillDir>,
}

impl RunMerger {
    fn new(mut sources: Vec<RunSource>, dir: Option<SpillDir>) -> io::Result<Self> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (run, src) in sources.iter_mut().enumerate() {
            if let Some(entry) = src.pull()? {
                heap.push(Reverse(HeapItem { entry, run }));
            }
        }
        Ok(Self {
            sources,
            heap,
            failed: None,
            _dir: dir,
        })
    }
}

impl Iterator for RunMerger {
    type Item = io::Result<Keyed>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.failed.take() {
            return Some(Err(e));
        }
        let Reverse(item) = self.heap.pop()?;
        match self.sources[item.run].pull() {
            Ok(Some(entry)) => self.heap.push(Reverse(HeapItem {
                entry,
                run: item.run,
            })),
            Ok(None) => {}
            Err(e) => {
                // se entrega primero lo que ya teníamos
                self.heap.clear();
                self.failed = Some(e);
            }
        }
        Some(Ok(item.entry))
    }
}

/* =========================
   Cursor de grupos
   ========================= */

/// Recorre un [`KeyedStream`] grupo por grupo.
pub struct GroupCursor {
    stream: KeyedStream,
    pending: Option<Keyed>,
    current: Option<Vec<Value>>,
    schema: Arc<Schema>,
    key_schema: Arc<Schema>,
    error: Option<io::Error>,
}

/// Un grupo: clave y miembros perezosos de una sola pasada.
pub struct Group<'a> {
    pub key: Tuple,
    pub members: GroupMembers<'a>,
}

impl GroupCursor {
    pub(crate) fn new(stream: KeyedStream, schema: Arc<Schema>, key_schema: Arc<Schema>) -> Self {
        Self {
            stream,
            pending: None,
            current: None,
            schema,
            key_schema,
            error: None,
        }
    }

    fn fill(&mut self) {
        if self.pending.is_some() || self.error.is_some() {
            return;
        }
        match self.stream.next() {
            Some(Ok(entry)) => self.pending = Some(entry),
            Some(Err(e)) => self.error = Some(e),
            None => {}
        }
    }

    /// Siguiente grupo. Los miembros que el grupo anterior no consumió se
    /// descartan antes. Nunca devuelve un grupo vacío.
    pub fn next_group(&mut self) -> Option<Group<'_>> {
        loop {
            self.fill();
            let pending = self.pending.as_ref()?;
            if self.current.as_ref() == Some(&pending.key) {
                self.pending = None;
                continue;
            }
            break;
        }
        let key_values = self.pending.as_ref()?.key.clone();
        self.current = Some(key_values.clone());
        let key = Tuple::from_parts(self.key_schema.clone(), key_values);
        Some(Group {
            key,
            members: GroupMembers { cursor: self },
        })
    }

    /// Error de lectura del spill, si lo hubo. Corta la iteración.
    pub fn take_error(&mut self) -> Option<io::Error> {
        self.error.take()
    }
}

/// Miembros de un grupo, en orden de llegada al worker.
///
/// Iterador de una sola pasada: no se puede reiniciar ni clonar, y se
/// consume por valor al pasarlo al reducer.
pub struct GroupMembers<'a> {
    cursor: &'a mut GroupCursor,
}

impl Iterator for GroupMembers<'_> {
    type Item = Tuple;

    fn next(&mut self) -> Option<Tuple> {
        self.cursor.fill();
        let matches = match (&self.cursor.pending, &self.cursor.current) {
            (Some(p), Some(cur)) => &p.key == cur,
            _ => false,
        };
        if !matches {
            return None;
        }
        let entry = self.cursor.pending.take()?;
        Some(Tuple::from_parts(self.cursor.schema.clone(), entry.values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("grouper_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        base
    }

    fn schemas() -> (Arc<Schema>, Arc<Schema>) {
        (
            Schema::shared(["k", "v"]).unwrap(),
            Schema::shared(["k"]).unwrap(),
        )
    }

    /// Carga pares (clave, valor) y devuelve los grupos como (clave, [valores]).
    fn group_all(mut grouper: Grouper, rows: &[(&str, i64)]) -> Vec<(String, Vec<i64>)> {
        for (k, v) in rows {
            grouper
                .push(vec![Value::from(*k)], vec![Value::from(*k), Value::Int(*v)])
                .unwrap();
        }
        let (schema, key_schema) = schemas();
        let mut cursor = GroupCursor::new(grouper.finish().unwrap(), schema, key_schema);

        let mut out = Vec::new();
        while let Some(group) = cursor.next_group() {
            let key = group.key.get_str("k").unwrap().to_string();
            let vals: Vec<i64> = group.members.map(|t| t.get_int("v").unwrap()).collect();
            out.push((key, vals));
        }
        assert!(cursor.take_error().is_none());
        out
    }

    const ROWS: &[(&str, i64)] = &[("b", 1), ("a", 2), ("b", 3), ("c", 4), ("a", 5), ("b", 6)];

    #[test]
    fn partition_for_retorna_id_en_rango() {
        let n = 10;
        for key in ["a", "b", "c", "xyz", "otro"] {
            let pid = partition_for(&[Value::from(key)], n);
            assert!(pid < n);
        }
        assert_eq!(partition_for(&[Value::Int(7)], 1), 0);
    }

    #[test]
    fn partition_for_es_determinista() {
        let key = vec![Value::from("a"), Value::Null];
        assert_eq!(partition_for(&key, 7), partition_for(&key.clone(), 7));
    }

    #[test]
    fn sort_agrupa_en_orden_de_llegada() {
        let g = Grouper::new(GroupStrategy::Sort, temp_dir("sort_mem"), 1_000);
        let groups = group_all(g, ROWS);
        assert_eq!(
            groups,
            vec![
                ("a".to_string(), vec![2, 5]),
                ("b".to_string(), vec![1, 3, 6]),
                ("c".to_string(), vec![4]),
            ]
        );
    }

    #[test]
    fn sort_con_spill_da_los_mismos_grupos() {
        let dir = temp_dir("sort_spill");
        let mut g = Grouper::new(GroupStrategy::Sort, dir.clone(), 2);
        for (k, v) in &ROWS[..2] {
            g.push(vec![Value::from(*k)], vec![Value::from(*k), Value::Int(*v)])
                .unwrap();
        }
        assert_eq!(g.spilled_runs(), 1);
        assert!(dir.join("run-0.jsonl").exists());

        let groups = group_all(g, &ROWS[2..]);
        // los dos primeros ya estaban en el run volcado
        assert_eq!(
            groups,
            vec![
                ("a".to_string(), vec![2, 5]),
                ("b".to_string(), vec![1, 3, 6]),
                ("c".to_string(), vec![4]),
            ]
        );
        // el merger borra sus runs al terminar
        assert!(!dir.exists());
    }

    #[test]
    fn hash_agrupa_por_primera_aparicion() {
        let g = Grouper::new(GroupStrategy::Hash, temp_dir("hash"), 1);
        let groups = group_all(g, ROWS);
        assert_eq!(
            groups,
            vec![
                ("b".to_string(), vec![1, 3, 6]),
                ("a".to_string(), vec![2, 5]),
                ("c".to_string(), vec![4]),
            ]
        );
    }

    #[test]
    fn particion_vacia_no_produce_grupos() {
        let g = Grouper::new(GroupStrategy::Sort, temp_dir("empty"), 10);
        assert!(group_all(g, &[]).is_empty());
    }

    #[test]
    fn miembros_no_consumidos_se_saltan() {
        let mut g = Grouper::new(GroupStrategy::Sort, temp_dir("skip"), 100);
        for (k, v) in ROWS {
            g.push(vec![Value::from(*k)], vec![Value::from(*k), Value::Int(*v)])
                .unwrap();
        }
        let (schema, key_schema) = schemas();
        let mut cursor = GroupCursor::new(g.finish().unwrap(), schema, key_schema);

        let mut keys = Vec::new();
        while let Some(mut group) = cursor.next_group() {
            // sólo el primer miembro
            let first = group.members.next().unwrap();
            keys.push((group.key.get_str(0).unwrap().to_string(), first.get_int(1).unwrap()));
        }
        assert_eq!(
            keys,
            vec![("a".to_string(), 2), ("b".to_string(), 1), ("c".to_string(), 4)]
        );
    }

    #[test]
    fn claves_null_forman_su_propio_grupo() {
        let mut g = Grouper::new(GroupStrategy::Sort, temp_dir("null"), 100);
        for v in [Value::Null, Value::from("x"), Value::Null] {
            g.push(vec![v.clone()], vec![v, Value::Int(0)]).unwrap();
        }
        let (schema, key_schema) = schemas();
        let mut cursor = GroupCursor::new(g.finish().unwrap(), schema, key_schema);
        let mut sizes = Vec::new();
        while let Some(group) = cursor.next_group() {
            let is_null = group.key.get(0).unwrap().is_null();
            sizes.push((is_null, group.members.count()));
        }
        assert_eq!(sizes, vec![(true, 2), (false, 1)]);
    }

    #[test]
    fn spill_conserva_floats_no_finitos() {
        let dir = temp_dir("floats");
        let mut g = Grouper::new(GroupStrategy::Sort, dir, 1);
        let keys = [f64::NAN, f64::INFINITY, f64::NAN, f64::NEG_INFINITY, f64::INFINITY];
        for (i, f) in keys.iter().enumerate() {
            g.push(vec![Value::Float(*f)], vec![Value::Float(*f), Value::Int(i as i64)])
                .unwrap();
        }
        assert!(g.spilled_runs() >= 4);

        let (schema, key_schema) = schemas();
        let mut cursor = GroupCursor::new(g.finish().unwrap(), schema, key_schema);
        let mut groups = Vec::new();
        while let Some(group) = cursor.next_group() {
            let key = group.key.get(0).unwrap().clone();
            let vals: Vec<i64> = group.members.map(|t| t.get_int("v").unwrap()).collect();
            groups.push((key, vals));
        }
        assert!(cursor.take_error().is_none());
        // orden total: -inf < inf < NaN
        assert_eq!(
            groups,
            vec![
                (Value::Float(f64::NEG_INFINITY), vec![3]),
                (Value::Float(f64::INFINITY), vec![1, 4]),
                (Value::Float(f64::NAN), vec![0, 2]),
            ]
        );
    }

    #[test]
    fn mezcla_por_tandas_con_muchos_runs() {
        let dir = temp_dir("fan_in");
        let mut g = SortBuffer::new(dir.clone(), 1, 3);
        for (k, v) in ROWS.iter().chain(ROWS) {
            g.push(vec![Value::from(*k)], vec![Value::from(*k), Value::Int(*v)])
                .unwrap();
        }
        assert_eq!(g.spilled, 12);

        let stream = g.finish().unwrap();
        // la mezcla final abre a lo sumo fan_in - 1 runs de disco
        let files = fs::read_dir(&dir).unwrap().count();
        assert!(files <= 2, "quedaron {files} runs");

        let (schema, key_schema) = schemas();
        let mut cursor = GroupCursor::new(stream, schema, key_schema);
        let mut groups = Vec::new();
        while let Some(group) = cursor.next_group() {
            let key = group.key.get_str("k").unwrap().to_string();
            let vals: Vec<i64> = group.members.map(|t| t.get_int("v").unwrap()).collect();
            groups.push((key, vals));
        }
        assert!(cursor.take_error().is_none());
        assert_eq!(
            groups,
            vec![
                ("a".to_string(), vec![2, 5, 2, 5]),
                ("b".to_string(), vec![1, 3, 6, 1, 3, 6]),
                ("c".to_string(), vec![4, 4]),
            ]
        );
        drop(cursor);
        assert!(!dir.exists());
    }

    #[test]
    fn spill_corrupto_reporta_error() {
        let dir = temp_dir("corrupt");
        let mut g = SortBuffer::new(dir.clone(), 2, MERGE_FAN_IN);
        for k in [1, 2] {
            g.push(vec![Value::Int(k)], vec![Value::Int(k), Value::Int(k)])
                .unwrap();
        }
        // se conserva la primera línea del run y se rompe la segunda
        let run = dir.join("run-0.jsonl");
        let content = fs::read_to_string(&run).unwrap();
        let first = content.lines().next().unwrap().to_string();
        fs::write(&run, format!("{first}\n{{no es json}}\n")).unwrap();

        let (schema, key_schema) = schemas();
        let mut cursor = GroupCursor::new(g.finish().unwrap(), schema, key_schema);

        let group = cursor.next_group().unwrap();
        assert_eq!(group.key.get_int(0).unwrap(), 1);
        assert_eq!(group.members.count(), 1);

        assert!(cursor.next_group().is_none());
        assert!(cursor.take_error().is_some());
    }
}
