use anyhow::bail;
use std::{
    env, fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tuplestream::prelude::*;
use tuplestream::{io::CollectHandle, RunStatus};

fn temp_dir(sub: &str) -> PathBuf {
    let base = env::temp_dir().join("tuplestream_flow_tests").join(sub);
    let _ = fs::remove_dir_all(&base);
    fs::create_dir_all(&base).unwrap();
    base
}

fn opts(num_reducers: usize, sub: &str) -> RunOptions {
    RunOptions {
        num_reducers,
        spill_dir: env::temp_dir()
            .join("tuplestream_flow_tests")
            .join("spill")
            .join(sub),
        ..RunOptions::default()
    }
}

fn lines(rows: &[&str]) -> VecSource {
    VecSource::new(
        &["offset", "line"],
        rows.iter()
            .enumerate()
            .map(|(i, l)| vec![Value::from(i), Value::from(*l)])
            .collect(),
    )
    .unwrap()
}

fn starts_with_letter(letter: &str) -> Filter {
    Filter::new("starts_with_letter", |t: &Tuple, args: &[Value]| {
        let letter = args[0].as_str().unwrap_or_default();
        let first = t.get_str(1)?.chars().next();
        match first {
            Some(c) => Ok(c.to_uppercase().to_string() == letter),
            None => bail!("línea vacía"),
        }
    })
    .with_args([letter])
}

fn word_count(t: &Tuple) -> anyhow::Result<Vec<Value>> {
    let line = t.get_str(1)?;
    Ok(vec![
        Value::from(line.split_whitespace().count()),
        Value::from(line),
    ])
}

/// Cuenta los miembros y concatena la primera letra de cada línea.
fn count_first_chars() -> Reducer {
    Reducer::new(&["word_count", "count", "first_chars"], |key, members| {
        let mut count = 0i64;
        let mut first_chars = String::new();
        for t in members {
            count += 1;
            if let Some(c) = t.get_str("line").ok().and_then(|l| l.chars().next()) {
                first_chars.push(c);
            }
        }
        emit_one(vec![
            key.get(0).unwrap().clone(),
            Value::Int(count),
            Value::from(first_chars),
        ])
    })
}

fn count_by_key() -> Reducer {
    Reducer::new(&["k", "count"], |key, members| {
        emit_one(vec![key.get(0).unwrap().clone(), Value::from(members.count())])
    })
}

fn keyed(rows: &[&str]) -> VecSource {
    VecSource::new(
        &["k"],
        rows.iter().map(|k| vec![Value::from(*k)]).collect(),
    )
    .unwrap()
}

fn sorted_pairs(handle: &CollectHandle) -> Vec<(String, i64)> {
    let mut out: Vec<(String, i64)> = handle
        .tuples()
        .iter()
        .map(|t| (t.get(0).unwrap().to_string(), t.get_int(1).unwrap()))
        .collect();
    out.sort();
    out
}

#[tokio::test]
async fn town_cuenta_lineas_por_cantidad_de_palabras() {
    let sink = CollectSink::new();
    let out = sink.handle();

    let mut flow = Flow::new();
    flow.source(lines(&["Apple tree", "Banana boat", "Avocado roll"]))
        .unwrap()
        .filter(starts_with_letter("A"))
        .unwrap()
        .map_replace(&["word_count", "line"], word_count)
        .unwrap()
        .group_by(&["word_count"], count_first_chars())
        .unwrap()
        .sink(sink)
        .unwrap();

    let report = flow.run(opts(2, "town")).await.unwrap();

    let rows: Vec<String> = out.tuples().iter().map(|t| t.to_string()).collect();
    assert_eq!(rows, vec!["(word_count=2, count=2, first_chars=AA)"]);
    assert!(out.is_completed());
    assert_eq!(flow.state(), FlowState::Completed);

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.records_read, 3);
    assert_eq!(report.filtered_out, 1);
    assert_eq!(report.groups, 1);
    assert_eq!(report.records_written, 1);
    assert_eq!(flow.report().unwrap().run_id, report.run_id);
}

#[test]
fn town_desde_archivo_a_tsv() {
    let tmp = temp_dir("town_files");
    let input = tmp.join("town.txt");
    fs::write(&input, "Apple tree\nBanana boat\nAvocado roll\n\nant\n").unwrap();
    let output = tmp.join("out").join("part.tsv");

    let mut flow = Flow::new();
    flow.source(TextLineSource::new(input.to_string_lossy()))
        .unwrap()
        .filter(starts_with_letter("A"))
        .unwrap()
        .map_replace(&["word_count", "line"], word_count)
        .unwrap()
        .group_by(&["word_count"], count_first_chars())
        .unwrap()
        .sink(TsvSink::create(&output))
        .unwrap();

    let report = flow.run_blocking(opts(2, "town_files")).unwrap();
    // la línea vacía hace fallar el predicado: se excluye
    assert_eq!(report.filter_errors, 1);

    let mut rows: Vec<String> = fs::read_to_string(&output)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    rows.sort();
    assert_eq!(rows, vec!["1\t1\ta", "2\t2\tAA"]);
}

#[tokio::test]
async fn mismo_resultado_con_uno_o_cuatro_reducers() {
    let data = ["a", "b", "a", "c", "b", "a", "d", "e", "a"];
    let mut results = Vec::new();

    for (w, strategy) in [
        (1, GroupStrategy::Sort),
        (4, GroupStrategy::Sort),
        (4, GroupStrategy::Hash),
    ] {
        let sink = CollectSink::new();
        let out = sink.handle();
        let mut flow = Flow::new();
        flow.source(keyed(&data))
            .unwrap()
            .group_by(&["k"], count_by_key())
            .unwrap()
            .sink(sink)
            .unwrap();

        let mut o = opts(w, &format!("w{w}_{strategy:?}"));
        o.group_strategy = strategy;
        flow.run(o).await.unwrap();
        results.push(sorted_pairs(&out));
    }

    assert_eq!(
        results[0],
        vec![
            ("a".to_string(), 4),
            ("b".to_string(), 2),
            ("c".to_string(), 1),
            ("d".to_string(), 1),
            ("e".to_string(), 1),
        ]
    );
    assert_eq!(results[0], results[1]);
    assert_eq!(results[0], results[2]);
}

#[tokio::test]
async fn fuente_vacia_termina_bien_sin_tuplas() {
    let sink = CollectSink::new();
    let out = sink.handle();
    let mut flow = Flow::new();
    flow.source(keyed(&[]))
        .unwrap()
        .group_by(&["k"], count_by_key())
        .unwrap()
        .sink(sink)
        .unwrap();

    let report = flow.run(opts(3, "empty")).await.unwrap();
    assert!(out.is_empty());
    assert!(out.is_completed());
    assert_eq!(report.groups, 0);
}

#[tokio::test]
async fn spill_a_disco_da_los_mismos_grupos() {
    let data: Vec<String> = (0..200).map(|i| format!("k{}", i % 7)).collect();
    let data: Vec<&str> = data.iter().map(String::as_str).collect();

    let mut results = Vec::new();
    for threshold in [100_000, 3] {
        let sink = CollectSink::new();
        let out = sink.handle();
        let mut flow = Flow::new();
        flow.source(keyed(&data))
            .unwrap()
            .group_by(&["k"], count_by_key())
            .unwrap()
            .sink(sink)
            .unwrap();

        let mut o = opts(2, &format!("spill_{threshold}"));
        o.max_in_mem_tuples = threshold;
        let report = flow.run(o).await.unwrap();
        if threshold == 3 {
            assert!(report.spilled_runs > 0);
        } else {
            assert_eq!(report.spilled_runs, 0);
        }
        results.push(sorted_pairs(&out));
    }
    assert_eq!(results[0].len(), 7);
    assert_eq!(results[0], results[1]);
}

#[tokio::test]
async fn fila_con_aridad_incorrecta_se_descarta_sola() {
    let reducer = Reducer::new(&["k", "count"], |key, members| {
        let k = key.get(0).unwrap().clone();
        let n = members.count();
        emit_all(vec![
            vec![k.clone(), Value::from(n)],
            vec![k], // le falta un campo
        ])
    });

    let sink = CollectSink::new();
    let out = sink.handle();
    let mut flow = Flow::new();
    flow.source(keyed(&["x", "y", "x"]))
        .unwrap()
        .group_by(&["k"], reducer)
        .unwrap()
        .sink(sink)
        .unwrap();

    let report = flow.run(opts(2, "arity")).await.unwrap();
    assert_eq!(sorted_pairs(&out), vec![("x".to_string(), 2), ("y".to_string(), 1)]);
    assert_eq!(report.rejected_rows, 2);
    assert!(report.succeeded());
}

fn fails_on_boom() -> Map {
    Map::replace(&["line"], |t: &Tuple| {
        let line = t.get_str("line")?;
        if line == "boom" {
            bail!("no se puede procesar");
        }
        Ok(vec![Value::from(line.to_uppercase())])
    })
}

#[tokio::test]
async fn error_de_map_aborta_e_informa_etapa_y_registro() {
    let sink = CollectSink::new();
    let out = sink.handle();
    let mut flow = Flow::new();
    let map_id = flow
        .source(lines(&["ok", "boom", "tarde"]))
        .unwrap()
        .map(fails_on_boom())
        .unwrap()
        .id();
    flow.sink(map_id, sink).unwrap();

    let err = flow.run(opts(1, "map_abort")).await.unwrap_err();
    match &err {
        PipelineError::Record { stage, record, .. } => {
            assert_eq!(stage.id, map_id);
            assert_eq!(stage.label, "map_replace(line)");
            assert!(record.contains("boom"));
        }
        other => panic!("error inesperado: {other}"),
    }
    assert!(err.to_string().contains("no se puede procesar"));

    assert_eq!(flow.state(), FlowState::Failed);
    assert!(out.was_aborted());
    assert!(!out.is_completed());
    let report = flow.report().unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.error.is_some());

    // un flujo fallido tampoco se puede reintentar
    assert!(matches!(
        flow.run(RunOptions::default()).await,
        Err(PipelineError::AlreadyRun {
            state: FlowState::Failed
        })
    ));
}

#[tokio::test]
async fn drop_and_log_descarta_y_cuenta() {
    let sink = CollectSink::new();
    let out = sink.handle();
    let mut flow = Flow::new();
    flow.source(lines(&["ok", "boom", "tarde"]))
        .unwrap()
        .map(fails_on_boom())
        .unwrap()
        .sink(sink)
        .unwrap();

    let mut o = opts(1, "map_drop");
    o.record_error_policy = RecordErrorPolicy::DropAndLog;
    let report = flow.run(o).await.unwrap();

    let got: Vec<String> = out
        .tuples()
        .iter()
        .map(|t| t.get_str("line").unwrap().to_string())
        .collect();
    assert_eq!(got, vec!["OK", "TARDE"]);
    assert_eq!(report.dropped_records, 1);
}

#[tokio::test]
async fn filtro_con_politica_fail_aborta() {
    let mut flow = Flow::new();
    flow.source(lines(&["Apple", ""]))
        .unwrap()
        .filter(starts_with_letter("A").on_error(FilterErrorPolicy::Fail))
        .unwrap()
        .sink(CollectSink::new())
        .unwrap();

    let err = flow.run(opts(1, "filter_fail")).await.unwrap_err();
    assert!(matches!(err, PipelineError::Record { .. }));
}

#[tokio::test]
async fn panic_en_reducer_es_error_del_grupo() {
    let reducer = Reducer::new(&["k"], |key, _members| {
        if key.get_str(0).unwrap() == "malo" {
            panic!("reducer roto");
        }
        emit_one(vec![key.get(0).unwrap().clone()])
    });

    let mut flow = Flow::new();
    flow.source(keyed(&["bueno", "malo"]))
        .unwrap()
        .group_by(&["k"], reducer)
        .unwrap()
        .sink(CollectSink::new())
        .unwrap();

    let err = flow.run(opts(2, "reducer_panic")).await.unwrap_err();
    match err {
        PipelineError::Record { record, cause, .. } => {
            assert!(record.contains("malo"));
            assert!(cause.to_string().contains("reducer roto"));
        }
        other => panic!("error inesperado: {other}"),
    }
}

#[tokio::test]
async fn ramas_entregan_a_ambos_sinks() {
    let all = CollectSink::new();
    let all_out = all.handle();
    let only_a = CollectSink::new();
    let a_out = only_a.handle();

    let mut flow = Flow::new();
    let src = flow
        .source(lines(&["Apple tree", "Banana boat", "Avocado roll"]))
        .unwrap()
        .id();
    flow.at(src)
        .unwrap()
        .filter(starts_with_letter("A"))
        .unwrap()
        .sink(only_a)
        .unwrap();
    flow.sink(src, all).unwrap();

    flow.run(opts(1, "branches")).await.unwrap();
    assert_eq!(all_out.len(), 3);
    assert_eq!(a_out.len(), 2);
    assert!(all_out.is_completed() && a_out.is_completed());

    // cada tupla llega intacta a cada rama
    let first = &all_out.tuples()[0];
    assert_eq!(first.get_str("line").unwrap(), "Apple tree");
}

#[tokio::test]
async fn reducer_emite_una_fila_por_miembro() {
    let reducer = Reducer::new(&["k", "pos"], |key, members| {
        let k = key.get(0).unwrap().clone();
        Box::new(
            members
                .enumerate()
                .map(move |(i, _)| Ok::<_, anyhow::Error>(vec![k.clone(), Value::from(i)])),
        )
    });

    let sink = CollectSink::new();
    let out = sink.handle();
    let mut flow = Flow::new();
    flow.source(keyed(&["a", "b", "a", "a"]))
        .unwrap()
        .group_by(&["k"], reducer)
        .unwrap()
        .sink(sink)
        .unwrap();
    flow.run(opts(1, "lazy")).await.unwrap();

    assert_eq!(
        sorted_pairs(&out),
        vec![
            ("a".to_string(), 0),
            ("a".to_string(), 1),
            ("a".to_string(), 2),
            ("b".to_string(), 0),
        ]
    );
}

#[tokio::test]
async fn cada_fila_del_reducer_sigue_antes_de_pedir_la_proxima() {
    let produced = Arc::new(AtomicUsize::new(0));
    let seen = produced.clone();

    let counter = produced.clone();
    let reducer = Reducer::new(&["k", "n"], move |key, _members| {
        let k = key.get(0).unwrap().clone();
        let counter = counter.clone();
        Box::new((1..=5i64).map(move |n| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(vec![k.clone(), Value::Int(n)])
        }))
    });

    let sink = CollectSink::new();
    let out = sink.handle();
    let mut flow = Flow::new();
    flow.source(keyed(&["a"]))
        .unwrap()
        .group_by(&["k"], reducer)
        .unwrap()
        .map_add(&["produced"], move |_t: &Tuple| {
            Ok(vec![Value::from(seen.load(Ordering::SeqCst))])
        })
        .unwrap()
        .sink(sink)
        .unwrap();
    flow.run(opts(1, "row_by_row")).await.unwrap();

    // al llegar la fila n, el reducer sólo había generado n filas
    let rows: Vec<(i64, i64)> = out
        .tuples()
        .iter()
        .map(|t| (t.get_int("n").unwrap(), t.get_int("produced").unwrap()))
        .collect();
    assert_eq!(rows, vec![(1, 1), (2, 2), (3, 3), (4, 4), (5, 5)]);
    assert_eq!(produced.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn reducer_infinito_se_corta_cuando_falla_la_ejecucion() {
    let reducer = Reducer::new(&["k"], |key, _members| {
        let k = key.get(0).unwrap().clone();
        Box::new(std::iter::repeat_with(move || Ok(vec![k.clone()])))
    });

    let passed = Arc::new(AtomicUsize::new(0));
    let count = passed.clone();
    let at_most_five = Filter::new("a_lo_sumo_cinco", move |_t: &Tuple, _: &[Value]| {
        if count.fetch_add(1, Ordering::SeqCst) >= 5 {
            bail!("demasiadas filas");
        }
        Ok(true)
    })
    .on_error(FilterErrorPolicy::Fail);

    let sink = CollectSink::new();
    let out = sink.handle();
    let mut flow = Flow::new();
    flow.source(keyed(&["a"]))
        .unwrap()
        .group_by(&["k"], reducer)
        .unwrap()
        .filter(at_most_five)
        .unwrap()
        .sink(sink)
        .unwrap();

    let err = flow.run(opts(1, "endless_reducer")).await.unwrap_err();
    assert!(matches!(err, PipelineError::Record { .. }));
    assert_eq!(passed.load(Ordering::SeqCst), 6);
    assert!(out.len() <= 5);
    assert!(out.was_aborted());
}

#[tokio::test]
async fn reducer_que_no_consume_todo_no_contamina_el_siguiente_grupo() {
    let reducer = Reducer::new(&["k", "first"], |key, mut members| {
        let first = members.next().map(|t| t.get(1).unwrap().clone());
        emit_one(vec![key.get(0).unwrap().clone(), first.into()])
    });

    let sink = CollectSink::new();
    let out = sink.handle();
    let source = VecSource::new(
        &["k", "n"],
        vec![
            vec!["a".into(), Value::Int(1)],
            vec!["b".into(), Value::Int(2)],
            vec!["a".into(), Value::Int(3)],
            vec!["b".into(), Value::Int(4)],
        ],
    )
    .unwrap();
    let mut flow = Flow::new();
    flow.source(source)
        .unwrap()
        .group_by(&["k"], reducer)
        .unwrap()
        .sink(sink)
        .unwrap();
    flow.run(opts(1, "partial")).await.unwrap();

    // los miembros llegan en orden de llegada: el primero de cada grupo
    assert_eq!(
        sorted_pairs(&out),
        vec![("a".to_string(), 1), ("b".to_string(), 2)]
    );
}

#[tokio::test]
async fn group_by_encadenados() {
    // cuántas claves tienen cada cantidad de apariciones
    let counts_of_counts = Reducer::new(&["count", "keys"], |key, members| {
        emit_one(vec![key.get(0).unwrap().clone(), Value::from(members.count())])
    });

    let sink = CollectSink::new();
    let out = sink.handle();
    let mut flow = Flow::new();
    flow.source(keyed(&["a", "a", "b", "c", "c", "d"]))
        .unwrap()
        .group_by(&["k"], count_by_key())
        .unwrap()
        .group_by(&["count"], counts_of_counts)
        .unwrap()
        .sink(sink)
        .unwrap();
    flow.run(opts(3, "chained")).await.unwrap();

    let mut got: Vec<(i64, i64)> = out
        .tuples()
        .iter()
        .map(|t| (t.get_int("count").unwrap(), t.get_int("keys").unwrap()))
        .collect();
    got.sort();
    assert_eq!(got, vec![(1, 2), (2, 2)]);
}

#[tokio::test]
async fn claves_null_se_agrupan_juntas() {
    let source = VecSource::new(
        &["k"],
        vec![vec![Value::Null], vec!["x".into()], vec![Value::Null]],
    )
    .unwrap();
    let sink = CollectSink::new();
    let out = sink.handle();
    let mut flow = Flow::new();
    flow.source(source)
        .unwrap()
        .group_by(&["k"], count_by_key())
        .unwrap()
        .sink(sink)
        .unwrap();
    flow.run(opts(2, "nulls")).await.unwrap();

    // Null se muestra vacío
    assert_eq!(
        sorted_pairs(&out),
        vec![(String::new(), 2), ("x".to_string(), 1)]
    );
}

/* ---------- colaboradores que fallan ---------- */

struct BrokenSource;

impl Source for BrokenSource {
    fn name(&self) -> String {
        "rota".to_string()
    }
    fn schema(&self) -> Arc<Schema> {
        Schema::shared(["k"]).unwrap()
    }
    fn open(&mut self) -> anyhow::Result<tuplestream::io::TupleIter> {
        let schema = self.schema();
        let first = Tuple::new(schema, vec![Value::from("a")])?;
        Ok(Box::new(
            vec![Ok(first), Err(anyhow::anyhow!("disco desconectado"))].into_iter(),
        ))
    }
}

struct RejectingSink;

impl Sink for RejectingSink {
    fn name(&self) -> String {
        "rechaza".to_string()
    }
    fn accept(&mut self, _t: Tuple) -> anyhow::Result<()> {
        bail!("sin espacio")
    }
    fn complete(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn falla_de_fuente_se_reporta_como_source_read_failure() {
    let sink = CollectSink::new();
    let out = sink.handle();
    let mut flow = Flow::new();
    flow.source(BrokenSource).unwrap().sink(sink).unwrap();

    let err = flow.run(opts(1, "broken_source")).await.unwrap_err();
    assert!(matches!(
        &err,
        PipelineError::SourceReadFailure { stage, .. } if stage.id.index() == 0
    ));
    assert!(err.to_string().contains("disco desconectado"));
    assert!(out.was_aborted());
}

#[tokio::test]
async fn falla_de_sink_aborta_los_demas_sinks() {
    let other = CollectSink::new();
    let other_out = other.handle();

    let mut flow = Flow::new();
    let src = flow.source(keyed(&["a", "b"])).unwrap().id();
    flow.sink(src, RejectingSink).unwrap();
    flow.sink(src, other).unwrap();

    let err = flow.run(opts(1, "broken_sink")).await.unwrap_err();
    assert!(matches!(err, PipelineError::SinkWriteFailure { .. }));
    assert!(other_out.was_aborted());
    assert!(!other_out.is_completed());
}

/// Acepta todo pero no puede confirmar.
struct UnconfirmedSink;

impl Sink for UnconfirmedSink {
    fn name(&self) -> String {
        "sin_confirmar".to_string()
    }
    fn accept(&mut self, _t: Tuple) -> anyhow::Result<()> {
        Ok(())
    }
    fn complete(&mut self) -> anyhow::Result<()> {
        bail!("no se pudo renombrar el archivo final")
    }
}

#[tokio::test]
async fn falla_al_confirmar_deja_confirmados_los_sinks_anteriores() {
    let first = CollectSink::new();
    let first_out = first.handle();
    let last = CollectSink::new();
    let last_out = last.handle();

    let mut flow = Flow::new();
    let src = flow.source(keyed(&["a", "b"])).unwrap().id();
    flow.sink(src, first).unwrap();
    flow.sink(src, UnconfirmedSink).unwrap();
    flow.sink(src, last).unwrap();

    let err = flow.run(opts(1, "unconfirmed_sink")).await.unwrap_err();
    assert!(matches!(
        &err,
        PipelineError::SinkWriteFailure { stage, .. } if stage.id.index() == 2
    ));
    assert_eq!(flow.state(), FlowState::Failed);
    assert!(first_out.is_completed());
    assert_eq!(first_out.len(), 2);
    assert!(last_out.was_aborted());
    assert!(!last_out.is_completed());
}
