//! Flujos de ejemplo que arma el CLI.

use anyhow::bail;
use std::path::Path;
use tuplestream::prelude::*;
use tuplestream::ReduceOutput;

/// Separa en palabras: sólo alfanumérico y '_', en minúscula.
pub fn tokenize(line: &str) -> Vec<String> {
    line.split_whitespace()
        .map(|raw| {
            raw.chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

/* =========================
   first-letter
   ========================= */

/// Deja pasar las líneas cuya primera letra (en mayúscula) es `letter`.
/// Una línea vacía hace fallar el predicado.
pub fn starts_with_letter(letter: &str) -> Filter {
    Filter::new("starts_with_letter", |t: &Tuple, args: &[Value]| {
        let letter = args.first().and_then(Value::as_str).unwrap_or_default();
        let Some(first) = t.get_str("line")?.chars().next() else {
            bail!("línea vacía");
        };
        Ok(first.to_uppercase().eq(letter.chars()))
    })
    .with_args([letter.to_uppercase()])
    .reads(&["line"])
}

/// `(word_count, line)`
pub fn word_count() -> Map {
    Map::replace(&["word_count", "line"], |t: &Tuple| {
        let line = t.get_str("line")?;
        Ok(vec![
            Value::from(line.split_whitespace().count()),
            Value::from(line),
        ])
    })
    .named("word_count")
    .reads(&["line"])
}

fn count_group(key: &Tuple, members: GroupMembers<'_>) -> anyhow::Result<Vec<Value>> {
    let mut count = 0i64;
    let mut first_chars = String::new();
    for t in members {
        count += 1;
        if let Some(c) = t.get_str("line")?.chars().next() {
            first_chars.push(c);
        }
    }
    Ok(vec![key.get(0)?.clone(), Value::Int(count), Value::from(first_chars)])
}

/// Cantidad de líneas del grupo y la primera letra de cada una.
pub fn count_first_chars() -> Reducer {
    Reducer::new(&["word_count", "count", "first_chars"], |key, members| {
        Box::new(std::iter::once(count_group(key, members)))
    })
    .named("count")
}

/// text_line -> starts_with_letter -> word_count -> group_by(word_count) -> tsv
pub fn first_letter_flow(input: &str, output: &Path, letter: &str, header: bool) -> tuplestream::Result<Flow> {
    let mut flow = Flow::new();
    flow.source(TextLineSource::new(input))?
        .filter(starts_with_letter(letter))?
        .map(word_count())?
        .group_by(&["word_count"], count_first_chars())?
        .sink(TsvSink::create(output).with_header(header))?;
    Ok(flow)
}

/* =========================
   wordcount
   ========================= */

/// Una fila `(token)` por palabra de cada línea del grupo, a medida que
/// se piden.
fn tokens<'a>(members: GroupMembers<'a>) -> ReduceOutput<'a> {
    Box::new(members.flat_map(|t| {
        let rows: Vec<anyhow::Result<Vec<Value>>> = match t.get_str("line") {
            Ok(line) => tokenize(line)
                .into_iter()
                .map(|w| Ok(vec![Value::from(w)]))
                .collect(),
            Err(e) => vec![Err(e.into())],
        };
        rows
    }))
}

/// text_line -> group_by(offset, line) tokeniza -> group_by(token) cuenta -> tsv
///
/// El primer group_by sólo reparte las líneas entre workers: su reducer
/// emite una fila por palabra.
pub fn wordcount_flow(input: &str, output: &Path) -> tuplestream::Result<Flow> {
    let tokenizer = Reducer::new(&["token"], |_key, members| tokens(members)).named("tokenize");
    let counter = Reducer::new(&["token", "count"], |key, members| {
        Box::new(std::iter::once(
            key.get(0)
                .map(|k| vec![k.clone(), Value::from(members.count())])
                .map_err(anyhow::Error::from),
        ))
    })
    .named("count");

    let mut flow = Flow::new();
    flow.source(TextLineSource::new(input))?
        .group_by(&["offset", "line"], tokenizer)?
        .group_by(&["token"], counter)?
        .sink(TsvSink::create(output))?;
    Ok(flow)
}
