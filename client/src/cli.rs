use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tuplestream::{Flow, RunOptions};

use crate::flows;

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para correr flujos de tuplas en local")]
struct Cli {
    /// Muestra el plan del flujo en JSON y no lo ejecuta
    #[arg(long, global = true)]
    explain: bool,

    /// Workers por cada group_by (por defecto, NUM_REDUCERS o 1)
    #[arg(long, global = true, env = "NUM_REDUCERS")]
    reducers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cuenta, entre las líneas que empiezan con una letra, cuántas hay
    /// por cantidad de palabras
    FirstLetter {
        /// Archivo, directorio o patrón glob de entrada
        #[arg(value_name = "ENTRADA")]
        input: String,

        /// Archivo TSV de salida
        #[arg(value_name = "SALIDA")]
        output: PathBuf,

        #[arg(long, default_value = "A")]
        letter: String,

        /// Escribe los nombres de campo como primera línea
        #[arg(long)]
        header: bool,
    },
    /// WordCount: cuenta apariciones de cada palabra
    Wordcount {
        #[arg(value_name = "ENTRADA")]
        input: String,

        #[arg(value_name = "SALIDA")]
        output: PathBuf,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut opts = RunOptions::from_env()?;
    if let Some(n) = cli.reducers {
        opts.num_reducers = n;
    }

    let mut flow = match &cli.command {
        Commands::FirstLetter {
            input,
            output,
            letter,
            header,
        } => flows::first_letter_flow(input, output, letter, *header)?,
        Commands::Wordcount { input, output } => flows::wordcount_flow(input, output)?,
    };

    if cli.explain {
        println!("{}", serde_json::to_string_pretty(&flow.plan())?);
        return Ok(());
    }

    run_flow(&mut flow, opts).await
}

/// Corre el flujo e imprime el reporte, haya fallado o no.
async fn run_flow(flow: &mut Flow, opts: RunOptions) -> Result<()> {
    info!(
        "ejecutando con {} reducers (estrategia {:?})",
        opts.num_reducers, opts.group_strategy
    );
    let result = flow.run(opts).await;

    if let Some(report) = flow.report() {
        println!("{}", serde_json::to_string_pretty(report)?);
    }

    match result {
        Ok(report) => {
            info!(
                "listo: {} tuplas escritas en {} ms",
                report.records_written,
                report.elapsed_ms().unwrap_or_default()
            );
            Ok(())
        }
        Err(e) => {
            error!("el flujo falló: {e}");
            Err(e.into())
        }
    }
}
