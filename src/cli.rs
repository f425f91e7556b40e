//! Interface de linha de comando do assessflow baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (submit, status,
//! balance, demo) e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// assessflow: envio e acompanhamento de avaliações psicométricas tarifadas.
#[derive(Debug, Parser)]
#[command(name = "assessflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: `assessflow.toml`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Envia uma avaliação e acompanha o job até um estado terminal.
    Submit {
        /// Nome da avaliação (ex.: "big-five").
        #[arg(long)]
        label: String,

        /// Arquivo JSON com as pontuações: `{"openness": 71.5, ...}`.
        #[arg(long)]
        scores: PathBuf,

        /// Chave de idempotência; gerada automaticamente se omitida.
        #[arg(long)]
        key: Option<String>,
    },

    /// Consulta o status remoto de um job.
    Status {
        /// Identificador do job retornado pelo envio.
        job_id: String,
    },

    /// Mostra o saldo de tokens.
    Balance,

    /// Executa o fluxo completo contra um backend simulado em memória.
    Demo {
        /// Saldo inicial de tokens.
        #[arg(long, default_value_t = 10)]
        balance: i64,

        /// Faz a análise simulada falhar.
        #[arg(long, default_value_t = false)]
        fail: bool,

        /// Cancela o job enquanto ele está em processamento.
        #[arg(long, default_value_t = false)]
        cancel: bool,
    },
}
