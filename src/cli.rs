//! Interface de linha de comando do dossier baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (generate, status,
//! recover) e flags globais (--model, --max-loops, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use dossier::config::DossierConfig;

/// dossier: relatórios de empresas verificados contra as fontes.
#[derive(Debug, Parser)]
#[command(name = "dossier", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Identificador do modelo usado em todas as chamadas.
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Número máximo de passagens de verificação.
    #[arg(long, global = true)]
    pub max_loops: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Gera o relatório de uma empresa.
    Generate {
        /// Nome da empresa.
        company: String,

        /// Área ou cargo de interesse do candidato.
        #[arg(long, default_value = "general")]
        topic: String,

        /// Arquivo JSON com os documentos de origem.
        #[arg(long)]
        sources: PathBuf,
    },

    /// Mostra um job, ou todos quando nenhum id é informado.
    Status {
        job_id: Option<String>,
    },

    /// Marca como falhos os jobs interrompidos durante o processamento.
    Recover,
}

impl Cli {
    /// Aplica as flags sobre a configuração carregada do arquivo.
    pub fn apply_overrides(&self, config: &mut DossierConfig) {
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(max_loops) = self.max_loops {
            config.verification.max_loops = max_loops;
        }
    }
}
