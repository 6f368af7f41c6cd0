//! Interface de terminal do dossier: barra de progresso e saída colorida.
//!
//! Usa as crates `indicatif` para a barra de progresso e `console` para
//! estilização com cores. O [`JobProgress`] acompanha o canal de progresso
//! de um job até o estado terminal.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use dossier::progress::{ProgressReceiver, ProgressUpdate};
use dossier::state_machine::{AuditRecord, Job, JobStatus};

/// Indicador visual de progresso para a execução de um job no terminal.
pub struct JobProgress {
    // Barra de progresso do indicatif, de 0 a 100.
    pb: ProgressBar,
    // Estilo verde para sucesso.
    green: Style,
    // Estilo vermelho para falha.
    red: Style,
    // Estilo amarelo para rejeição e estados intermediários.
    yellow: Style,
}

impl JobProgress {
    /// Inicia a barra com o nome da empresa.
    pub fn start(company: &str) -> Self {
        let pb = ProgressBar::new(100);
        let style = ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
            .map(|s| s.progress_chars("=> "))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb.set_message(format!("{company}: queued"));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Reflete uma atualização do canal na barra.
    pub fn update(&self, update: &ProgressUpdate) {
        self.pb.set_position(u64::from(update.progress));
        self.pb.set_message(update.message.clone());
    }

    /// Acompanha o canal até o job chegar a um estado terminal ou o emissor
    /// ser descartado.
    pub async fn follow(&self, mut rx: ProgressReceiver) {
        loop {
            let update = rx.borrow_and_update().clone();
            self.update(&update);
            if update.status.is_terminal() || rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Finaliza a barra e exibe o resultado do job.
    pub fn complete(&self, record: &AuditRecord) {
        self.pb.finish_and_clear();
        match record.status {
            JobStatus::Completed => println!(
                "  {} Report {} stored",
                self.green.apply_to("✓"),
                record.report_id.as_deref().unwrap_or("-")
            ),
            JobStatus::Rejected => {
                println!("  {} {}", self.yellow.apply_to("⚠"), record.message)
            }
            _ => println!("  {} {}", self.red.apply_to("✗"), record.message),
        }
    }
}

fn status_style(status: JobStatus) -> Style {
    match status {
        JobStatus::Completed => Style::new().green().bold(),
        JobStatus::Failed => Style::new().red().bold(),
        JobStatus::Rejected => Style::new().yellow().bold(),
        JobStatus::Pending | JobStatus::Processing => Style::new().cyan(),
    }
}

/// Imprime o registro de auditoria formatado em JSON com estilo colorido.
pub fn print_audit(record: &AuditRecord) {
    println!();
    println!("{}", status_style(record.status).apply_to("─── Audit Record ───"));
    println!(
        "{}",
        serde_json::to_string_pretty(record).unwrap_or_default()
    );
}

/// Lista jobs, um por linha.
pub fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("No jobs yet.");
        return;
    }
    for job in jobs {
        println!(
            "{}  {}  {:>3}%  {}  {}",
            job.id,
            status_style(job.status).apply_to(format!("{:<10}", job.status.to_string())),
            job.progress,
            job.company,
            job.updated_at.format("%Y-%m-%d %H:%M"),
        );
    }
}

/// Informa quantos jobs interrompidos foram marcados como falhos.
pub fn print_recovered(ids: &[String]) {
    if ids.is_empty() {
        println!("No interrupted jobs.");
        return;
    }
    let red = Style::new().red();
    for id in ids {
        println!("  {} {id} marked as failed", red.apply_to("✗"));
    }
}
