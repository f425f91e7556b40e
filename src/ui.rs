//! Interface de terminal do assessflow: spinner e saída colorida.
//!
//! O [`TerminalObserver`] implementa [`WorkflowObserver`] e acompanha
//! visualmente um job no terminal usando `indicatif` e `console`.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::api::{RemoteStatus, StatusResponse};
use crate::error::ErrorKind;
use crate::orchestrator::WorkflowObserver;
use crate::state_machine::{AuditRecord, ProgressMeta, WorkflowState};

/// Renderiza os callbacks do workflow como um spinner com mensagens coloridas.
pub struct TerminalObserver {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl TerminalObserver {
    /// Inicia o spinner com o rótulo da avaliação.
    pub fn start(label: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!("{label}: idle"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// Para e limpa o spinner.
    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

impl WorkflowObserver for TerminalObserver {
    fn on_status_change(&self, state: WorkflowState, progress: u8) {
        self.pb.set_message(format!("{state} ({progress}%)"));
    }

    fn on_progress(&self, meta: &ProgressMeta) {
        if let Some(message) = &meta.message {
            let percent = meta.percent.map(|p| format!(" {p}%")).unwrap_or_default();
            self.pb
                .println(format!("  {} {message}{percent}", self.dim.apply_to("·")));
        }
    }

    fn on_complete(&self, result_id: &str) {
        self.pb.println(format!(
            "  {} Assessment completed, result {result_id}",
            self.green.apply_to("✓")
        ));
    }

    fn on_error(&self, kind: ErrorKind, message: &str) {
        let mark = if kind == ErrorKind::Cancelled {
            self.yellow.apply_to("■")
        } else {
            self.red.apply_to("✗")
        };
        self.pb.println(format!("  {mark} {kind}: {message}"));
    }

    fn on_token_balance_update(&self, balance: i64) {
        self.pb
            .println(format!("  {} balance: {balance} tokens", self.yellow.apply_to("◆")));
    }
}

/// Imprime o registro de auditoria formatado em JSON com estilo colorido.
pub fn print_audit(record: &AuditRecord) {
    let style = match record.status {
        WorkflowState::Completed => Style::new().green().bold(),
        WorkflowState::Failed => Style::new().red().bold(),
        _ => Style::new().yellow(),
    };
    println!();
    println!("{}", style.apply_to("─── Audit Record ───"));
    println!(
        "{}",
        serde_json::to_string_pretty(record).unwrap_or_default()
    );
}

/// Imprime uma resposta de status remoto.
pub fn print_status(job_id: &str, status: &StatusResponse) {
    let style = match status.status {
        RemoteStatus::Completed => Style::new().green().bold(),
        RemoteStatus::Failed => Style::new().red().bold(),
        _ => Style::new().cyan(),
    };
    println!(
        "{} {}",
        style.apply_to(format!("{:?}", status.status).to_lowercase()),
        job_id
    );
    if let Some(result_id) = &status.result_id {
        println!("  result: {result_id}");
    }
    if let Some(error) = &status.error {
        println!("  error: {error}");
    }
    if let Some(progress) = status.progress {
        println!("  progress: {progress}%");
    }
    println!("  submitted: {}", status.submitted_at.to_rfc3339());
}
