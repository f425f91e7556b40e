//! Configuração do assessflow carregada a partir de `assessflow.toml`.
//!
//! A struct [`AssessflowConfig`] contém todos os parâmetros configuráveis,
//! agrupados em seções (`[timeouts]`, `[polling]`, `[retry]`, `[guard]`).
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `ASSESSFLOW_API_TOKEN` tem precedência sobre o arquivo.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::monitor::{MonitorSettings, PollPolicy};
use crate::orchestrator::WorkflowConfig;
use crate::state_machine::RetryConfig;

pub const DEFAULT_PATH: &str = "assessflow.toml";
pub const TOKEN_ENV: &str = "ASSESSFLOW_API_TOKEN";

/// Configuração de nível superior carregada de `assessflow.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct AssessflowConfig {
    /// URL base da Assessment API (`/assessment/*`).
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// URL base do ledger de tokens (`/tokens/*`).
    #[serde(default = "default_api_url")]
    pub ledger_url: String,

    /// Endpoint WebSocket do canal push.
    #[serde(default = "default_push_url")]
    pub push_url: String,

    /// Token bearer usado na API, no ledger e na autenticação do canal push.
    #[serde(default)]
    pub api_token: String,

    /// Custo em tokens de uma avaliação.
    #[serde(default = "default_assessment_cost")]
    pub assessment_cost: u64,

    /// Bônus concedido após o commit de uma avaliação concluída.
    #[serde(default = "default_completion_bonus")]
    pub completion_bonus: u64,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub guard: GuardConfig,
}

/// Prazos, em milissegundos.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsConfig {
    /// Guarda curta sobre `validating` + `submitting`.
    #[serde(default = "default_submission_ms")]
    pub submission_ms: u64,
    /// Teto longo sobre `queued` + `processing`.
    #[serde(default = "default_job_ceiling_ms")]
    pub job_ceiling_ms: u64,
    #[serde(default = "default_push_auth_ms")]
    pub push_auth_ms: u64,
    #[serde(default = "default_request_ms")]
    pub request_ms: u64,
    #[serde(default = "default_ledger_ms")]
    pub ledger_ms: u64,
}

/// Política do canal de polling e de reconexão do canal push.
#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_processing_delay_ms")]
    pub processing_delay_ms: u64,
    #[serde(default = "default_queued_delay_ms")]
    pub queued_delay_ms: u64,
    #[serde(default)]
    pub completed_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_push_reconnect_ms")]
    pub push_reconnect_ms: u64,
    #[serde(default = "default_push_reconnect_attempts")]
    pub push_reconnect_attempts: u32,
}

/// Retentativas do envio, antes de existir um `jobId`.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

/// Janelas do guarda de idempotência.
#[derive(Debug, Clone, Deserialize)]
pub struct GuardConfig {
    /// Quanto tempo uma submissão pendente segura a chave.
    #[serde(default = "default_pending_ttl_ms")]
    pub pending_ttl_ms: u64,
    /// Quanto tempo um `jobId` resolvido continua sendo devolvido para a mesma chave.
    #[serde(default = "default_replay_window_ms")]
    pub replay_window_ms: u64,
}

fn default_api_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_push_url() -> String {
    "ws://localhost:8080/realtime".to_string()
}

fn default_assessment_cost() -> u64 {
    2
}

fn default_completion_bonus() -> u64 {
    5
}

fn default_submission_ms() -> u64 {
    30_000
}

fn default_job_ceiling_ms() -> u64 {
    600_000
}

fn default_push_auth_ms() -> u64 {
    5_000
}

fn default_request_ms() -> u64 {
    15_000
}

fn default_ledger_ms() -> u64 {
    10_000
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_processing_delay_ms() -> u64 {
    2_000
}

fn default_queued_delay_ms() -> u64 {
    5_000
}

fn default_max_attempts() -> u32 {
    150
}

fn default_push_reconnect_ms() -> u64 {
    10_000
}

fn default_push_reconnect_attempts() -> u32 {
    3
}

// Valor padrão para retentativas do envio: 2.
fn default_max_retries() -> u32 {
    2
}

// Valor padrão para o atraso base: 500ms.
fn default_base_delay_ms() -> u64 {
    500
}

fn default_pending_ttl_ms() -> u64 {
    60_000
}

fn default_replay_window_ms() -> u64 {
    300_000
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            submission_ms: default_submission_ms(),
            job_ceiling_ms: default_job_ceiling_ms(),
            push_auth_ms: default_push_auth_ms(),
            request_ms: default_request_ms(),
            ledger_ms: default_ledger_ms(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            processing_delay_ms: default_processing_delay_ms(),
            queued_delay_ms: default_queued_delay_ms(),
            completed_delay_ms: 0,
            max_attempts: default_max_attempts(),
            push_reconnect_ms: default_push_reconnect_ms(),
            push_reconnect_attempts: default_push_reconnect_attempts(),
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            pending_ttl_ms: default_pending_ttl_ms(),
            replay_window_ms: default_replay_window_ms(),
        }
    }
}

impl Default for AssessflowConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            ledger_url: default_api_url(),
            push_url: default_push_url(),
            api_token: String::new(),
            assessment_cost: default_assessment_cost(),
            completion_bonus: default_completion_bonus(),
            timeouts: TimeoutsConfig::default(),
            polling: PollingConfig::default(),
            retry: RetrySection::default(),
            guard: GuardConfig::default(),
        }
    }
}

impl AssessflowConfig {
    /// Carrega a configuração de `path`, ou de `assessflow.toml` no diretório atual.
    ///
    /// Um caminho explícito precisa existir; o arquivo padrão é opcional e,
    /// se ausente, os valores padrão são usados.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_PATH).exists() => Self::from_file(Path::new(DEFAULT_PATH))?,
            None => Self::default(),
        };

        // Variável de ambiente tem precedência sobre o arquivo para o token.
        config.apply_token_override(std::env::var(TOKEN_ENV).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str::<AssessflowConfig>(&contents)
            .with_context(|| format!("invalid configuration in {}", path.display()))
    }

    fn apply_token_override(&mut self, token: Option<String>) {
        if let Some(token) = token
            && !token.is_empty()
        {
            self.api_token = token;
        }
    }

    /// Rejeita combinações que tornariam o workflow incapaz de terminar.
    pub fn validate(&self) -> Result<()> {
        if self.polling.max_attempts == 0 {
            bail!("polling.max_attempts must be at least 1");
        }
        if !self.polling.backoff_multiplier.is_finite() || self.polling.backoff_multiplier < 1.0 {
            bail!("polling.backoff_multiplier must be a finite number >= 1");
        }
        if self.polling.max_delay_ms == 0 {
            bail!("polling.max_delay_ms must be positive");
        }
        if self.polling.push_reconnect_ms == 0 {
            bail!("polling.push_reconnect_ms must be positive");
        }
        if self.timeouts.submission_ms >= self.timeouts.job_ceiling_ms {
            bail!("timeouts.submission_ms must be shorter than timeouts.job_ceiling_ms");
        }
        Ok(())
    }

    pub fn poll_policy(&self) -> PollPolicy {
        let p = &self.polling;
        PollPolicy {
            initial_delay: Duration::from_millis(p.initial_delay_ms),
            backoff_multiplier: p.backoff_multiplier,
            max_delay: Duration::from_millis(p.max_delay_ms),
            processing_delay: Duration::from_millis(p.processing_delay_ms),
            queued_delay: Duration::from_millis(p.queued_delay_ms),
            completed_delay: Duration::from_millis(p.completed_delay_ms),
            max_attempts: p.max_attempts,
        }
    }

    /// Converte a configuração de arquivo nos parâmetros do workflow.
    pub fn workflow_config(&self) -> WorkflowConfig {
        WorkflowConfig {
            assessment_cost: self.assessment_cost,
            completion_bonus: self.completion_bonus,
            submission_timeout: Duration::from_millis(self.timeouts.submission_ms),
            job_ceiling: Duration::from_millis(self.timeouts.job_ceiling_ms),
            ledger_timeout: Duration::from_millis(self.timeouts.ledger_ms),
            retry: RetryConfig {
                max_retries: self.retry.max_retries,
                base_delay_ms: self.retry.base_delay_ms,
            },
            monitor: MonitorSettings {
                poll: self.poll_policy(),
                auth_token: self.api_token.clone(),
                auth_deadline: Duration::from_millis(self.timeouts.push_auth_ms),
                reconnect_interval: Duration::from_millis(self.polling.push_reconnect_ms),
                reconnect_attempts: self.polling.push_reconnect_attempts,
            },
            pending_ttl: Duration::from_millis(self.guard.pending_ttl_ms),
            replay_window: Duration::from_millis(self.guard.replay_window_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.request_ms)
    }

    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.ledger_ms)
    }
}
