//! Tipos de erro para o cliente da Assessment API.
//!
//! Define [`ApiError`] com variantes para saldo insuficiente, submissões
//! duplicadas, timeouts, erros HTTP e erros de rede. Usa `thiserror` para
//! derivar `Display` e `Error` a partir dos atributos `#[error(...)]`.

use thiserror::Error;

/// Erros que podem ocorrer ao interagir com a Assessment API.
///
/// - [`InsufficientTokens`](ApiError::InsufficientTokens): o servidor retornou HTTP 402
/// - [`Duplicate`](ApiError::Duplicate): HTTP 409, a chave de idempotência já foi usada
/// - [`Timeout`](ApiError::Timeout): HTTP 408/504 ou prazo local excedido
/// - [`Status`](ApiError::Status): qualquer outro erro HTTP (4xx/5xx)
/// - [`Network`](ApiError::Network): falha na camada de rede
#[derive(Debug, Error)]
pub enum ApiError {
    /// Saldo de tokens insuficiente para processar a avaliação.
    #[error("insufficient tokens: {0}")]
    InsufficientTokens(String),

    /// O servidor já aceitou uma submissão com esta chave de idempotência.
    #[error("duplicate submission: {0}")]
    Duplicate(String),

    /// A requisição excedeu o prazo configurado.
    #[error("request timed out")]
    Timeout,

    /// Erro retornado pela API com o código de status HTTP e o corpo da resposta.
    #[error("API error (status {status}): {message}")]
    Status { status: u16, message: String },

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// O corpo da resposta não pôde ser interpretado.
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Converte uma resposta HTTP de erro na variante correspondente.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            402 => ApiError::InsufficientTokens(message),
            409 => ApiError::Duplicate(message),
            408 | 504 => ApiError::Timeout,
            _ => ApiError::Status { status, message },
        }
    }
}
