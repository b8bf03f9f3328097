use thiserror::Error;
use tracing::error;

use shared_database::SupabaseError;
use shared_models::error::AppError;

use crate::models::BatchStatus;

#[derive(Error, Debug)]
pub enum TissError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Transição de status inválida: {from} -> {to}")]
    InvalidStatusTransition { from: BatchStatus, to: BatchStatus },

    #[error("{0}")]
    InvalidBatch(String),

    #[error("Falha no armazenamento do arquivo: {0}")]
    Storage(String),

    #[error("Falha ao interpretar o arquivo: {0}")]
    Parse(String),

    #[error("Falha ao gerar XML: {0}")]
    Xml(String),

    #[error("Não foi possível reservar um número sequencial para {0}")]
    NumberingExhausted(String),

    #[error("Database error: {0}")]
    Database(#[from] SupabaseError),
}

impl From<TissError> for AppError {
    fn from(err: TissError) -> Self {
        match err {
            TissError::Validation(msg) => AppError::ValidationError(msg),
            TissError::NotFound(msg) => AppError::NotFound(msg),
            TissError::Forbidden(msg) => AppError::Forbidden(msg),
            TissError::Conflict(msg) => AppError::Conflict(msg),
            TissError::InvalidBatch(msg) => AppError::BadRequest(msg),
            e @ TissError::InvalidStatusTransition { .. } => AppError::BadRequest(e.to_string()),
            e @ TissError::Parse(_) => AppError::BadRequest(e.to_string()),
            e @ TissError::NumberingExhausted(_) => AppError::Conflict(e.to_string()),
            TissError::Storage(msg) => {
                error!("Storage failure: {}", msg);
                AppError::Internal("Falha ao salvar o arquivo XML".to_string())
            }
            TissError::Xml(msg) => {
                error!("XML serialization failure: {}", msg);
                AppError::Internal("Falha ao gerar o arquivo XML".to_string())
            }
            TissError::Database(SupabaseError::Conflict(msg)) => {
                error!("Unhandled uniqueness conflict: {}", msg);
                AppError::Conflict("Registro já existe".to_string())
            }
            TissError::Database(SupabaseError::NotFound(msg)) => {
                error!("Store resource missing: {}", msg);
                AppError::NotFound("Registro não encontrado".to_string())
            }
            TissError::Database(e) => {
                error!("Database failure: {}", e);
                AppError::Database("Erro ao acessar o banco de dados".to_string())
            }
        }
    }
}
