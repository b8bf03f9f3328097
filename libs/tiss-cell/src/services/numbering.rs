use std::future::Future;

use tracing::warn;

use shared_database::SupabaseError;

use crate::error::TissError;

pub const GUIDE_SEQUENCE_WIDTH: usize = 6;
pub const BATCH_SEQUENCE_WIDTH: usize = 3;
pub const BATCH_GUIDE_INDEX_WIDTH: usize = 4;
pub const MAX_ALLOCATION_ATTEMPTS: u32 = 5;

/// `YYYY` + 6-digit sequence, e.g. `2025000042`.
pub fn format_guide_number(year: i32, sequence: u32) -> String {
    format!("{}{:0width$}", year, sequence, width = GUIDE_SEQUENCE_WIDTH)
}

pub fn guide_number_prefix(year: i32) -> String {
    format!("{}", year)
}

/// `YYYY` + `MM` + 3-digit sequence, e.g. `202501002`.
pub fn format_batch_number(year: i32, month: u32, sequence: u32) -> String {
    format!("{}{:0width$}", batch_number_prefix(year, month), sequence, width = BATCH_SEQUENCE_WIDTH)
}

pub fn batch_number_prefix(year: i32, month: u32) -> String {
    format!("{}{:02}", year, month)
}

/// Guides generated by the monthly job: batch number + 4-digit index, 1-based.
pub fn format_batch_guide_number(batch_number: &str, index: usize) -> String {
    format!("{}{:0width$}", batch_number, index, width = BATCH_GUIDE_INDEX_WIDTH)
}

/// Next sequence after the highest number already allocated in a scope.
///
/// `latest` must carry `prefix` followed by exactly `width` digits; anything
/// else means the scope holds numbers this allocator did not produce.
pub fn next_sequence(latest: Option<&str>, prefix: &str, width: usize) -> Result<u32, TissError> {
    let Some(latest) = latest else {
        return Ok(1);
    };

    let current = latest
        .strip_prefix(prefix)
        .filter(|suffix| suffix.len() == width && suffix.chars().all(|c| c.is_ascii_digit()))
        .and_then(|suffix| suffix.parse::<u32>().ok())
        .ok_or_else(|| {
            TissError::Validation(format!("Número '{}' fora do padrão esperado para {}", latest, prefix))
        })?;

    let max = 10u32.pow(width as u32) - 1;
    if current >= max {
        return Err(TissError::NumberingExhausted(prefix.to_string()));
    }

    Ok(current + 1)
}

/// Runs `attempt` until it succeeds without a uniqueness conflict.
///
/// Each attempt re-reads the latest allocated number, so a conflict means a
/// concurrent writer took the number and the next attempt sees it.
pub async fn allocate_with_retry<T, F, Fut>(scope: &str, mut attempt: F) -> Result<T, TissError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TissError>>,
{
    for n in 1..=MAX_ALLOCATION_ATTEMPTS {
        match attempt(n).await {
            Err(TissError::Database(SupabaseError::Conflict(detail))) => {
                warn!("Number collision for {} (attempt {}/{}): {}", scope, n, MAX_ALLOCATION_ATTEMPTS, detail);
            }
            other => return other,
        }
    }

    Err(TissError::NumberingExhausted(scope.to_string()))
}
