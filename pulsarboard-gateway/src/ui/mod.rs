pub mod aggregations;
pub mod environment;
pub mod history;
pub mod mutations;
pub mod reads;

use crate::http::ApiError;

/// Tenant, namespace and topic names travel as single path segments of the
/// admin API, so only the characters Pulsar itself accepts are let through.
pub(crate) fn validate_name(kind: &str, name: &str) -> Result<(), ApiError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '=' | ':'));
    if valid {
        Ok(())
    } else {
        Err(ApiError::bad_request(format!("invalid {} name: {:?}", kind, name)))
    }
}
