//! Shared constants for structured API errors.

pub const ERROR_TYPE_API: &str = "api_error";
pub const ERROR_TYPE_TIMEOUT: &str = "timeout_error";
pub const ERROR_TYPE_INVALID_REQUEST: &str = "invalid_request_error";
pub const ERROR_TYPE_AUTHENTICATION: &str = "authentication_error";
pub const ERROR_TYPE_PERMISSION: &str = "permission_error";
pub const ERROR_TYPE_NOT_FOUND: &str = "not_found_error";
pub const ERROR_TYPE_RATE_LIMIT: &str = "rate_limit_error";
pub const ERROR_TYPE_OVERLOADED: &str = "overloaded_error";

/// Claude error `type` for an HTTP status.
pub fn error_type_for_status(status: u16) -> &'static str {
    match status {
        400 | 413 | 422 => ERROR_TYPE_INVALID_REQUEST,
        401 => ERROR_TYPE_AUTHENTICATION,
        403 => ERROR_TYPE_PERMISSION,
        404 => ERROR_TYPE_NOT_FOUND,
        408 | 504 => ERROR_TYPE_TIMEOUT,
        429 => ERROR_TYPE_RATE_LIMIT,
        503 | 529 => ERROR_TYPE_OVERLOADED,
        _ => ERROR_TYPE_API,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_for_status() {
        assert_eq!(error_type_for_status(400), "invalid_request_error");
        assert_eq!(error_type_for_status(401), "authentication_error");
        assert_eq!(error_type_for_status(429), "rate_limit_error");
        assert_eq!(error_type_for_status(504), "timeout_error");
        assert_eq!(error_type_for_status(529), "overloaded_error");
        assert_eq!(error_type_for_status(500), "api_error");
        assert_eq!(error_type_for_status(502), "api_error");
    }
}
