use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{AppError, FieldError};

/// Usernames: 3–50 chars from `[A-Za-z0-9_]`.
pub static USERNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]{3,50}$").expect("username regex is valid"));

/// Convert [`validator::ValidationErrors`] into the 422 error shape with one
/// `{field, message}` entry per failed field. Shared across all handler
/// modules.
pub fn validation_error(e: validator::ValidationErrors) -> AppError {
    let details: Vec<FieldError> = e
        .field_errors()
        .iter()
        .flat_map(|(field, errors)| {
            errors.iter().map(move |err| FieldError {
                field: field.to_string(),
                message: err
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "invalid value".to_string()),
            })
        })
        .collect();

    AppError::Validation(details)
}

#[cfg(test)]
mod tests {
    use super::*;
    use validator::Validate;

    #[derive(Validate)]
    struct Probe {
        #[validate(length(min = 3, max = 50, message = "must be 3-50 characters"))]
        username: String,
        #[validate(length(min = 8, message = "must be at least 8 characters"))]
        password: String,
    }

    #[test]
    fn username_pattern_accepts_valid_names() {
        assert!(USERNAME_RE.is_match("alice"));
        assert!(USERNAME_RE.is_match("Alice_42"));
        assert!(USERNAME_RE.is_match("a_b"));
    }

    #[test]
    fn username_pattern_rejects_invalid_names() {
        assert!(!USERNAME_RE.is_match("ab"));
        assert!(!USERNAME_RE.is_match("has space"));
        assert!(!USERNAME_RE.is_match("dash-ed"));
        assert!(!USERNAME_RE.is_match(&"x".repeat(51)));
        assert!(!USERNAME_RE.is_match(""));
    }

    #[test]
    fn validation_error_carries_field_details() {
        let probe = Probe {
            username: "ab".into(),
            password: "short".into(),
        };
        let err = probe.validate().unwrap_err();

        let AppError::Validation(details) = validation_error(err) else {
            panic!("expected a Validation error");
        };
        assert_eq!(details.len(), 2);
        assert!(details.iter().any(|d| d.field == "username"));
        assert!(details.iter().any(|d| d.field == "password"));
    }
}
