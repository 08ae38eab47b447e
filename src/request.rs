//! Identify requests and input checks.
//!
//! [`Submission`] is the normalized (email, phone) pair the resolver works on.
//! [`RequestPolicy`] layers the format checks applied to untrusted input at the
//! HTTP boundary on top of that normalization.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Conservative upper bound for an email address (RFC 5321 path limit).
pub const MAX_EMAIL_LEN: usize = 254;

/// Default minimum phone number length.
pub const DEFAULT_MIN_PHONE_LEN: usize = 10;

/// Default maximum phone number length.
pub const DEFAULT_MAX_PHONE_LEN: usize = 15;

const EMAIL_PATTERN: &str = r"^[^@\s]+@[^@\s]+\.[^@\s]+$";
const PHONE_PATTERN: &str = r"^\+?[0-9]+$";

static EMAIL_RE: OnceLock<Option<Regex>> = OnceLock::new();
static PHONE_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn compiled(
    cell: &'static OnceLock<Option<Regex>>,
    pattern: &'static str,
) -> Result<&'static Regex, ValidationError> {
    cell.get_or_init(|| Regex::new(pattern).ok())
        .as_ref()
        .ok_or_else(|| ValidationError::InvalidConfig {
            reason: format!("built-in pattern failed to compile: {pattern}"),
        })
}

fn normalize(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Body of `POST /identify`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    /// Email, if supplied.
    #[serde(default)]
    pub email: Option<String>,
    /// Phone number, if supplied.
    #[serde(default)]
    pub phone_number: Option<String>,
}

impl IdentifyRequest {
    /// Creates a request from borrowed parts.
    #[must_use]
    pub fn new(email: Option<&str>, phone_number: Option<&str>) -> Self {
        Self {
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
        }
    }
}

/// A normalized identify submission: trimmed, empty values dropped, and at
/// least one identifier present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    email: Option<String>,
    phone_number: Option<String>,
}

impl Submission {
    /// Normalizes the inputs.
    ///
    /// # Errors
    /// `ValidationError::MissingIdentifier` when neither value survives trimming.
    pub fn new(email: Option<&str>, phone_number: Option<&str>) -> Result<Self, ValidationError> {
        let email = normalize(email);
        let phone_number = normalize(phone_number);
        if email.is_none() && phone_number.is_none() {
            return Err(ValidationError::MissingIdentifier);
        }
        Ok(Self {
            email,
            phone_number,
        })
    }

    /// The submitted email.
    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    /// The submitted phone number.
    #[must_use]
    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }
}

/// Format rules applied to untrusted identify requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPolicy {
    /// Minimum phone number length, in characters.
    pub min_phone_len: usize,
    /// Maximum phone number length, in characters.
    pub max_phone_len: usize,
    /// Whether emails must look like `local@domain.tld`.
    pub check_email_format: bool,
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self {
            min_phone_len: DEFAULT_MIN_PHONE_LEN,
            max_phone_len: DEFAULT_MAX_PHONE_LEN,
            check_email_format: true,
        }
    }
}

impl RequestPolicy {
    /// Rejects inconsistent bounds.
    ///
    /// # Errors
    /// `ValidationError::InvalidConfig` when a bound is zero or `min > max`.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.min_phone_len == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "min_phone_len must be at least 1".to_string(),
            });
        }
        if self.min_phone_len > self.max_phone_len {
            return Err(ValidationError::InvalidConfig {
                reason: format!(
                    "min_phone_len ({}) exceeds max_phone_len ({})",
                    self.min_phone_len, self.max_phone_len
                ),
            });
        }
        Ok(self)
    }

    /// Normalizes and checks a request.
    ///
    /// A request with no identifier fails with `MissingIdentifier` before any
    /// format check runs.
    ///
    /// # Errors
    /// Any [`ValidationError`] describing the first offending field.
    pub fn check(&self, request: &IdentifyRequest) -> Result<Submission, ValidationError> {
        let submission = Submission::new(request.email.as_deref(), request.phone_number.as_deref())?;

        if let Some(email) = submission.email() {
            if email.len() > MAX_EMAIL_LEN {
                return Err(ValidationError::FieldTooLong {
                    field: "email".to_string(),
                    max_length: MAX_EMAIL_LEN,
                });
            }
            if self.check_email_format && !compiled(&EMAIL_RE, EMAIL_PATTERN)?.is_match(email) {
                return Err(ValidationError::InvalidEmail {
                    value: email.to_string(),
                });
            }
        }

        if let Some(phone) = submission.phone_number() {
            self.check_phone_number(phone)?;
        }

        Ok(submission)
    }

    fn check_phone_number(&self, phone: &str) -> Result<(), ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidPhoneNumber {
            value: phone.to_string(),
            reason,
        };

        if !compiled(&PHONE_RE, PHONE_PATTERN)?.is_match(phone) {
            return Err(invalid(
                "must contain only digits with an optional leading '+'".to_string(),
            ));
        }
        let len = phone.chars().count();
        if len < self.min_phone_len || len > self.max_phone_len {
            return Err(invalid(format!(
                "length must be between {} and {} (got {len})",
                self.min_phone_len, self.max_phone_len
            )));
        }
        Ok(())
    }
}
