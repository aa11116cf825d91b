use deblur_core::{ErrorCategory, ErrorCode, FailureInfo};

/// Structured view of a failure. Pure; the shell decides what to do with it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Classification {
    pub category: ErrorCategory,
    pub code: ErrorCode,
    pub retriable: bool,
}

impl Classification {
    pub fn failure(&self, message: impl Into<String>) -> FailureInfo {
        FailureInfo::new(self.category, self.code, message)
    }
}

pub const RETRIABLE_CODES: [ErrorCode; 6] = [
    ErrorCode::NetworkError,
    ErrorCode::Timeout,
    ErrorCode::RateLimit,
    ErrorCode::ServerError,
    ErrorCode::ConnectionError,
    ErrorCode::TemporaryFailure,
];

pub const NON_RETRIABLE_CODES: [ErrorCode; 6] = [
    ErrorCode::AuthenticationError,
    ErrorCode::InvalidRequest,
    ErrorCode::ValidationError,
    ErrorCode::FileNotFound,
    ErrorCode::PermissionDenied,
    ErrorCode::QuotaExceeded,
];

const NETWORK_TERMS: &[&str] = &["connection", "network", "dns", "resolve", "refused"];
const TIMEOUT_TERMS: &[&str] = &["timeout", "timed out", "time out"];
const API_TERMS: &[&str] = &["api", "http", "status code", "401", "403", "404", "429", "500", "502", "503"];
const IO_TERMS: &[&str] = &["file", "io", "permission", "access", "read", "write", "not found"];
const VALIDATION_TERMS: &[&str] = &["invalid", "validation", "format", "decode", "parse"];

/// Terms short enough to show up inside unrelated words ("validation", "rapid").
const WHOLE_WORD_TERMS: &[&str] = &["io", "api"];

/// Static sets win; the keyword default only applies to codes in neither set.
pub fn is_retriable(code: ErrorCode, keyword_default: bool) -> bool {
    if RETRIABLE_CODES.contains(&code) {
        return true;
    }
    if NON_RETRIABLE_CODES.contains(&code) {
        return false;
    }
    keyword_default
}

/// Keyword scan over the lower-cased message, first match wins.
///
/// This is not a plain substring scan: `io` and `api` only count as whole
/// words, so "Validation failed" is VALIDATION_ERROR rather than a retriable
/// IO_ERROR, and "rapid" or "ratio" never hit the API or IO rules. Pass text
/// without file paths; digits in names like `DSC_0401` still match status codes.
pub fn classify(message: &str) -> Classification {
    let text = message.to_lowercase();
    let (category, code, default_retriable) = scan(&text);
    Classification {
        category,
        code,
        retriable: is_retriable(code, default_retriable),
    }
}

/// Classifies the error together with its whole `source()` chain.
pub fn classify_error(err: &(dyn std::error::Error + 'static)) -> Classification {
    classify(&error_chain(err))
}

pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(e) = source {
        parts.push(e.to_string());
        source = e.source();
    }
    parts.join(": ")
}

fn scan(text: &str) -> (ErrorCategory, ErrorCode, bool) {
    let has = |term: &str| contains_term(text, term);
    let any = |terms: &[&str]| terms.iter().any(|t| contains_term(text, t));

    if any(NETWORK_TERMS) {
        return (ErrorCategory::Network, ErrorCode::NetworkError, true);
    }
    if any(TIMEOUT_TERMS) {
        return (ErrorCategory::Timeout, ErrorCode::Timeout, true);
    }
    if any(API_TERMS) {
        let api = ErrorCategory::Api;
        if has("401") || has("authentication") || has("unauthorized") {
            return (api, ErrorCode::AuthenticationError, false);
        }
        if has("403") || has("forbidden") {
            return (api, ErrorCode::PermissionDenied, false);
        }
        if has("429") || has("rate limit") {
            return (api, ErrorCode::RateLimit, true);
        }
        if has("500") || has("502") || has("503") {
            return (api, ErrorCode::ServerError, true);
        }
        if has("404") || has("not found") {
            return (api, ErrorCode::InvalidRequest, false);
        }
        return (api, ErrorCode::ApiError, true);
    }
    if any(IO_TERMS) {
        if has("not found") || has("no such file") {
            return (ErrorCategory::Io, ErrorCode::FileNotFound, false);
        }
        if has("permission") || has("access") {
            return (ErrorCategory::Io, ErrorCode::PermissionDenied, false);
        }
        return (ErrorCategory::Io, ErrorCode::IoError, true);
    }
    if any(VALIDATION_TERMS) {
        return (ErrorCategory::Validation, ErrorCode::ValidationError, false);
    }
    (ErrorCategory::Unknown, ErrorCode::UnknownError, false)
}

fn contains_term(text: &str, term: &str) -> bool {
    if WHOLE_WORD_TERMS.contains(&term) {
        text.split(|c: char| !c.is_ascii_alphanumeric()).any(|w| w == term)
    } else {
        text.contains(term)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(msg: &str) -> ErrorCode {
        classify(msg).code
    }

    #[test]
    fn network_beats_timeout() {
        let c = classify("Connection refused while waiting, timed out");
        assert_eq!(c.category, ErrorCategory::Network);
        assert!(c.retriable);
    }

    #[test]
    fn timeout_is_retriable() {
        let c = classify("request timeout after 300s");
        assert_eq!((c.category, c.code, c.retriable), (ErrorCategory::Timeout, ErrorCode::Timeout, true));
    }

    #[test]
    fn http_status_codes_are_sub_classified() {
        assert_eq!(code("HTTP 401: Unauthorized"), ErrorCode::AuthenticationError);
        assert_eq!(code("HTTP 403 Forbidden"), ErrorCode::PermissionDenied);
        assert_eq!(code("HTTP 429: slow down"), ErrorCode::RateLimit);
        assert_eq!(code("HTTP 502: bad gateway"), ErrorCode::ServerError);
        assert_eq!(code("api returned 404"), ErrorCode::InvalidRequest);
        assert_eq!(code("HTTP 418: teapot"), ErrorCode::ApiError);

        assert!(!classify("HTTP 401").retriable);
        assert!(classify("HTTP 429").retriable);
        assert!(classify("HTTP 418").retriable);
    }

    #[test]
    fn filesystem_failures() {
        assert_eq!(code("No such file or directory (os error 2)"), ErrorCode::FileNotFound);
        assert_eq!(code("Permission denied (os error 13)"), ErrorCode::PermissionDenied);
        let c = classify("failed to write output");
        assert_eq!((c.code, c.retriable), (ErrorCode::IoError, true));
    }

    #[test]
    fn short_terms_need_whole_words() {
        // "validation" contains "io" and must not be taken for a filesystem error
        let c = classify("Validation failed for prompt");
        assert_eq!(c.category, ErrorCategory::Validation);
        assert!(!c.retriable);
        assert_eq!(code("rapid decode failure"), ErrorCode::ValidationError);
        assert_eq!(code("upstream api said no"), ErrorCode::ApiError);
    }

    #[test]
    fn unknown_is_not_retriable() {
        let c = classify("something odd happened");
        assert_eq!((c.category, c.code, c.retriable), (ErrorCategory::Unknown, ErrorCode::UnknownError, false));
    }

    #[test]
    fn static_sets_override_keyword_default() {
        assert!(is_retriable(ErrorCode::TemporaryFailure, false));
        assert!(!is_retriable(ErrorCode::QuotaExceeded, true));
        assert!(is_retriable(ErrorCode::IoError, true));
        assert!(!is_retriable(ErrorCode::UnknownError, false));
    }

    #[test]
    fn error_chain_is_classified() {
        #[derive(Debug)]
        struct Outer(std::io::Error);
        impl std::fmt::Display for Outer {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("edit failed")
            }
        }
        impl std::error::Error for Outer {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                Some(&self.0)
            }
        }

        let err = Outer(std::io::Error::new(std::io::ErrorKind::TimedOut, "operation timed out"));
        assert_eq!(error_chain(&err), "edit failed: operation timed out");
        assert_eq!(classify_error(&err).code, ErrorCode::Timeout);
    }
}
