//! Failure classification
//!
//! Maps captured failure text to an error category using ordered
//! keyword matching. First match wins; `Unknown` is the fallback and is
//! never treated as success.

use serde::{Deserialize, Serialize};

/// Category of a recorded failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    /// Environment could not be created
    Provisioning,
    /// Base toolchain skeleton failed to install or start
    Setup,
    /// Generated source could not be written into the environment
    Write,
    SyntaxError,
    MissingPackage,
    MissingImport,
    RuntimeError,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Provisioning => "provisioning",
            ErrorCategory::Setup => "setup",
            ErrorCategory::Write => "write",
            ErrorCategory::SyntaxError => "syntax-error",
            ErrorCategory::MissingPackage => "missing-package",
            ErrorCategory::MissingImport => "missing-import",
            ErrorCategory::RuntimeError => "runtime-error",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Whether the AI patcher has a realistic shot at this category
    pub fn is_repairable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::SyntaxError
                | ErrorCategory::MissingPackage
                | ErrorCategory::MissingImport
                | ErrorCategory::RuntimeError
        )
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ordered keyword patterns; the first matching entry decides.
const PATTERNS: &[(&str, ErrorCategory)] = &[
    ("cannot find module", ErrorCategory::MissingPackage),
    ("module not found", ErrorCategory::MissingPackage),
    ("npm err! 404", ErrorCategory::MissingPackage),
    ("no matching version found", ErrorCategory::MissingPackage),
    ("does not provide an export", ErrorCategory::MissingImport),
    ("has no exported member", ErrorCategory::MissingImport),
    ("cannot resolve import", ErrorCategory::MissingImport),
    ("unresolved import", ErrorCategory::MissingImport),
    ("syntaxerror", ErrorCategory::SyntaxError),
    ("unexpected token", ErrorCategory::SyntaxError),
    ("unexpected end of input", ErrorCategory::SyntaxError),
    ("parse error", ErrorCategory::SyntaxError),
    ("typeerror", ErrorCategory::RuntimeError),
    ("referenceerror", ErrorCategory::RuntimeError),
    ("rangeerror", ErrorCategory::RuntimeError),
    ("unhandled promise rejection", ErrorCategory::RuntimeError),
    ("econnrefused", ErrorCategory::RuntimeError),
];

/// Classify captured failure text.
pub fn classify(text: &str) -> ErrorCategory {
    let lower = text.to_lowercase();

    for (needle, category) in PATTERNS {
        if let Some(pos) = lower.find(needle) {
            // "Cannot find module './local'" is a missing local import,
            // not an installable package.
            if *category == ErrorCategory::MissingPackage {
                let rest = &lower[pos + needle.len()..];
                if module_is_relative(rest) {
                    return ErrorCategory::MissingImport;
                }
            }
            return *category;
        }
    }

    ErrorCategory::Unknown
}

/// True when the quoted module path after the match starts with `.` or `/`
fn module_is_relative(rest: &str) -> bool {
    rest.trim_start()
        .trim_start_matches(['\'', '"'])
        .starts_with(['.', '/'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_package() {
        assert_eq!(
            classify("Error: Cannot find module 'left-pad'"),
            ErrorCategory::MissingPackage
        );
        assert_eq!(
            classify("npm ERR! 404 Not Found - GET https://registry.npmjs.org/leff-pad"),
            ErrorCategory::MissingPackage
        );
    }

    #[test]
    fn test_relative_module_is_missing_import() {
        assert_eq!(
            classify("Error: Cannot find module './components/Button'"),
            ErrorCategory::MissingImport
        );
    }

    #[test]
    fn test_syntax_error() {
        assert_eq!(
            classify("SyntaxError: Unexpected token '}' in index.js"),
            ErrorCategory::SyntaxError
        );
    }

    #[test]
    fn test_runtime_error() {
        assert_eq!(
            classify("TypeError: Cannot read properties of undefined"),
            ErrorCategory::RuntimeError
        );
    }

    #[test]
    fn test_first_match_wins() {
        // Contains both a missing-package and a runtime keyword; the
        // pattern list is ordered so missing-package decides.
        assert_eq!(
            classify("TypeError happened after: Cannot find module 'chalk'"),
            ErrorCategory::MissingPackage
        );
    }

    #[test]
    fn test_unknown_fallback() {
        assert_eq!(classify("segmentation fault (core dumped)"), ErrorCategory::Unknown);
        assert!(!ErrorCategory::Unknown.is_repairable());
    }
}
