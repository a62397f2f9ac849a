//! Static response bodies
//!
//! Operators can point `public.errors.*` at their own HTML; these builtins
//! cover the rest.

use tracing::warn;

use pendingdns_config::PublicConfig;

const DEFAULT_404: &str = r#"<!DOCTYPE html>
<html>
<head><title>Not Found</title></head>
<body>
<h1>404 Not Found</h1>
<p>No site is configured for this hostname.</p>
</body>
</html>
"#;

const DEFAULT_500: &str = r#"<!DOCTYPE html>
<html>
<head><title>Server Error</title></head>
<body>
<h1>500 Internal Server Error</h1>
<p>The request could not be completed.</p>
</body>
</html>
"#;

const REDIRECT_STUB: &str = r#"<!DOCTYPE html>
<html>
<head><title>Moved</title></head>
<body>
<h1>Moved Permanently</h1>
<p>This document has moved.</p>
</body>
</html>
"#;

/// Pre-rendered response bodies, loaded once at startup.
#[derive(Debug, Clone)]
pub struct ErrorPages {
    pub not_found: String,
    pub server_error: String,
    pub redirect_stub: String,
}

impl ErrorPages {
    /// Load operator templates where configured, fall back to builtins.
    pub fn load(config: &PublicConfig) -> Self {
        Self {
            not_found: read_template(config.errors.error404.as_deref(), DEFAULT_404),
            server_error: read_template(config.errors.error500.as_deref(), DEFAULT_500),
            redirect_stub: REDIRECT_STUB.to_string(),
        }
    }
}

impl Default for ErrorPages {
    fn default() -> Self {
        Self {
            not_found: DEFAULT_404.to_string(),
            server_error: DEFAULT_500.to_string(),
            redirect_stub: REDIRECT_STUB.to_string(),
        }
    }
}

fn read_template(path: Option<&str>, fallback: &str) -> String {
    match path {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(body) => body,
            Err(e) => {
                warn!(path = %path, error = %e, "error template unreadable; using builtin");
                fallback.to_string()
            }
        },
        None => fallback.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_html() {
        let pages = ErrorPages::default();
        assert!(pages.not_found.contains("404"));
        assert!(pages.server_error.contains("500"));
        assert!(pages.redirect_stub.contains("Moved"));
    }

    #[test]
    fn test_missing_template_falls_back() {
        let pages = ErrorPages::load(&PublicConfig::default());
        assert!(pages.not_found.contains("404"));
    }
}
