//! Public HTTP/HTTPS front end
//!
//! Serves URL pseudo-records as redirects or a reverse proxy. The HTTPS
//! listener picks its certificate per SNI name through the certificate
//! manager (issuing on demand) and shares TLS session state cluster-wide
//! via the key store.

mod pages;
mod server;
mod tls;

pub use pages::ErrorPages;
pub use server::{run_http, run_https, PublicContext};
pub use tls::TlsGateway;
