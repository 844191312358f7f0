//! Process-wide default `rustls` crypto provider
//!
//! `tokio-rustls`/`rustls` need exactly one default `CryptoProvider` installed per process
//! before any TLS connection (client or server) can be built. Installed once, idempotently, so
//! both `main()` and unit tests that exercise TLS machinery directly can call this safely.

use std::sync::Once;

static INSTALL: Once = Once::new();

pub fn ensure_installed() {
    INSTALL.call_once(|| {
        // `install_default` fails only if a provider is already installed (e.g. by another
        // dependency's own init path); either way, one is now in place.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
