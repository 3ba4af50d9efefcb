use std::{sync::OnceLock, time::Duration};

use tracing::{debug, warn};

/// Install the aws-lc rustls provider once per process.
///
/// reqwest is built without a bundled provider, so this has to run before
/// the first client is constructed.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the client shared by provider adapters.
///
/// `request_timeout` bounds a whole request; adapters additionally run under
/// the dispatcher's per-call timeout.
pub fn build_provider_client(request_timeout: Duration, user_agent: &str) -> reqwest::Client {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder()
        .user_agent(user_agent)
        .pool_max_idle_per_host(8);

    if request_timeout > Duration::ZERO {
        builder = builder.timeout(request_timeout);
    }

    builder.build().unwrap_or_else(|error| {
        warn!(
            error = %error,
            "Failed to create provider HTTP client; falling back to reqwest defaults"
        );
        reqwest::Client::new()
    })
}
