use std::{sync::OnceLock, time::Duration};

use tracing::debug;

/// Install the process-wide rustls crypto provider once.
///
/// reqwest is built without a default provider, so this must run before the
/// first client is constructed.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the HTTP client used by outbound transports.
pub fn build_client(
    request_timeout: Duration,
    connect_timeout: Duration,
) -> Result<reqwest::Client, reqwest::Error> {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder()
        .user_agent(concat!("campus-notifier/", env!("CARGO_PKG_VERSION")))
        .pool_max_idle_per_host(8);

    if request_timeout > Duration::ZERO {
        builder = builder.timeout(request_timeout);
    }
    if connect_timeout > Duration::ZERO {
        builder = builder.connect_timeout(connect_timeout);
    }

    builder.build()
}
