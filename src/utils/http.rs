use std::time::Duration;

use once_cell::sync::Lazy;
use reqwest::Client;

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .expect("Failed to build HTTP client")
});

/// Shared client for all outbound API calls. Long-running requests set
/// their own per-request timeout on top of the 30s default.
pub fn http_client() -> &'static Client {
    &HTTP_CLIENT
}
