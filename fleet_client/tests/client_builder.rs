//! Black-box tests against the public surface only — no network
//! access, matching the rest of this crate's test suite.

use fleet_client::{ClientBuilder, Config, Credentials, Error};

fn bot_config() -> Config {
    Config::new(
        Credentials::Bot {
            client_id: "id".into(),
            client_secret: "secret".into(),
            scopes: vec![],
        },
        "https://rest.example.test",
        "https://token.example.test",
        "https://sessions.example.test",
        "wss://ws.example.test",
        "key",
    )
}

#[test]
fn build_rejects_zero_worker_concurrency() {
    let mut config = bot_config();
    config.max_worker_concurrency = 0;
    let result = ClientBuilder::new(config).build();
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn build_succeeds_with_default_config() {
    let config = bot_config();
    let client = ClientBuilder::new(config).build();
    assert!(client.is_ok());
}

#[test]
fn build_accepts_an_event_sink() {
    let config = bot_config();
    let client = ClientBuilder::new(config)
        .on_event(|_event| {})
        .build();
    assert!(client.is_ok());
}
