//! Shared application state.

use gauntlet_core::{Engine, Store};

pub struct AppState {
    pub store: Store,
    pub engine: Engine,
    /// Plain client for connectivity probes; provider calls go through the
    /// engine's adapter client.
    pub probe_http: reqwest::Client,
}

impl AppState {
    pub fn new(store: Store, engine: Engine) -> Self {
        Self {
            store,
            engine,
            probe_http: reqwest::Client::new(),
        }
    }
}
