use std::net::SocketAddr;

use figment::{
    providers::Env,
    Figment,
};
use serde::{
    Deserialize,
    Serialize,
};

const PREFIX: &str = "GAVEL_AUCTIONEER_";

/// The single config for creating a gavel-auctioneer service.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Config {
    /// Socket address the HTTP/websocket listener binds.
    pub listen_addr: SocketAddr,
    /// Log level for the service.
    pub log: String,
    /// Set to true to disable the metrics exporter.
    pub no_metrics: bool,
    /// The endpoint which will be listened on for serving prometheus metrics.
    pub metrics_http_listener_addr: SocketAddr,
}

/// Reads the configuration from `GAVEL_AUCTIONEER_`-prefixed environment
/// variables.
///
/// # Errors
/// Returns an error if a variable is missing or fails to parse.
pub fn get() -> Result<Config, figment::Error> {
    Figment::new().merge(Env::prefixed(PREFIX)).extract()
}
