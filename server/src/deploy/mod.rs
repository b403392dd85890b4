//! Deploy transport and pipeline state

pub mod client;
pub mod fsm;
pub mod keygen;

/// `Authorization` scheme carrying the API key
pub const AUTH_SCHEME: &str = "swaphost";

/// Server path packages are posted to
pub const DEPLOY_PATH: &str = "/swaphost-system/deploy";
