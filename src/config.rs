use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Application-level constants
pub const APP_NAME: &str = "turbidity";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Listen on every interface.
pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
pub const DEFAULT_PORT: u16 = 5000;

/// Trained weights, relative to the working directory.
pub const MODEL_PATH: &str = "best_turbidity_model.pth";

/// Upper bound on a `/predict` request body (50 MB).
pub const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// Log filter used when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "info,turbidity_lib=debug"
    } else {
        "info"
    }
}

/// Everything the server needs at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub model_path: PathBuf,
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(DEFAULT_HOST, DEFAULT_PORT),
            model_path: PathBuf::from(MODEL_PATH),
            max_upload_bytes: MAX_UPLOAD_BYTES,
        }
    }
}
