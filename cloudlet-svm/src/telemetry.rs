//! Tracing subscriber setup for binaries and tests embedding this crate.

use tracing_subscriber::EnvFilter;

/// Install a formatting subscriber filtered by `CLOUDLET_LOG`, then
/// `RUST_LOG`, then `info`.
///
/// Does nothing if a global subscriber is already installed.
pub fn init() {
    let filter = std::env::var("CLOUDLET_LOG")
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!("tracing initialised");
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_twice_is_harmless() {
        super::init();
        super::init();
    }
}
