use once_cell::sync::OnceCell;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "PEF_INVENTORY_LOG";

static INIT: OnceCell<()> = OnceCell::new();

/// Installs the fmt subscriber once per process. Level comes from `PEF_INVENTORY_LOG`
/// (default `info`).
pub fn init_tracing(service: &str) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
        let installed = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
            .is_ok();
        if installed {
            tracing::debug!("[{}] tracing initialized", service);
        }
    });
}
