//! Tracing setup.
//!
//! Console output by default, JSON when `CHATTERBOX_LOG_JSON` is set.
//! The filter comes from `RUST_LOG`, defaulting to info with debug for
//! our own crates.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init(json: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,chatterbox_server=debug,chatterbox_core=debug"));

    if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .json();
        tracing_subscriber::registry().with(filter).with(fmt_layer).try_init()?;
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true);
        tracing_subscriber::registry().with(filter).with(fmt_layer).try_init()?;
    }

    Ok(())
}
