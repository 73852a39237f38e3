//! Node-local agent that drains and reboots the node it runs on when the
//! operator asks for it through node conditions.

pub mod actions;
pub mod agent;
pub mod config;
pub mod error;
pub mod host;

pub use error::{Error, Result};

use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub fn init_tracing(default_env: &str, json: bool) {
    let filter = EnvFilter::builder()
        .with_env_var("RUST_LOG")
        .from_env_lossy()
        .add_directive(
            default_env
                .parse()
                .unwrap_or_else(|_| LevelFilter::INFO.into()),
        );

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    let fmt_layer = if json {
        fmt_layer.json().boxed()
    } else {
        fmt_layer.boxed()
    };

    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .try_init();
}
