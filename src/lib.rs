//! Practice Recorder - records every practice session, hands free.
//!
//! Watches for a USB instrument, starts a MIDI capture as soon as it is
//! plugged in, stops it when it is unplugged and keeps a ledger of every
//! session.

pub mod config;
pub mod device;
pub mod ledger;
pub mod port;
pub mod recorder;
pub mod service;
pub mod utils;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
