//! Headlink: the companion-device stack for automotive head-units.
//!
//! A phone *associates* once — a verified key agreement that persists a
//! long-term encryption key — and then *reconnects* on every later drive,
//! authenticating with the stored key and rotating it. Application
//! messages ride an encrypted, ordered, framed stream on top of whatever
//! radio link the injected transport factory provides.
//!
//! Start at [`manager::DeviceConnectionManager`].

pub mod callbacks;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod manager;
pub mod oob;
pub mod secure_channel;
pub mod store;
pub mod stream;
pub mod transport;

pub use callbacks::Executor;
pub use config::Config;
pub use error::ErrorKind;
pub use manager::{
    AssociationCallback, CallbackScope, ConnectedDevice, ConnectionCallback,
    DeviceCallback, DeviceConnectionManager, ManagerError,
};
pub use oob::{OobChannel, OobMaterial, OobRole};
pub use store::{KeyStore, PairedDeviceRecord};
pub use transport::{ConnectionRole, Transport, TransportFactory};

use tracing_subscriber::EnvFilter;

/// Initialize tracing for embedders that have no subscriber of their own.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();
}
