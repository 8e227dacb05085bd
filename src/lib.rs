//! Grocery cart sync engine.
//!
//! Keeps a local, optimistically updated copy of a retailer cart in step
//! with the cart API. The [`CartSyncController`] is the only writer; the
//! render layer subscribes to [`CartChange`] and [`Notice`] broadcasts.

pub mod api;
pub mod config;
pub mod controller;
pub mod db;
pub mod debounce;
pub mod error;
pub mod import;
pub mod key_lock;
pub mod logging;
pub mod model;
pub mod notice;
pub mod render;
pub mod retry;
pub mod view_model;

#[cfg(test)]
mod test_support;

pub use api::{CartApi, HttpCartApi};
pub use config::{CartSyncConfig, LogConfig};
pub use controller::{CartSyncController, MutationState, PendingMutation};
pub use error::CartError;
pub use import::ImportReport;
pub use model::{CartItem, CartTotals, ClearScope, Modality, ModalityFilter};
pub use notice::{Notice, NoticeLevel};
pub use view_model::{CartChange, CartView};

/// Version string with the git SHA and build time embedded by `build.rs`.
pub const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("BUILD_GIT_SHA"),
    ", built ",
    env!("BUILD_TIMESTAMP"),
    ")"
);
