pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod layout;
pub mod local_store;
pub mod mirror;
pub mod model;
pub mod payload;
pub mod reconcile;
pub mod snapshot;
pub mod util;
pub mod vault;

pub use error::{Error, Result};
pub use vault::Vault;
