//! Persisted settings, secrets and on-disk layout.

mod paths;
mod settings;

pub use paths::Paths;
pub use settings::{
    ApiCredentials, Connectivity, HttpsConfig, Settings, Timings, TokenPair,
};
