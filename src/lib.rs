//! Tianji: an OpenAI-compatible LLM gateway.
//!
//! Requests enter through [`gateway`], are routed across deployments by
//! [`router`], translated into upstream dialects by [`providers`], and pass
//! through the [`cache`] and [`policy`] layers on the way. Outcomes are reported
//! to [`callbacks`].

pub mod auth;
pub mod cache;
pub mod callbacks;
pub mod config;
mod error;
pub mod gateway;
pub mod policy;
pub mod providers;
pub mod router;
pub mod types;
pub mod utils;

pub use config::{ConfigError, ProxyConfig};
pub use error::{ErrorKind, ProviderError, Result, TianjiError};
pub use gateway::{Gateway, GatewayOptions};
