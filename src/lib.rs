//! # mcp-gate
//!
//! An OAuth2-guarded tool server and its matching client credential
//! machinery. The server side validates bearer tokens against a single
//! configured identity provider (JWKS-backed signature checks plus
//! issuer, audience, time-window, and scope policy) and gates every
//! operation behind that check. The client side acquires tokens through
//! the device-authorization grant, caches them on disk, and refreshes
//! them silently.
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mcp_gate::{
//!     AuthGate, Dispatcher, GatedServer, HttpJwksFetcher, KeySetCache, TokenValidator,
//!     ToolRegistry, ValidationPolicy,
//! };
//!
//! #[tokio::main]
//! async fn main() -> mcp_gate::Result<()> {
//!     let fetcher = HttpJwksFetcher::new("https://login.example.com/tenant/keys")?;
//!     let keys = Arc::new(KeySetCache::new(Arc::new(fetcher)));
//!     let policy = ValidationPolicy::new("https://login.example.com/tenant/", "api://my-app")
//!         .with_required_scope("execute");
//!     let validator = Arc::new(TokenValidator::new(keys, policy));
//!
//!     let registry = ToolRegistry::new();
//!     let server = GatedServer::new(
//!         AuthGate::new(validator),
//!         Dispatcher::new(Arc::new(registry)),
//!     );
//!
//!     let tools = server.list_tools(Some("Bearer eyJ...")).await?;
//!     println!("{} tools", tools.len());
//!     Ok(())
//! }
//! ```

mod config;
mod credentials;
mod device_flow;
mod error;
mod gate;
mod invocation;
mod keyset;
mod server;
mod token_cache;
mod validator;

pub mod schema;
pub mod testutils;

pub use config::{ClientAuthConfig, IssuerConfig, ValidationPolicy};
pub use credentials::{CredentialManager, DevicePrompt, LogPrompt};
pub use device_flow::{DeviceFlowAuthenticator, DeviceFlowSession, FlowState};
pub use error::{Error, FlowErrorKind, Result, ValidationErrorKind};
pub use gate::{AuthGate, DENIAL_REASON};
pub use invocation::{Dispatcher, ProgressSender, ToolHandler, ToolRegistry};
pub use keyset::{HttpJwksFetcher, JwksFetcher, KeySetCache, SigningKey};
pub use server::GatedServer;
pub use token_cache::{CachedCredential, TokenCacheStore};
pub use validator::TokenValidator;

// Re-export schemars so tool authors derive schemas against the same
// version the crate consumes.
pub use schemars;
