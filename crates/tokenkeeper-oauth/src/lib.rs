//! OAuth2 credential lifecycle: storage, refresh and loopback authorization.
//!
//! - [`TokenStore`] - Durable JSON persistence of a single [`Credential`]
//! - [`RefreshEngine`] - Expiry policy, silent refresh and code exchange
//! - [`CallbackServer`] - Ephemeral listener that receives the OAuth redirect
//! - [`TokenEndpoint`] - Seam between the engine and the provider's token endpoint
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────┐
//!   browser ────▶ │  CallbackServer  │  /callback, /health
//!                 └────────┬─────────┘
//!                          │ complete_auth_flow()
//!                          ▼
//!                 ┌──────────────────┐      ┌────────────────┐
//!                 │  RefreshEngine   │ ───▶ │ TokenEndpoint  │ ──▶ provider
//!                 └────────┬─────────┘      └────────────────┘
//!                          │ load()/save()
//!                          ▼
//!                 ┌──────────────────┐
//!                 │    TokenStore    │  token.json
//!                 └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tokenkeeper_oauth::{ClientSecrets, OAuthConfig, RefreshEngine};
//!
//! let secrets = ClientSecrets::from_file("client_secret.json")?;
//! let engine = Arc::new(RefreshEngine::from_config(OAuthConfig::new(secrets))?);
//! if let Some(credential) = engine.get_credentials().await {
//!     println!("Bearer {}", credential.access_token);
//! }
//! ```

pub mod callback;
pub mod config;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod tokens;

pub use callback::{AuthSession, CallbackConfig, CallbackServer, HealthResponse, build_router};
pub use config::{ClientSecrets, DEFAULT_AUTH_URI, DEFAULT_TOKEN_URI, OAuthConfig};
pub use endpoint::{BoxFuture, HttpTokenEndpoint, TokenEndpoint, TokenResponse};
pub use engine::{AuthorizationRequest, ExpirationStatus, RefreshEngine, generate_state};
pub use error::{AuthError, AuthErrorCode, AuthResult};
pub use tokens::{Credential, TokenStore};
