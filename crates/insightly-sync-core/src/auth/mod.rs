//! Authentication against the Microsoft identity platform.
//!
//! This module provides:
//! - `TokenRefresher`: OAuth2 refresh-token grant for a tenant
//! - `TokenCache`: reuses the access token until it is close to expiry
//! - `AccessToken`: bearer value plus expiry tracking
//!
//! Access tokens are refreshed 5 minutes before they expire.

pub mod cache;
pub mod refresher;
pub mod token;

pub use cache::TokenCache;
pub use refresher::{AuthenticationError, TokenGrant, TokenRefresher};
pub use token::AccessToken;
