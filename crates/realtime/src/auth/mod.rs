//! Authentication boundary for the realtime service
//!
//! Sessions are issued elsewhere; this module only verifies them.

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtError, JwtVerifier};
pub use middleware::{require_auth, AuthState, AuthUser};
