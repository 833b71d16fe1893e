//! Authentication strategies for SSH connections.
//!
//! Each credential kind is an [`AuthStrategy`]; an [`AuthChain`] tries its
//! strategies in order and stops at the first success.
//!
//! # Available Strategies
//!
//! - [`PasswordAuth`]: Password-based authentication
//! - [`KeyAuth`]: Private key file on the relay host
//! - [`InlineKeyAuth`]: Private key material sent by the client
//! - [`AgentAuth`]: SSH agent authentication
//!
//! # Example
//!
//! ```ignore
//! let chain = AuthChain::from_credential(params.credential.as_ref());
//! chain.authenticate(&mut handle, &params.username).await?;
//! ```

mod agent;
mod chain;
mod key;
mod password;
mod traits;

pub use agent::AgentAuth;
pub use chain::AuthChain;
pub use key::{InlineKeyAuth, KeyAuth};
pub use password::PasswordAuth;
pub use traits::AuthStrategy;
