pub mod discovery;
pub mod error;
pub mod exchange;
pub mod gate;
pub mod keys;
pub mod principal;
pub mod verifier;

pub use error::AuthError;
pub use gate::AuthGateway;
pub use principal::Principal;
