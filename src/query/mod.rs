pub mod gateway;
pub mod masking;
pub mod validator;

pub use gateway::{DatabaseExecutor, ExecutionError, QueryError, SafetyGateway};
pub use validator::{QueryValidator, ValidationError};
