//! Credentials and the secret sources they are resolved from

pub mod credentials;
pub mod resolver;
pub mod secrets;
