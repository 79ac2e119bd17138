pub mod auth;
pub mod constants;
pub mod error;
pub mod proxy;
