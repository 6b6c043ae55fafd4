pub mod circuit_breaker;
pub mod error;
pub mod partial_success;
pub mod retry;
