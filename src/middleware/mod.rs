// Middleware for resilient calls to remote model endpoints

pub mod circuit_breaker;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitPermit, CircuitState};
