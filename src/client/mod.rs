//! Resilient client stack: circuit breaker, connection pool, transports
//! and the per-service retry loop.

pub mod breaker;
pub mod pool;
pub mod resilient;
pub mod retry;
pub mod transport;

pub use breaker::{BreakerStatus, CircuitBreaker, CircuitState};
pub use pool::{spawn_pool_sweeper, ConnectionPool, PoolConfig, PoolStats};
pub use resilient::{ClientLifecycle, ClientManager, ResilientClient, ToolInvoker};
pub use retry::RetryPolicy;
pub use transport::{
    Connection, ConnectionFactory, EndpointFactory, HttpConnection, SubprocessConnection,
    PROTOCOL_VERSION,
};
