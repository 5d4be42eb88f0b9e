mod compile;
mod loader;
mod types;
mod validator;

pub use compile::{compile_proxy, CompiledGroup, CompiledProxy, CompiledSniRoute, CompiledSourceRoute};
pub use loader::{load_from_path, load_from_str};
pub use types::{
    AccessLogConfig, CircuitBreakerConfig, ClusterConfig, Config, HealthCheckConfig,
    HealthCheckKind, ListenConfig, LoadBalancingAlgorithm, LoadBalancingConfig, OneOrMany,
    ProxyConfig, RateLimitEntry, RateLimitsConfig, Settings, SniRouteConfig, SourceRouteConfig,
    TargetSpec,
};
pub use validator::validate;
