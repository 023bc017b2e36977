/// Consul endpoint listing every registered service and its tags
pub const CATALOG_SERVICES_PATH: &str = "/v1/catalog/services";

/// Consul endpoint prefix for per-service health, followed by the service name
pub const HEALTH_SERVICE_PATH: &str = "/v1/health/service";

/// Response header carrying the blocking-query index
pub const HEADER_CONSUL_INDEX: &str = "X-Consul-Index";

/// Request header carrying the ACL token
pub const HEADER_CONSUL_TOKEN: &str = "X-Consul-Token";

/// Query parameters understood by blocking queries
pub const QUERY_INDEX: &str = "index";
pub const QUERY_WAIT: &str = "wait";
pub const QUERY_DATACENTER: &str = "dc";
pub const QUERY_PASSING: &str = "passing";

/// Default agent address
pub const DEFAULT_CONSUL_ADDRESS: &str = "http://127.0.0.1:8500";
