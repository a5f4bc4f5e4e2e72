use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Response of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthStatus {
    /// Overall status, `healthy` or `degraded`.
    pub status: String,

    /// Server time of the check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    /// Per-dependency status, either a bare string or an object with a `status` key.
    #[serde(default)]
    pub services: Map<String, Value>,
}

impl HealthStatus {
    /// Returns true if the backend reports itself healthy.
    pub fn is_healthy(&self) -> bool {
        self.status.eq_ignore_ascii_case("healthy")
    }

    /// Returns the names of services that do not report `healthy`.
    pub fn unhealthy_services(&self) -> Vec<&str> {
        self.services
            .iter()
            .filter(|(_, value)| {
                let status = match value {
                    Value::String(status) => Some(status.as_str()),
                    Value::Object(obj) => obj.get("status").and_then(Value::as_str),
                    _ => None,
                };
                status != Some("healthy")
            })
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_services_listed() {
        let json = r#"{
            "status": "degraded",
            "timestamp": "2025-12-16T10:30:00",
            "services": {
                "api": "healthy",
                "rate_limiter": "healthy",
                "qdrant": {"status": "unhealthy", "error": "connection refused"}
            }
        }"#;
        let health: HealthStatus = serde_json::from_str(json).unwrap();
        assert!(!health.is_healthy());
        assert_eq!(health.unhealthy_services(), vec!["qdrant"]);
    }
}
