use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use tracing::warn;

/// Health reporting for the long-running loops of a loader process.
///
/// A loader process is only trustworthy while its driver loop (and any
/// auxiliary loops, like the staging janitor) keep making progress. Each loop
/// registers a component with a reporting deadline and pings it on every
/// iteration. The process is healthy only if every registered component has
/// reported within its deadline:
///   - a component that never reported is still starting, and the check fails
///   - a component that reported unhealthy fails the check
///   - a component whose last report is older than its deadline is stalled,
///     and the check fails
#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    /// Last known status of each component, for display in the probe body.
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Set at registration, before the first report.
    Starting,
    /// Healthy as long as the deadline is in the future.
    HealthyUntil(DateTime<Utc>),
    /// The component reported a failure it cannot recover from.
    Unhealthy,
    /// Deadline elapsed without a report.
    Stalled,
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthHandle {
    /// Report the component healthy until its deadline elapses. Must be
    /// called more frequently than the deadline.
    pub fn report_healthy(&self) {
        let until = Utc::now()
            + chrono::Duration::from_std(self.deadline).unwrap_or(chrono::Duration::seconds(30));
        self.report_status(ComponentStatus::HealthyUntil(until));
    }

    pub fn report_unhealthy(&self) {
        self.report_status(ComponentStatus::Unhealthy);
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                map.insert(self.component.clone(), status);
            }
            // Poisoned lock: warn and let the probe fail, the process restarts
            Err(_) => warn!("poisoned HealthRegistry lock"),
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Register a component. The returned handle is passed to the component's
    /// loop, which should report on every iteration.
    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Overall process status, usable directly as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("poisoned HealthRegistry lock");
            return HealthStatus::default();
        };

        let now = Utc::now();
        let mut status = HealthStatus {
            // Unhealthy until at least one component registers.
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, component) in components.iter() {
            let reported = match component {
                ComponentStatus::HealthyUntil(until) if *until > now => component.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(reported, ComponentStatus::HealthyUntil(_)) {
                status.healthy = false;
            }
            status.components.insert(name.clone(), reported);
        }

        if !status.healthy {
            warn!("{} health check failed: {:?}", self.name, status.components);
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn component_lifecycle() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("driver", Duration::from_secs(30));

        // Registered but not yet reported
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("driver"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy();
        assert!(registry.get_status().healthy);

        handle.report_unhealthy();
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("driver"),
            Some(&ComponentStatus::Unhealthy)
        );
    }

    #[test]
    fn stale_report_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("driver", Duration::from_secs(30));

        handle.report_status(ComponentStatus::HealthyUntil(
            Utc::now() - chrono::Duration::seconds(1),
        ));
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("driver"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[test]
    fn all_components_must_be_healthy() {
        let registry = HealthRegistry::new("liveness");
        let driver = registry.register("driver", Duration::from_secs(30));
        let janitor = registry.register("janitor", Duration::from_secs(30));

        driver.report_healthy();
        assert!(!registry.get_status().healthy);

        janitor.report_healthy();
        assert!(registry.get_status().healthy);
    }

    #[test]
    fn into_response_codes() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
