//! systemd operations across a fleet.

use super::{FanOut, Fleet, FleetResult, Member, ServiceFleet};
use crate::config::Settings;
use crate::connector::Connect;
use crate::error::Result;
use crate::logger::Log;
use crate::service::{LogEntry, ServiceManager, ServiceRecord, UnitAction};
use std::sync::Arc;

impl Member for ServiceManager {
    fn host(&self) -> &str {
        ServiceManager::host(self)
    }
}

impl ServiceFleet {
    /// Builds one [ServiceManager] per connector.
    pub fn from_connections(
        connectors: Vec<Arc<dyn Connect>>,
        settings: &Settings,
        log: &Log,
    ) -> Result<Self> {
        let managers = connectors
            .into_iter()
            .map(|connector| ServiceManager::new(connector, log))
            .collect();
        Fleet::new(managers, FanOut::new(settings, log))
    }

    pub async fn list(&self) -> FleetResult<Vec<ServiceRecord>> {
        self.run("list units", |m| async move { m.list().await }).await
    }

    /// Fails with [Error::NotFound](crate::error::Error::NotFound) on members without `unit`.
    pub async fn check(&self, unit: &str) -> FleetResult<()> {
        let unit = unit.to_string();
        self.run("check", move |m| {
            let unit = unit.clone();
            async move { m.check(&unit).await }
        })
        .await
    }

    /// Runs `action` on `unit` on every member that has the unit.
    pub async fn apply(&self, action: UnitAction, unit: &str) -> FleetResult<()> {
        let unit = unit.to_string();
        self.run(&format!("{action} {unit}"), move |m| {
            let unit = unit.clone();
            async move { m.apply(action, &unit).await }
        })
        .await
    }

    pub async fn start(&self, unit: &str) -> FleetResult<()> {
        self.apply(UnitAction::Start, unit).await
    }

    pub async fn stop(&self, unit: &str) -> FleetResult<()> {
        self.apply(UnitAction::Stop, unit).await
    }

    pub async fn restart(&self, unit: &str) -> FleetResult<()> {
        self.apply(UnitAction::Restart, unit).await
    }

    pub async fn enable(&self, unit: &str) -> FleetResult<()> {
        self.apply(UnitAction::Enable, unit).await
    }

    pub async fn disable(&self, unit: &str) -> FleetResult<()> {
        self.apply(UnitAction::Disable, unit).await
    }

    pub async fn logs(&self, unit: &str) -> FleetResult<Vec<LogEntry>> {
        let unit = unit.to_string();
        self.run("logs", move |m| {
            let unit = unit.clone();
            async move { m.logs(&unit).await }
        })
        .await
    }
}
