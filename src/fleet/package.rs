//! Package operations across a fleet.

use super::{FanOut, Fleet, FleetResult, Member, PackageFleet};
use crate::config::Settings;
use crate::connector::Connect;
use crate::error::Result;
use crate::logger::Log;
use crate::package::{
    collect_names, PackageDetails, PackageManager, PackageRecord, RepositoryEntry, SearchResult,
};
use std::sync::Arc;

impl Member for PackageManager {
    fn host(&self) -> &str {
        PackageManager::host(self)
    }
}

impl PackageFleet {
    /// Builds one [PackageManager] per connector.
    ///
    /// # Errors
    ///
    /// Returns [Error::NumberOfElements](crate::error::Error::NumberOfElements) if `connectors`
    /// is empty.
    pub fn from_connections(
        connectors: Vec<Arc<dyn Connect>>,
        settings: &Settings,
        log: &Log,
    ) -> Result<Self> {
        let managers = connectors
            .into_iter()
            .map(|connector| {
                PackageManager::new(connector, log)
                    .with_repository_file(settings.repository_file.clone())
            })
            .collect();
        Fleet::new(managers, FanOut::new(settings, log))
    }

    pub async fn repositories(&self) -> FleetResult<Vec<RepositoryEntry>> {
        self.run("repositories", |m| async move { m.repositories().await })
            .await
    }

    pub async fn add_repository(&self, line: &str) -> FleetResult<()> {
        let line = line.to_string();
        self.run("add repository", move |m| {
            let line = line.clone();
            async move { m.add_repository(&line).await }
        })
        .await
    }

    pub async fn update(&self) -> FleetResult<()> {
        self.run("update", |m| async move { m.update().await }).await
    }

    pub async fn upgrade(&self, name: Option<&str>) -> FleetResult<()> {
        let name = name.map(str::to_string);
        self.run("upgrade", move |m| {
            let name = name.clone();
            async move { m.upgrade(name.as_deref()).await }
        })
        .await
    }

    pub async fn list(&self, installed: bool, upgradeable: bool) -> FleetResult<Vec<PackageRecord>> {
        self.run("list", move |m| async move { m.list(installed, upgradeable).await })
            .await
    }

    pub async fn install<I, S>(&self, names: I) -> FleetResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = collect_names(names);
        self.run("install", move |m| {
            let names = names.clone();
            async move { m.install(names).await }
        })
        .await
    }

    pub async fn reinstall<I, S>(&self, names: I) -> FleetResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = collect_names(names);
        self.run("reinstall", move |m| {
            let names = names.clone();
            async move { m.reinstall(names).await }
        })
        .await
    }

    pub async fn remove<I, S>(&self, names: I) -> FleetResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = collect_names(names);
        self.run("remove", move |m| {
            let names = names.clone();
            async move { m.remove(names).await }
        })
        .await
    }

    pub async fn purge<I, S>(&self, names: I) -> FleetResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = collect_names(names);
        self.run("purge", move |m| {
            let names = names.clone();
            async move { m.purge(names).await }
        })
        .await
    }

    pub async fn search(&self, name: &str) -> FleetResult<Vec<SearchResult>> {
        let name = name.to_string();
        self.run("search", move |m| {
            let name = name.clone();
            async move { m.search(&name).await }
        })
        .await
    }

    pub async fn show(&self, name: &str) -> FleetResult<PackageDetails> {
        let name = name.to_string();
        self.run("show", move |m| {
            let name = name.clone();
            async move { m.show(&name).await }
        })
        .await
    }
}
