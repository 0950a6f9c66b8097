//! Drives every fleet type against simulated hosts, some of which misbehave, and checks that the
//! healthy hosts always get their work done.

use pardus::config::Settings;
use pardus::connector::Connect;
use pardus::fleet::PerMember;
use pardus::logger::MemoryLogger;
use pardus::testing::{FakeConnector, Response};
use pardus::{ConfigFleet, Error, PackageFleet, ServiceFleet};
use std::sync::Arc;

const LISTING: &str = "\
Listing... Done
curl/jammy-updates,now 7.81.0-1ubuntu1.15 amd64 [installed,upgradable to: 7.81.0-1ubuntu1.16]
vim/jammy 2:8.2.3995-1ubuntu2 amd64
";

const UNITS: &str = "  \
ssh.service loaded active running OpenBSD Secure Shell server
";

const JOURNAL: &str = "\
2024-03-01T10:00:00+0000 web-01 systemd[1]: Started OpenBSD Secure Shell server.
2024-03-01T10:05:12+0000 web-01 sshd[812]: Accepted publickey for ops
";

/// Three healthy hosts and one that has dropped off the network.
fn fleet_hosts() -> Vec<FakeConnector> {
    let hosts: Vec<_> = ["web-01", "web-02", "web-03", "web-04"]
        .into_iter()
        .map(FakeConnector::new)
        .collect();
    for host in &hosts {
        host.respond("apt list", LISTING)
            .respond("systemctl list-units", UNITS)
            .respond("journalctl", JOURNAL);
    }
    hosts[2].set_unreachable("connection reset by peer");
    hosts
}

fn shared(hosts: &[FakeConnector]) -> Vec<Arc<dyn Connect>> {
    hosts.iter().map(FakeConnector::shared).collect()
}

#[tokio::test]
async fn package_fleet_isolates_unreachable_host() {
    let hosts = fleet_hosts();
    let memory = MemoryLogger::new();
    let settings = Settings {
        concurrency: 2,
        ..Settings::default()
    };
    let fleet =
        PackageFleet::from_connections(shared(&hosts), &settings, &memory.log("test")).unwrap();

    let upgradable = fleet.list(false, true).await;
    assert_eq!(3, upgradable.succeeded.len());
    assert!(matches!(
        upgradable.error("web-03"),
        Some(Error::Connection { .. })
    ));
    assert!(upgradable.get("web-04").unwrap()[0].is_upgradable());

    let added = fleet
        .add_repository("deb [arch=amd64] https://packages.example.com/apt stable main")
        .await;
    assert_eq!(3, added.succeeded.len());
    let sources = hosts[0]
        .file("/etc/apt/sources.list.d/pardus.list")
        .unwrap();
    assert!(sources.starts_with("# Added by pardus @ "));
    assert!(sources.ends_with("deb [arch=amd64] https://packages.example.com/apt stable main\n"));

    assert_eq!(2, memory.warnings().len());
}

#[tokio::test]
async fn service_fleet_reads_journal_per_host() {
    let hosts = fleet_hosts();
    let fleet = ServiceFleet::from_connections(
        shared(&hosts),
        &Settings::default(),
        &MemoryLogger::new().log("test"),
    )
    .unwrap();

    let logs = fleet.logs("ssh.service").await;
    assert_eq!(1, logs.failed.len());
    let entries = logs.get("web-01").unwrap();
    assert_eq!(2, entries.len());
    assert_eq!("sshd", entries[1].identifier);
    assert_eq!(Some(812), entries[1].pid);

    let missing = fleet.stop("nope.service").await;
    assert_eq!(3, missing.failed.values().filter(|e| e.is_not_found()).count());
}

#[tokio::test]
async fn config_fleet_survives_a_dead_host() {
    let hosts = fleet_hosts();
    hosts[0].put_file("/etc/app/app.ini", "[main]\nmode = legacy\n");
    let memory = MemoryLogger::new();

    let mut fleet = ConfigFleet::from_connections(
        shared(&hosts),
        PerMember::All("/etc/app/app.ini".to_string()),
        None,
        &Settings::default(),
        &memory.log("test"),
    )
    .await
    .unwrap();
    assert_eq!(3, fleet.len());
    assert_eq!(
        Some("[main]\nmode = legacy\n".to_string()),
        hosts[0].file("/etc/app/app.ini.0")
    );

    let result = fleet.set_value("main", "mode", "modern").await;
    assert!(result.is_complete());
    for host in [&hosts[0], &hosts[1], &hosts[3]] {
        assert_eq!(
            Some("[main]\nmode = modern\n\n".to_string()),
            host.file("/etc/app/app.ini")
        );
    }
    assert_eq!(None, hosts[2].file("/etc/app/app.ini"));

    // A host that starts failing later only fails its own part of the batch.
    hosts[3].respond_with("cat > /tmp/", Response::failed(1, "No space left on device"));
    let result = fleet.set_value("main", "level", "debug").await;
    assert_eq!(2, result.succeeded.len());
    assert!(matches!(
        result.error("web-04"),
        Some(Error::Command { .. })
    ));
    assert_eq!(Some("debug"), fleet.value("main", "level"));
}

#[tokio::test]
async fn cancelled_batch_runs_nothing() {
    let hosts = fleet_hosts();
    let memory = MemoryLogger::new();
    let log = memory.log("test");
    let fleet = PackageFleet::from_connections(shared(&hosts), &Settings::default(), &log)
        .unwrap();
    fleet.cancellation_token().cancel();

    let result = fleet.update().await;
    assert_eq!(4, result.failed.len());
    assert!(result.failed.values().all(|e| matches!(e, Error::Cancelled)));
    assert!(hosts.iter().all(|h| h.commands().is_empty()));
}
