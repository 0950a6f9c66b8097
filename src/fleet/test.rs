use super::*;
use crate::document::{ConfigDocument, OpenOptions, Section};
use crate::logger::MemoryLogger;
use crate::testing::{FakeConnector, Response};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const LISTING: &str = "\
Listing... Done
htop/jammy 3.0.5-7build2 amd64 [installed]
nginx/jammy-updates 1.18.0-6ubuntu14.4 all
";

fn hosts(names: &[&str]) -> Vec<FakeConnector> {
    names.iter().map(|name| FakeConnector::new(*name)).collect()
}

fn shared(fakes: &[FakeConnector]) -> Vec<Arc<dyn crate::connector::Connect>> {
    fakes.iter().map(FakeConnector::shared).collect()
}

fn section(pairs: &[(&str, &str)]) -> Section {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Counts how many operations are running at once.
struct Gauge {
    host: String,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Member for Gauge {
    fn host(&self) -> &str {
        &self.host
    }
}

fn gauges(count: usize) -> (Vec<Gauge>, Arc<AtomicUsize>) {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let members = (0..count)
        .map(|i| Gauge {
            host: format!("h{i}"),
            running: running.clone(),
            peak: peak.clone(),
        })
        .collect();
    (members, peak)
}

#[tokio::test]
async fn one_failure_does_not_stop_the_rest() {
    let fakes = hosts(&["web-01", "web-02", "web-03"]);
    for fake in &fakes {
        fake.respond("apt list", LISTING);
    }
    fakes[1].set_unreachable("no route to host");
    let memory = MemoryLogger::new();

    let fleet = PackageFleet::from_connections(
        shared(&fakes),
        &Settings::default(),
        &memory.log("test"),
    )
    .unwrap();
    let result = fleet.list(false, false).await;

    assert_eq!(3, result.len());
    assert!(!result.is_complete());
    assert_eq!(2, result.get("web-01").unwrap().len());
    assert_eq!(2, result.get("web-03").unwrap().len());
    assert!(matches!(
        result.error("web-02"),
        Some(Error::Connection { .. })
    ));

    let ids: Vec<_> = result.succeeded.keys().map(|id| id.index).collect();
    assert_eq!(vec![0, 2], ids);
    assert!(memory
        .warnings()
        .iter()
        .any(|w| w.starts_with("list failed on web-02 (#1)")));
}

#[tokio::test]
async fn package_mutations_reach_every_member() {
    let fakes = hosts(&["a", "b"]);
    for fake in &fakes {
        fake.respond("apt list", LISTING);
    }
    let fleet =
        PackageFleet::from_connections(shared(&fakes), &Settings::default(), &Log::default())
            .unwrap();

    let result = fleet.install(["nginx"]).await;
    assert!(result.is_complete());
    for fake in &fakes {
        assert_eq!(
            vec!["apt install nginx -y"],
            fake.elevated_commands(),
        );
    }

    // htop is installed everywhere, so every member has nothing to do.
    let result = fleet.install(vec!["htop".to_string()]).await;
    assert_eq!(2, result.failed.len());
    assert!(result.failed.values().all(Error::is_not_found));
}

#[tokio::test]
async fn service_fleet_reports_missing_units_per_host() {
    let fakes = hosts(&["a", "b"]);
    fakes[0].respond(
        "systemctl list-units",
        "  nginx.service loaded active running nginx\n",
    );
    fakes[1].respond(
        "systemctl list-units",
        "  cron.service loaded active running cron\n",
    );
    let fleet =
        ServiceFleet::from_connections(shared(&fakes), &Settings::default(), &Log::default())
            .unwrap();

    let result = fleet.restart("nginx.service").await;
    assert!(result.get("a").is_some());
    assert!(result.error("b").unwrap().is_not_found());
    assert_eq!(
        vec!["systemctl restart nginx.service"],
        fakes[0].elevated_commands()
    );
    assert!(fakes[1].elevated_commands().is_empty());
}

#[tokio::test]
async fn empty_fleet_is_rejected() {
    let result = PackageFleet::from_connections(vec![], &Settings::default(), &Log::default());
    assert!(matches!(result, Err(Error::NumberOfElements(_))));
}

#[tokio::test]
async fn concurrency_is_limited() {
    let (members, peak) = gauges(6);
    let fleet = Fleet::new(members, FanOut::with_limit(2, &Log::default())).unwrap();

    let result = fleet
        .run("measure", |gauge| async move {
            let now = gauge.running.fetch_add(1, Ordering::SeqCst) + 1;
            gauge.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            gauge.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

    assert!(result.is_complete());
    assert_eq!(6, result.succeeded.len());
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn cancelled_fleet_fails_every_member() {
    let (members, _) = gauges(3);
    let fleet = Fleet::new(members, FanOut::with_limit(1, &Log::default())).unwrap();
    fleet.cancellation_token().cancel();

    let result: FleetResult<()> = fleet
        .run("wait", |_| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
    assert_eq!(3, result.failed.len());
    assert!(result
        .failed
        .values()
        .all(|e| matches!(e, Error::Cancelled)));
}

#[tokio::test]
async fn panicking_member_becomes_a_task_error() {
    let (members, _) = gauges(2);
    let fleet = Fleet::new(members, FanOut::with_limit(2, &Log::default())).unwrap();

    let result = fleet
        .run("maybe panic", |gauge| async move {
            if gauge.host == "h0" {
                panic!("boom");
            }
            Ok(gauge.host.clone())
        })
        .await;
    assert!(matches!(result.error("h0"), Some(Error::Task { .. })));
    assert_eq!(Some(&"h1".to_string()), result.get("h1"));
}

#[test]
fn slicing_and_removing_members() {
    let (members, _) = gauges(4);
    let mut fleet = Fleet::new(members, FanOut::with_limit(1, &Log::default())).unwrap();

    let middle = fleet.slice(1..3).unwrap();
    let hosts: Vec<_> = middle.iter().map(|m| m.host.as_str()).collect();
    assert_eq!(vec!["h1", "h2"], hosts);
    assert!(Arc::ptr_eq(fleet.get(1).unwrap(), middle.get(0).unwrap()));

    assert!(matches!(fleet.slice(2..9), Err(Error::InvalidInput(_))));
    assert!(matches!(fleet.slice(2..2), Err(Error::NumberOfElements(_))));

    assert!(matches!(fleet.remove_member(4), Err(Error::InvalidInput(_))));
    assert_eq!("h0", fleet.remove_member(0).unwrap().host);
    fleet.remove_member(0).unwrap();
    fleet.remove_member(0).unwrap();
    assert_eq!(1, fleet.len());
    assert!(matches!(
        fleet.remove_member(0),
        Err(Error::NumberOfElements(_))
    ));
}

#[test]
fn extreme_slice_bounds_are_errors() {
    let (members, _) = gauges(3);
    let fleet = Fleet::new(members, FanOut::with_limit(1, &Log::default())).unwrap();

    assert!(matches!(
        fleet.slice((Bound::Excluded(usize::MAX), Bound::Unbounded)),
        Err(Error::NumberOfElements(_))
    ));
    assert!(matches!(
        fleet.slice(0..=usize::MAX),
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        fleet.slice((Bound::Excluded(usize::MAX), Bound::Included(usize::MAX))),
        Err(Error::InvalidInput(_))
    ));
    assert_eq!(3, fleet.slice(0..=2).unwrap().len());
}

#[tokio::test]
async fn cancelling_a_slice_spares_the_parent() {
    let (members, _) = gauges(3);
    let fleet = Fleet::new(members, FanOut::with_limit(3, &Log::default())).unwrap();

    let slice = fleet.slice(..2).unwrap();
    slice.cancellation_token().cancel();
    assert!(!fleet.cancellation_token().is_cancelled());

    let result = fleet.run("ping", |_| async move { Ok(()) }).await;
    assert!(result.is_complete());
    let result = slice.run("ping", |_| async move { Ok(()) }).await;
    assert_eq!(2, result.failed.len());

    let other = fleet.slice(1..).unwrap();
    fleet.cancellation_token().cancel();
    assert!(other.cancellation_token().is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn hung_member_times_out_alone() {
    let (members, _) = gauges(3);
    let memory = MemoryLogger::new();
    let settings = Settings {
        operation_timeout: 30,
        ..Settings::default()
    };
    let fleet = Fleet::new(members, FanOut::new(&settings, &memory.log("test"))).unwrap();
    assert_eq!(Duration::from_secs(30), fleet.fan_out.timeout());

    let result = fleet
        .run("upgrade", |gauge| async move {
            if gauge.host == "h1" {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(gauge.host.clone())
        })
        .await;

    assert_eq!(2, result.succeeded.len());
    match result.error("h1") {
        Some(Error::Timeout {
            host,
            command,
            after,
        }) => {
            assert_eq!("h1", host);
            assert_eq!("upgrade", command);
            assert_eq!(Duration::from_secs(30), *after);
        }
        other => panic!("expected Error::Timeout, got {other:?}"),
    }
    assert!(memory
        .warnings()
        .iter()
        .any(|w| w.starts_with("upgrade failed on h1 (#1)")));
}

#[test]
fn per_member_values_must_match_host_count() {
    assert_eq!(
        vec!["x".to_string(); 3],
        PerMember::All("x".to_string()).resolve(3, "paths").unwrap()
    );
    assert!(matches!(
        PerMember::Each(vec![1, 2]).resolve(3, "paths"),
        Err(Error::InvalidInput(_))
    ));
}

#[tokio::test]
async fn config_fleet_starts_blank_and_mirrors_mutations() {
    let fakes = hosts(&["a", "b"]);
    fakes[0].put_file("/etc/app.ini", "[old]\nkey = value\n");
    let memory = MemoryLogger::new();

    let mut fleet = ConfigFleet::from_connections(
        shared(&fakes),
        PerMember::All("/etc/app.ini".to_string()),
        Some(PerMember::Each(vec!["pw-a".to_string(), "pw-b".to_string()])),
        &Settings::default(),
        &memory.log("test"),
    )
    .await
    .unwrap();

    assert_eq!(2, fleet.len());
    assert!(fleet.sections().is_empty());
    assert_eq!(
        Some("[old]\nkey = value\n".to_string()),
        fakes[0].file("/etc/app.ini.0")
    );
    for fake in &fakes {
        assert_eq!(Some(String::new()), fake.file("/etc/app.ini"));
    }
    assert!(fakes[1]
        .records()
        .iter()
        .filter(|r| r.elevated)
        .all(|r| r.password.as_deref() == Some("pw-b")));

    let result = fleet.set("server", section(&[("port", "80")])).await;
    assert!(result.is_complete());
    let result = fleet.set_value("server", "host", "::").await;
    assert!(result.is_complete());
    assert_eq!(Some("::"), fleet.value("server", "host"));
    for fake in &fakes {
        assert_eq!(
            Some("[server]\nport = 80\nhost = ::\n\n".to_string()),
            fake.file("/etc/app.ini")
        );
    }

    let removed = fleet.remove_value("server", "port").await;
    assert_eq!(Some(&"80".to_string()), removed.get("b"));
    let deleted = fleet.delete("server").await;
    assert!(deleted.is_complete());
    assert!(fleet.section("server").is_none());

    let missing = fleet.delete("server").await;
    assert_eq!(2, missing.failed.len());

    let member = fleet.get(1).unwrap();
    assert!(member.document().await.is_empty());
}

#[tokio::test]
async fn config_fleet_leaves_out_hosts_it_cannot_prepare() {
    let fakes = hosts(&["a", "b", "c"]);
    let memory = MemoryLogger::new();
    let log = memory.log("test");
    let mut documents = Vec::new();
    for fake in &fakes {
        let options = OpenOptions::new().create(true);
        documents.push(
            ConfigDocument::open(fake.shared(), "/etc/app.ini", &options, &log)
                .await
                .unwrap(),
        );
    }
    fakes[1].respond_with("cp", Response::failed(1, "cp: read-only file system"));

    let mut fleet = ConfigFleet::new(documents, FanOut::with_limit(3, &log), &log)
        .await
        .unwrap();
    let hosts: Vec<_> = fleet.iter().map(|m| m.host().to_string()).collect();
    assert_eq!(vec!["a", "c"], hosts);
    assert!(memory
        .warnings()
        .iter()
        .any(|w| w == "leaving b (#1) out of the fleet"));

    fleet
        .update([("a", section(&[("k", "v")]))])
        .await;
    let slice = fleet.slice(1..).unwrap();
    assert_eq!(Some("v"), slice.value("a", "k"));
    assert_eq!(None, fakes[1].file("/etc/app.ini.0"));
    assert_eq!(Some("[a]\nk = v\n\n".to_string()), fakes[2].file("/etc/app.ini"));
}
