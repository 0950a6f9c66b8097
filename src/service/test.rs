use super::*;
use crate::logger::MemoryLogger;
use crate::testing::FakeConnector;
use chrono::{TimeZone, Timelike};

const UNITS: &str = "\
  cron.service                 loaded    active   running Regular background program processing daemon
  nginx.service                loaded    active   running A high performance web server and a reverse proxy server
  apt-daily.timer              loaded    active   waiting Daily apt download activities
 snapd.service                 not-found inactive dead    snapd.service
broken
";

fn manager(fake: &FakeConnector) -> (ServiceManager, MemoryLogger) {
    let memory = MemoryLogger::new();
    let manager = ServiceManager::new(fake.shared(), &memory.log("test"));
    (manager, memory)
}

fn host() -> FakeConnector {
    let fake = FakeConnector::new("web-01");
    fake.respond("systemctl list-units", UNITS);
    fake
}

#[test]
fn parses_unit_rows() {
    let memory = MemoryLogger::new();
    let units = parse_units(UNITS, &memory.log("test"));

    assert_eq!(4, units.len());
    assert_eq!(
        ServiceRecord {
            unit: "nginx.service".to_string(),
            load: "loaded".to_string(),
            active: "active".to_string(),
            sub: "running".to_string(),
            description: "A high performance web server and a reverse proxy server".to_string(),
        },
        units[1],
    );
    assert_eq!("not-found", units[3].load);
    assert_eq!(vec!["skipping short unit row: \"broken\""], memory.warnings());
}

#[test]
fn strips_status_bullets() {
    let memory = MemoryLogger::new();
    let units = parse_units(
        "\u{25cf} ssh.service loaded failed failed OpenBSD Secure Shell server\n",
        &memory.log("test"),
    );
    assert_eq!("ssh.service", units[0].unit);
    assert_eq!("OpenBSD Secure Shell server", units[0].description);
}

#[test]
fn parses_journal_lines() {
    let text = "\
-- Boot 0b1c2d3e4f --
2024-01-08T22:42:15+0800 web-01 systemd[1]: Started nginx.service - A high performance web server.
2024-01-08T22:42:16+08:00 web-01 nginx[812]: worker process started
2024-01-08T22:43:00+0800 web-01 CRON: pam_unix(cron:session): session opened
not a journal line
";
    let entries = parse_journal(text);
    assert_eq!(3, entries.len());

    let offset = FixedOffset::east_opt(8 * 3600).unwrap();
    assert_eq!(
        offset.with_ymd_and_hms(2024, 1, 8, 22, 42, 15).unwrap(),
        entries[0].timestamp,
    );
    assert_eq!("web-01", entries[0].host);
    assert_eq!("systemd", entries[0].identifier);
    assert_eq!(Some(1), entries[0].pid);
    assert_eq!(
        "Started nginx.service - A high performance web server.",
        entries[0].message,
    );

    assert_eq!(16, entries[1].timestamp.second());
    assert_eq!(Some(812), entries[1].pid);

    assert_eq!("CRON", entries[2].identifier);
    assert_eq!(None, entries[2].pid);
    assert_eq!("pam_unix(cron:session): session opened", entries[2].message);
}

#[test]
fn journal_rejects_bad_timestamps() {
    assert_eq!(None, parse_journal_line("2024-13-45T99:00:00+0000 h x: y"));
    assert_eq!(None, parse_journal_line("-- No entries --"));
}

#[tokio::test]
async fn unit_actions_check_then_elevate() {
    let fake = host();
    let (manager, memory) = manager(&fake);

    manager.start("nginx.service").await.unwrap();
    manager.stop("nginx.service").await.unwrap();
    manager.restart("cron.service").await.unwrap();
    manager.enable("nginx.service").await.unwrap();
    manager.disable("apt-daily.timer").await.unwrap();

    assert_eq!(
        vec![
            "systemctl start nginx.service",
            "systemctl stop nginx.service",
            "systemctl restart cron.service",
            "systemctl enable nginx.service",
            "systemctl disable apt-daily.timer",
        ],
        fake.elevated_commands(),
    );
    assert_eq!(10, fake.commands().len());
    assert!(memory.warnings().iter().all(|w| w.contains("broken")));
}

#[tokio::test]
async fn missing_unit_is_not_found() {
    let fake = host();
    let (manager, _) = manager(&fake);

    assert!(manager.start("postgresql.service").await.unwrap_err().is_not_found());
    assert!(manager.logs("postgresql.service").await.unwrap_err().is_not_found());
    assert!(fake.elevated_commands().is_empty());
    assert!(!fake.commands().iter().any(|c| c.starts_with("journalctl")));
}

#[tokio::test]
async fn logs_runs_journalctl_for_current_boot() {
    let fake = host();
    fake.respond(
        "journalctl",
        "2024-01-08T22:42:15+0800 web-01 systemd[1]: Started Regular background program processing daemon.\n",
    );
    let (manager, _) = manager(&fake);

    let entries = manager.logs("cron.service").await.unwrap();
    assert_eq!(1, entries.len());
    assert_eq!(
        Some(&"journalctl -u cron.service -b -o short-iso".to_string()),
        fake.commands().last(),
    );
}
