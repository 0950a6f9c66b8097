//! Fleet administration of Debian-family hosts over SSH.
//!
//! # Layers
//!
//! Pardus is built from small pieces that each manage one host, plus fleets that apply them to
//! many hosts at once.
//!
//! 1. A [Connect] implementation runs commands on one host, optionally elevated through `sudo`.
//!    [SshConnector](connector::SshConnector) logs in with keys and
//!    [PasswordConnector](connector::PasswordConnector) with a password;
//!    [connector::connect] picks one.
//!
//! 2. Single-host managers turn command output into typed records:
//!    [PackageManager] drives `apt`, [ServiceManager] drives `systemctl` and `journalctl`, and
//!    [ConfigDocument] and [RawDocument] edit remote files with write-through semantics.
//!
//! 3. Fleets ([PackageFleet], [ServiceFleet] and [ConfigFleet]) run one operation on every member
//!    concurrently. One host failing never fails the batch; every operation returns a
//!    [FleetResult] with a result or an error per host.
//!
//! Anything that ends up on a remote command line goes through [sanitize] first.
//!
//! # Logging
//!
//! Every component takes a [Log](logger::Log) when it's built. The default sink forwards to
//! [tracing]; installing a subscriber is up to the application.

pub mod config;
pub mod connector;
pub mod document;
pub mod error;
pub mod fleet;
pub mod logger;
pub mod package;
pub mod remote_file;
pub mod sanitize;
pub mod service;

#[doc(hidden)]
pub mod testing;

#[doc(inline)]
pub use connector::Connect;
#[doc(inline)]
pub use document::{ConfigDocument, RawDocument};
#[doc(inline)]
pub use error::{Error, Result};
#[doc(inline)]
pub use fleet::{ConfigFleet, FleetResult, PackageFleet, ServiceFleet};
#[doc(inline)]
pub use package::PackageManager;
#[doc(inline)]
pub use service::ServiceManager;
