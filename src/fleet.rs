//! Applying one operation to many hosts.
//!
//! A fleet is two things composed: an ordered, non-empty collection of single-host managers
//! ([Members]) and a way to run one operation on all of them at once ([FanOut]).
//!
//! # Failure isolation
//!
//! Every fleet operation returns a [FleetResult], which holds a result or an error for each
//! member. One member failing, timing out, or even panicking never stops the other members and
//! never turns into an error for the whole batch. Each failure is also logged as a warning.
//!
//! A member whose part of an operation takes longer than [Settings::operation_timeout] fails with
//! [Error::Timeout], whatever it was waiting on.
//!
//! # Concurrency and cancellation
//!
//! [FanOut] spawns one task per member and lets at most [Settings::concurrency] of them run at
//! once. Each fleet carries a [CancellationToken]; cancelling it makes members that haven't
//! finished fail with [Error::Cancelled]. A cancelled token stays cancelled, so give the fleet a
//! fresh one with `set_cancellation_token` before reusing it.
//!
//! A slice gets a child of its parent's token: cancelling the parent cancels the slice, but
//! cancelling the slice leaves the parent alone.

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::logger::Log;
use indexmap::IndexMap;
use std::fmt;
use std::future::Future;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod package;
pub mod service;

#[cfg(test)]
mod test;

#[doc(inline)]
pub use self::config::{ConfigFleet, ConfigMember, PerMember};

/// A fleet of [PackageManager](crate::package::PackageManager)s.
pub type PackageFleet = Fleet<crate::package::PackageManager>;

/// A fleet of [ServiceManager](crate::service::ServiceManager)s.
pub type ServiceFleet = Fleet<crate::service::ServiceManager>;

/// Something that can be a member of a fleet.
pub trait Member: Send + Sync + 'static {
    /// The member's host label. See [Connect::host](crate::connector::Connect::host).
    fn host(&self) -> &str;
}

/// Identifies a member in a [FleetResult]: its position in the fleet, and its host.
///
/// The position keeps two members apart even if they point at the same host.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId {
    pub index: usize,
    pub host: String,
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.host, self.index)
    }
}

/// The outcome of a fleet operation: one entry per member, in either `succeeded` or `failed`.
#[derive(Debug)]
pub struct FleetResult<T> {
    pub succeeded: IndexMap<MemberId, T>,
    pub failed: IndexMap<MemberId, Error>,
}

impl<T> Default for FleetResult<T> {
    fn default() -> Self {
        FleetResult {
            succeeded: IndexMap::new(),
            failed: IndexMap::new(),
        }
    }
}

impl<T> FleetResult<T> {
    /// Whether every member succeeded.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// The number of members that reported, successfully or not.
    pub fn len(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the first member result for `host`, if that member succeeded.
    pub fn get(&self, host: &str) -> Option<&T> {
        self.succeeded
            .iter()
            .find(|(id, _)| id.host == host)
            .map(|(_, value)| value)
    }

    /// Returns the first member error for `host`, if that member failed.
    pub fn error(&self, host: &str) -> Option<&Error> {
        self.failed
            .iter()
            .find(|(id, _)| id.host == host)
            .map(|(_, error)| error)
    }
}

/// An ordered, non-empty collection of fleet members.
///
/// Members are shared ([Arc]), so a slice of a fleet works on the same managers as the fleet it
/// came from.
pub struct Members<M> {
    members: Vec<Arc<M>>,
}

impl<M> Clone for Members<M> {
    fn clone(&self) -> Self {
        Members {
            members: self.members.clone(),
        }
    }
}

impl<M: Member> Members<M> {
    /// # Errors
    ///
    /// Returns [Error::NumberOfElements] if `members` is empty.
    pub fn new(members: Vec<M>) -> Result<Self> {
        Self::from_shared(members.into_iter().map(Arc::new).collect())
    }

    pub fn from_shared(members: Vec<Arc<M>>) -> Result<Self> {
        if members.is_empty() {
            return Err(Error::NumberOfElements("a fleet needs at least one member"));
        }
        Ok(Members { members })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always `false`; a [Members] is never empty.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<M>> {
        self.members.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<M>> {
        self.members.iter()
    }

    /// Returns the members in `range`.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidInput] if `range` goes past the end, and
    /// [Error::NumberOfElements] if it selects nothing.
    pub fn slice(&self, range: impl RangeBounds<usize>) -> Result<Self> {
        let start = match range.start_bound() {
            Bound::Included(&i) => i,
            Bound::Excluded(&i) => i.saturating_add(1),
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&i) => i.saturating_add(1),
            Bound::Excluded(&i) => i,
            Bound::Unbounded => self.members.len(),
        };
        if end > self.members.len() {
            return Err(Error::InvalidInput(format!(
                "range ends at {end}, but the fleet has {} members",
                self.members.len(),
            )));
        }
        Self::from_shared(self.members.get(start..end).unwrap_or_default().to_vec())
    }

    /// Removes and returns the member at `index`.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidInput] if `index` is out of bounds, and
    /// [Error::NumberOfElements] if it's the last member.
    pub fn remove(&mut self, index: usize) -> Result<Arc<M>> {
        if index >= self.members.len() {
            return Err(Error::InvalidInput(format!(
                "no member at index {index}; the fleet has {} members",
                self.members.len(),
            )));
        }
        if self.members.len() == 1 {
            return Err(Error::NumberOfElements(
                "cannot remove the last member of a fleet",
            ));
        }
        Ok(self.members.remove(index))
    }

    /// The [MemberId] of each member, in order.
    pub fn ids(&self) -> Vec<MemberId> {
        self.members
            .iter()
            .enumerate()
            .map(|(index, member)| MemberId {
                index,
                host: member.host().to_string(),
            })
            .collect()
    }
}

impl<M: Member> fmt::Debug for Members<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.members.iter().map(|m| m.host()))
            .finish()
    }
}

/// Runs one operation on every member of a [Members], concurrently, with failure isolation.
#[derive(Clone, Debug)]
pub struct FanOut {
    limit: usize,
    timeout: Duration,
    cancel: CancellationToken,
    log: Log,
}

impl FanOut {
    /// Uses [Settings::concurrency] as the limit and [Settings::operation_timeout] as the
    /// per-member deadline.
    pub fn new(settings: &Settings, log: &Log) -> Self {
        Self::with_limit(settings.concurrency, log).with_timeout(settings.operation_timeout())
    }

    /// A limit of 0 is treated as 1. The deadline is the default [Settings::operation_timeout].
    pub fn with_limit(limit: usize, log: &Log) -> Self {
        FanOut {
            limit: limit.max(1),
            timeout: Settings::default().operation_timeout(),
            cancel: CancellationToken::new(),
            log: log.scoped("fleet"),
        }
    }

    /// Sets how long each member may spend on one operation. Time spent waiting for a
    /// concurrency slot doesn't count.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// A copy of this fan-out whose token is a child of this one's.
    pub fn child(&self) -> Self {
        FanOut {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    /// Returns a clone of the token that cancels this fan-out's operations.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn set_cancellation_token(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    /// Calls `operation` on every member and collects the outcomes.
    ///
    /// `name` describes the operation in log messages. The futures returned by `operation` run
    /// as separate tasks, so a panic in one becomes that member's [Error::Task].
    pub async fn run<M, T, F, Fut>(
        &self,
        members: &Members<M>,
        name: &str,
        operation: F,
    ) -> FleetResult<T>
    where
        M: Member,
        T: Send + 'static,
        F: Fn(Arc<M>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.limit));

        let handles: Vec<_> = members
            .ids()
            .into_iter()
            .zip(members.iter())
            .map(|(id, member)| {
                let work = operation(member.clone());
                let semaphore = semaphore.clone();
                let cancel = self.cancel.clone();
                let timeout = self.timeout;
                let operation_name = name.to_string();
                let host = id.host.clone();

                let handle = tokio::spawn(async move {
                    let permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        permit = semaphore.acquire_owned() => permit.ok(),
                    };
                    let Some(_permit) = permit else {
                        return Err(Error::Cancelled);
                    };
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(Error::Cancelled),
                        result = time::timeout(timeout, work) => match result {
                            Ok(result) => result,
                            Err(_) => Err(Error::Timeout {
                                host,
                                command: operation_name,
                                after: timeout,
                            }),
                        },
                    }
                });
                (id, handle)
            })
            .collect();

        let mut result = FleetResult::default();
        for (id, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_error) => Err(Error::Task {
                    member: id.to_string(),
                    reason: join_error.to_string(),
                }),
            };
            match outcome {
                Ok(value) => {
                    result.succeeded.insert(id, value);
                }
                Err(error) => {
                    self.log.warning(format!("{name} failed on {id}: {error}"));
                    result.failed.insert(id, error);
                }
            }
        }

        self.log.notice(format!(
            "{name}: {} succeeded, {} failed",
            result.succeeded.len(),
            result.failed.len(),
        ));
        result
    }
}

/// A fan-out over a [Members] collection: the shape shared by every fleet type.
///
/// [PackageFleet] and [ServiceFleet] are `Fleet`s of their single-host managers, with the
/// operations added in [package] and [service].
pub struct Fleet<M> {
    members: Members<M>,
    fan_out: FanOut,
}

impl<M> Clone for Fleet<M> {
    fn clone(&self) -> Self {
        Fleet {
            members: self.members.clone(),
            fan_out: self.fan_out.clone(),
        }
    }
}

impl<M: Member> Fleet<M> {
    /// # Errors
    ///
    /// Returns [Error::NumberOfElements] if `members` is empty.
    pub fn new(members: Vec<M>, fan_out: FanOut) -> Result<Self> {
        Ok(Fleet {
            members: Members::new(members)?,
            fan_out,
        })
    }

    pub fn from_members(members: Members<M>, fan_out: FanOut) -> Self {
        Fleet { members, fan_out }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always `false`; a fleet is never empty.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<M>> {
        self.members.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<M>> {
        self.members.iter()
    }

    pub fn members(&self) -> &Members<M> {
        &self.members
    }

    /// A new fleet over the members in `range`, sharing them with this one. The slice's
    /// cancellation token is a child of this fleet's.
    pub fn slice(&self, range: impl RangeBounds<usize>) -> Result<Self> {
        Ok(Fleet {
            members: self.members.slice(range)?,
            fan_out: self.fan_out.child(),
        })
    }

    /// Removes the member at `index`. The last member can't be removed.
    pub fn remove_member(&mut self, index: usize) -> Result<Arc<M>> {
        self.members.remove(index)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.fan_out.cancellation_token()
    }

    pub fn set_cancellation_token(&mut self, token: CancellationToken) {
        self.fan_out.set_cancellation_token(token);
    }

    /// Runs `operation` on every member. See [FanOut::run].
    pub async fn run<T, F, Fut>(&self, name: &str, operation: F) -> FleetResult<T>
    where
        T: Send + 'static,
        F: Fn(Arc<M>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.fan_out.run(&self.members, name, operation).await
    }
}

impl<M: Member> fmt::Debug for Fleet<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fleet")
            .field("members", &self.members)
            .field("limit", &self.fan_out.limit())
            .field("timeout", &self.fan_out.timeout())
            .finish()
    }
}
