#![forbid(unsafe_code)]

//! Task lifecycle engine for the Hauler orchestrator.
//!
//! Three worker loops drive every task from submission to completion:
//! the [`Resolver`] obtains the file manifest from the provider, the
//! [`Dispatcher`] admits tasks under the disk reservation model and
//! starts per-file downloads, and the [`ProgressMonitor`] reconciles
//! on-disk byte counts back into the store. The [`TaskService`] facade
//! is the surface consumed by the HTTP layer, and [`TaskFeed`] is the
//! live subscription object it hands to streaming clients.
//!
//! Nothing in here is a singleton: the composition root constructs the
//! pieces and passes them in, and every loop iteration is independent,
//! logging internal failures and carrying on. All authoritative state
//! lives in the task store, so a restart re-enters the correct state
//! from store contents alone.

mod admission;
mod cancel;
mod dispatcher;
mod feed;
mod monitor;
mod oplog;
mod resolver;
mod service;

pub use admission::{AdmissionController, DiskProbe, StatvfsProbe};
pub use cancel::CancelRegistry;
pub use dispatcher::Dispatcher;
pub use feed::{FeedFrame, TaskFeed};
pub use monitor::ProgressMonitor;
pub use resolver::Resolver;
pub use service::{ServiceError, SubmitOutcome, SubmitRequest, TaskService};
