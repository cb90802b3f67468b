//! The engine never touches the operating system directly. Everything it needs from the outside
//! world goes through the traits in this crate, so tests can swap in the in-memory versions from
//! [`testing`].

mod cancel;
mod context;
mod fs;
mod launcher;

pub use cancel::CancellationToken;
pub use context::{Context, DefaultContext};
pub use fs::{DefaultFilesystem, Filesystem, RetryPolicy};
pub use launcher::{LaunchError, LaunchOutput, LaunchRequest, Launcher, ProcessLauncher};

#[cfg(any(test, feature = "testing"))]
pub mod testing;
