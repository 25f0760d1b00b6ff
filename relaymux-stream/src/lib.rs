//! Stream routing core: the per-path fan-out broadcast, the path state
//! machine, the name→path registry and the live session registry.
//!
//! Data flow: a protocol adapter authenticates through
//! [`manager::PathManager`], receives a [`path::PathHandle`] plus a writable
//! or readable [`stream::Stream`], and pushes or consumes typed
//! [`unit::Unit`]s. The admin API observes everything through the same
//! manager and [`session::SessionRegistry`].

pub mod adapter;
pub mod manager;
pub mod path;
pub mod session;
pub mod stream;
pub mod unit;

pub use manager::{AccessRequest, PathManager};
pub use path::{DescribeResult, PathHandle, PathInfo, PathState};
pub use stream::{Stream, StreamReader};
pub use unit::{StreamDesc, Unit, UnitPayload};
