#![warn(missing_docs)]

//! ofswitch configuration subsystem: transactional shadowed objects,
//! commit/abort/rollback/dryrun, JSON stats, and snapshots. Drives the
//! dataplane core through a narrow set of create/destroy/enable/
//! disable/config operations.

pub mod datastore;
pub mod error;
pub mod interp;
pub mod name;
pub mod object;
pub mod objects;
pub mod snapshot;
pub mod stats;

pub use datastore::{Datastore, Drivers};
pub use error::{to_response, DatastoreError, DatastoreResult, ErrorKind, Response};
pub use interp::InterpState;
pub use name::{escape_name, split_fullname, RefOp};
pub use object::Which;
pub use snapshot::Snapshot;
