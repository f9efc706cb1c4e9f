//! # sca-core: The data model of the analysis service
//!
//! Plain types shared by the store, the hub and the CLI:
//!
//! - [`model`]: jobs, their status machine and the two-level result tree
//!   (fault records holding violations and feeder records).
//! - [`filter`]: typed filter descriptors and the field catalogue that says
//!   which dot-path addresses which entity.
//! - [`page`]: page requests, sort resolution and the in-memory feeder sort.
//! - [`registry`]: the in-flight bookkeeping behind run/cancel coordination.
//!
//! Nothing here performs I/O.

pub mod filter;
pub mod model;
pub mod page;
pub mod registry;

pub use filter::{DataType, FilterDescriptor, FilterError, FilterOperator, FilterScope};
pub use model::{
    FaultResult, FaultResultView, FeederResult, FeederResultView, Job, JobId, JobStatus,
    ResultTree, Violation,
};
pub use page::{Direction, Page, PageRequest, SortOrder};
pub use registry::{Admission, InFlightRegistry};
