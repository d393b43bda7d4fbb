//! Turns an uploaded application package into a validated, size bounded application directory.
//!
//! A package consists of an archive with the new bits and a list of [`ResourceDescriptor`]s for
//! files the client expects to be copied out of the resource pool. [`PackageIntake`] sizes the
//! archive, enforces the package budget, extracts the archive into a sandbox directory and
//! materializes the pooled resources next to it. Every path that originates from the client, be
//! it an archive entry, a symlink target or a resource destination, is confined to the sandbox by
//! a [`PathGuard`].
//!
//! All blocking work runs on a [`BlockingPool`] so the pipeline can be driven from a
//! single-threaded async runtime that serves other requests at the same time.
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use std::{path::Path, sync::Arc};
//! use droplet_intake::{IntakeConfig, LocalResourcePool, PackageIntake};
//!
//! let config = IntakeConfig::from_path("intake.toml")?;
//! let pool = config
//!     .open_resource_pool()
//!     .unwrap_or_else(|| LocalResourcePool::new("/var/vcap/data/resource_pool"));
//! let intake = PackageIntake::new(&config, Arc::new(pool));
//!
//! let app_dir = intake
//!     .intake(Path::new("/tmp/sandbox"), Some(Path::new("/tmp/upload.zip")), &[])
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod config;
mod descriptor;
mod error;
mod extractor;
mod intake;
pub mod path_guard;
mod quota;
mod repack;
mod skeleton;

pub use archive::{
    ArchiveEntry, ArchiveFormat, ArchiveTool, BuiltinArchiveTool, CommandArchiveTool, EntryKind,
    ToolError,
};
pub use config::{ConfigError, IntakeConfig};
pub use descriptor::{FileMode, ParseFileModeError, ResourceDescriptor};
pub use error::{IntakeError, IntakeErrorKind};
pub use extractor::{verify_sandbox, ArchiveExtractor, ExtractionError};
pub use intake::{PackageIntake, StagedPackage};
pub use path_guard::{EscapeError, PathGuard};
pub use quota::{check_size, QuotaError};
pub use repack::{PackagingError, Repackager};
pub use skeleton::{create_skeleton, SkeletonError};

pub use droplet_blocking::BlockingPool;
pub use droplet_resource_pool::{LocalResourcePool, PoolError, ResourcePool};
