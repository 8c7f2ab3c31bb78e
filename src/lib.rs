//! # gsm-migrate
//!
//! One-shot migration of Secret Manager secrets between cloud projects.
//!
//! Secrets whose id carries the marker token (`psid_` by default) are listed
//! from the source project, filtered through an ignore list, and then either
//! copied into the destination project or backed up to local JSON files and
//! deleted from the source. At most five secrets are in flight at once.
//!
//! ## Architecture
//!
//! ```text
//!   ignore.psids ──▶ IgnoreSet ─┐
//!                               ▼
//!   SecretStore ──list──▶ lister ──candidates──▶ Migrator (5 slots)
//!        ▲                                          │
//!        └──── access / create / delete ────────────┤
//!                                                   ▼
//!                                   backup/<key>.json (delete mode)
//! ```
//!
//! ## Modules
//! - `key`: resource path parsing and canonical key rules
//! - `store`: the `SecretStore` trait with REST and in-memory implementations
//! - `lister`, `migrate`, `backup`: the pipeline stages
//! - `run`: orchestration and the `MigrationReport`

pub mod backup;
pub mod config;
pub mod ignore;
pub mod key;
pub mod lister;
pub mod migrate;
pub mod report;
pub mod run;
pub mod store;

pub use config::{Config, RunMode};
pub use report::MigrationReport;
pub use run::{run, RunError};
pub use store::{GcpSecretStore, MemorySecretStore, SecretStore};
