pub mod api;
pub mod config;
pub mod db;
pub mod launcher;
pub mod logging;
pub mod metrics;
pub mod migrations;
pub mod persist;
pub mod server;

pub use api::{ApiError, JobApi, Step};
pub use persist::{PersistClient, PersistError};
pub use launcher::{LaunchError, Launcher, LocalCluster, ProcessLauncher};
