pub mod api;
pub mod build;
pub mod config;
pub mod error;
pub mod logs;
pub mod manager;
pub mod registry;
pub mod router;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod vcs;

#[cfg(test)]
mod test_support;
