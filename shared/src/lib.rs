//! Student enrollment workflows shared by the HTTP service and its tests:
//! configuration, error types, the storage seam with its Postgres and
//! in-memory backends, and the transactional create/enroll/update/delete
//! operations built on top of it.

pub mod age;
pub mod batch;
pub mod competency;
pub mod config;
pub mod context;
pub mod db;
pub mod dto;
pub mod enrollment;
pub mod error;
pub mod identity;
pub mod memory;
pub mod roster;
pub mod store;
pub mod update;
