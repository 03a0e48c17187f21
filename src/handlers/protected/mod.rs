// handlers/protected/mod.rs - endpoints behind the JWT middleware (/api/*)

pub mod ai;
pub mod auth;
pub mod billing;
pub mod sync;
pub mod usage;
