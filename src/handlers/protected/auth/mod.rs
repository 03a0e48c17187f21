// handlers/protected/auth/mod.rs - session endpoints for authenticated callers

pub mod session;

pub use session::{logout, whoami};
