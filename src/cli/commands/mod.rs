pub mod auth;
pub mod generate;
pub mod pairing;
pub mod sync;
