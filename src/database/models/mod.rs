pub mod session;
pub mod subscription;
pub mod user;

pub use session::Session;
pub use subscription::Subscription;
pub use user::User;
