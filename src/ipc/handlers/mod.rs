pub mod attendance;
pub mod core;
pub mod leave;
pub mod qr;
pub mod setup;
pub mod students;
pub mod verification;
