pub mod app;
pub mod channel;
pub mod session;
