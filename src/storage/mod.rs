pub mod atomic;
pub mod cookies;
pub mod export;
pub mod session;
