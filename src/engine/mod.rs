pub mod controller;
pub mod executor;
pub mod filter;
pub mod registry;
pub mod scheduler;
pub mod task;
pub mod view;
