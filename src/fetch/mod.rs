pub mod extract;
pub mod http;
pub mod xpath;

pub use http::HttpExecutor;
