pub mod config;
pub mod crawl;
pub mod data_io;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod gate;
pub mod notify;
pub mod price;
pub mod runtime;
pub mod store;
pub mod types;

pub use runtime::run;
