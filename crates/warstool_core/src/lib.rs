pub mod capture;
pub mod config;
pub mod crawl;
pub mod extract;
pub mod fetch;
pub mod merge;
pub mod model;
pub mod query;
pub mod rank;
pub mod runtime;
pub mod session;
