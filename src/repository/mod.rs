pub mod proxy;

pub use proxy::{ActiveRecords, ProxyRepository, RepositoryState};
