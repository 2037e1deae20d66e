pub mod context;
pub mod error;
pub mod service;

pub use context::AppContext;
pub use error::{ConfigError, DownloadError, FetchError, FreshetError, Result};
pub use service::{EntryPage, FeedStatus, Service};
