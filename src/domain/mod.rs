pub mod entry;
pub mod feed;

pub use entry::{CandidateEntry, DownloadMode, DownloaderKind, Entry, EntryQuery, EntryStatus};
pub use feed::{Dialect, Feed, FeedSpec};
