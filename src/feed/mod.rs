pub mod reader;
pub mod source;

pub use reader::{FeedReader, PollOutcome};
pub use source::{ChangeFeedSource, FeedPage, InMemoryChangeFeed};
