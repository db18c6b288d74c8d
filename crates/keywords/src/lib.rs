//! Keyword definitions and content matching.

pub mod keyword;
pub mod matcher;
pub mod store;

pub use keyword::{Keyword, KeywordCategory, KeywordMetadata, MatchStrategy, NewKeyword};
pub use matcher::{KeywordMatch, KeywordMatcher, MatchFailure, MatchReport};
pub use store::{InMemoryKeywordStore, KeywordError, KeywordStore};
