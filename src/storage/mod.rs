//! SQLite persistence for feeds, articles, and deletion tombstones.

mod articles;
mod feeds;
mod schema;
mod tombstones;
mod types;

pub use schema::Database;
pub use types::{
    Article, DatabaseError, DateSource, DeletedArticle, Feed, FeedUpdate, InsertError, NewArticle,
};
