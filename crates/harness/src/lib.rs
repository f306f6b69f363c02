pub mod peer;

pub use peer::{
    author, author_row, book, book_row, delta, test_registry, text, MessageBuilder, TestPeer,
    AUTHORS, BOOKS,
};
