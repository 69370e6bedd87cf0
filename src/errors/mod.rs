use crate::pages::PageId;

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    Internal(String),
    /// every frame in the buffer pool is pinned
    PoolExhausted,
    InvalidPage(PageId),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Internal(context) => write!(f, "Internal Error: {context}."),
            Error::PoolExhausted => write!(f, "Buffer pool exhausted, all frames are pinned."),
            Error::InvalidPage(page_id) => write!(f, "Invalid page id {page_id}."),
        }
    }
}

impl std::error::Error for Error {}
