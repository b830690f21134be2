use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}
