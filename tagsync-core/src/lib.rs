mod client;
mod error;
mod oauth;
mod retry;
mod token;

pub use client::{
    Delta, DeletedMetadata, Download, FileMetadata, FolderMetadata, RemoteClient, RemoteEntry,
    parse_rfc3339_ms,
};
pub use error::RemoteError;
pub use reqwest::StatusCode;
pub use oauth::{OAuthClient, OAuthToken, PkcePair, code_challenge, generate_pkce_pair};
pub use retry::{Backoff, DEFAULT_MAX_ATTEMPTS, RetryPolicy, StatusClass, classify_status};
pub use token::{Credentials, TokenProvider};
