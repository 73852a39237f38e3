#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("scheduler request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("scheduler returned HTTP {status} for {path}: {body}")]
    Status {
        path: String,
        status: u16,
        body: String,
    },

    #[error("scheduler reported errors for {path}: {messages}")]
    Api { path: String, messages: String },

    #[error("undecodable scheduler reply for {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("scheduler node {0} not found")]
    NodeNotFound(String),

    #[error("invalid scheduler client config: {0}")]
    Config(String),
}
