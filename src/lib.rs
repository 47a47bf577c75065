pub mod content;
pub mod ingest;
pub mod logging;
pub mod media;
pub mod protocol;
pub mod storage;
pub mod web_client;
