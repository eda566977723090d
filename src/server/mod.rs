// HTTP boundary: routes, headers, and error mapping for the download API.

pub mod handler;

pub use handler::DownloadServer;
