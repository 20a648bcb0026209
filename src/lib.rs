extern crate bytes;
#[macro_use]
extern crate async_trait;

pub mod scgi {
    pub mod defs;
    pub mod error;
    pub mod settings;
    pub mod connection;
    pub mod header;
    pub mod cookie;
    pub mod multipart;
    pub mod request;
    pub mod response;
    pub mod handler;
    pub mod server;
}

pub use scgi::error::Error;
pub use scgi::handler::Handler;
pub use scgi::request::{Method, Request};
pub use scgi::response::Response;
pub use scgi::server::Server;
pub use scgi::settings::{ConfigError, Settings};
