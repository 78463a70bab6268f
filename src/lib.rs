#![warn(rust_2018_idioms)]
#![warn(clippy::dbg_macro, clippy::print_stdout)]
#![doc = include_str!("../README.md")]

pub mod cgi;
mod error;
pub mod fastcgi;
pub mod http_adaptor;
mod record;
pub mod requester;
pub mod response;
pub mod scgi;
mod stream;

pub use crate::error::{ClientError, ClientResult};
pub use crate::requester::Requester;
