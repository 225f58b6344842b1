//! Sequential streaming over partially downloaded content.
//!
//! A [`StreamReader`] turns the piece store into an ordered byte stream for
//! one HTTP range request, gating output on a lookahead buffer instead of
//! requiring the whole file up front.

pub mod media;
pub mod reader;

pub use reader::{StreamError, StreamReader};
