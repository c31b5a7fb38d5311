// ABOUTME: Chat platform implementations of the core connection traits.
// ABOUTME: Matrix is the only platform; the admin directory lives in bihua-core over HTTP.

pub mod matrix;

pub use matrix::{MatrixConnection, MatrixConnector};
