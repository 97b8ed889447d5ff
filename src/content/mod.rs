//! The content sub-protocol: serving FINDCONTENT and OFFER requests, and finding content in the
//! network with an iterative lookup.
//!
//! Content smaller than [`INLINE_CONTENT_LIMIT`] travels inside the response, anything larger is
//! streamed over uTP.

use thiserror::Error;

use crate::{
    traits::MessengerError,
    utp::UtpError,
};

mod handler;
mod lookup;

pub use handler::ContentHandler;
pub use lookup::{ContentLookup, LookupConfig, LookupResult};

/// Content of this many bytes or more is served over uTP instead of inline.
pub const INLINE_CONTENT_LIMIT: usize = 1280;

/// The maximum number of peers in an ENRS response.
pub const MAX_ENRS: usize = 16;

/// Errors of a single request to a peer.
///
/// These never fail a lookup, they mark the content as unavailable from that peer.
#[derive(Debug, Clone, Error)]
pub enum ContentError {
    #[error(transparent)]
    Messenger(#[from] MessengerError),
    #[error(transparent)]
    Utp(#[from] UtpError),
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}
