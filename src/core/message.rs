//! Content sub-protocol message types.

#[cfg(feature = "codec")]
use bincode::{Decode, Encode};
use bytes::Bytes;

use crate::core::enr::Enr;

pub type Nonce = u128;

/// Content sub-protocol message variants.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub enum Message {
    /// FINDCONTENT asks a peer for the content stored under a key, or for the peers it knows
    /// closest to the content identifier.
    FindContent(FindContent),
    /// CONTENT is the correct response to FINDCONTENT, it must contain the same NONCE.
    Content(Content),

    /// OFFER advertises content keys the sender is willing to transfer.
    Offer(Offer),
    /// ACCEPT is the correct response to OFFER, it must contain the same NONCE.
    Accept(Accept),
}

impl Message {
    pub fn variant_as_str(&self) -> &str {
        match self {
            Message::FindContent(_) => "find_content",
            Message::Content(_) => "content",
            Message::Offer(_) => "offer",
            Message::Accept(_) => "accept",
        }
    }

    pub fn nonce(&self) -> Nonce {
        match self {
            Message::FindContent(find_content) => find_content.nonce,
            Message::Content(content) => content.nonce,
            Message::Offer(offer) => offer.nonce,
            Message::Accept(accept) => accept.nonce,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Message::Content(_) | Message::Accept(_))
    }
}

/// The data making up a FINDCONTENT message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub struct FindContent {
    pub nonce: Nonce,

    #[cfg_attr(feature = "codec", bincode(with_serde))]
    pub content_key: Bytes,
}

/// The data making up a CONTENT message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub struct Content {
    pub nonce: Nonce,
    pub payload: ContentPayload,
}

/// The three possible answers to a FINDCONTENT request.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub enum ContentPayload {
    /// The content is too large to be inlined, the requester connects to read it over uTP.
    ConnectionId(u16),
    /// The content itself.
    Content {
        #[cfg_attr(feature = "codec", bincode(with_serde))]
        content: Bytes,
    },
    /// The responder doesn't hold the content, these are the peers closest to it it knows of.
    Enrs(Vec<Enr>),
}

/// The data making up an OFFER message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub struct Offer {
    pub nonce: Nonce,

    #[cfg_attr(feature = "codec", bincode(with_serde))]
    pub content_keys: Vec<Bytes>,
}

/// The data making up an ACCEPT message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub struct Accept {
    pub nonce: Nonce,
    /// The uTP connection the offered content is written to, meaningless if nothing is accepted.
    pub connection_id: u16,
    /// One flag per offered key, in the order of the OFFER.
    pub accepted: Vec<bool>,
}

impl Accept {
    /// Returns `true` if at least one offered key was accepted.
    pub fn any_accepted(&self) -> bool {
        self.accepted.iter().any(|accepted| *accepted)
    }
}
