//! # tether-protocol
//!
//! Wire protocol definitions for the Tether group relay.
//!
//! This crate defines the events exchanged between clients and the relay
//! over a persistent connection, and the codecs used to put them on the wire.
//!
//! ## Events
//!
//! - `join-family` / `leave-family` - Associate a connection with a group member
//! - `update-location` - Share the member's position
//! - `send-message` / `send-sos` - Chat and alerts
//! - `family-members`, `member-joined`, `member-left`, ... - Server fan-out
//!
//! ## Example
//!
//! ```rust
//! use tether_protocol::{codec, ClientEvent, Encoding, Location};
//!
//! let event = ClientEvent::location("ABC123", "member-1", Location::new(48.85, 2.35));
//!
//! // Encode and decode
//! let encoded = codec::encode_binary(&event).unwrap();
//! let decoded: ClientEvent = codec::decode_binary(&encoded).unwrap();
//! assert_eq!(decoded, event);
//!
//! let text = codec::encode(&event, Encoding::Json).unwrap();
//! assert!(!text.is_empty());
//! ```

pub mod codec;
pub mod events;

pub use codec::{decode_binary, decode_text, encode, Encoded, Encoding, ProtocolError};
pub use events::{
    ClientEvent, EventKind, Leave, Location, MemberInfo, ServerEvent, Timestamp, PROTOCOL_VERSION,
};
