//! Wire framing, notification payload encoding and address parsing.

pub mod address;
pub mod codec;

pub use address::{parse_address, AddressError, DEFAULT_ANNOUNCE_PORT, DEFAULT_GAME_PORT, DEFAULT_HOST};
pub use codec::{
    decode_frame, decode_length, decode_notification, encode_frame, encode_length, encode_notification,
    frame_notification, FrameDecoder, OversizePolicy, ProtocolError, RecvState, LENGTH_PREFIX_SIZE,
};
