//! Wire protocol spoken over the control channel.

pub mod events;

pub use events::{
    decode, encode, ClientEvent, ContentPart, ConversationItem, ErrorDetail, Modality,
    ResponseOptions, Role, ServerEvent, SessionUpdate, TranscriptionSettings, TurnDetection,
};
