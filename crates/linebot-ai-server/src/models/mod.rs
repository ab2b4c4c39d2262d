pub mod chat;
pub mod history;
pub mod message;
pub mod user;

pub use chat::{ConversationTurn, Role, UserKey};
pub use message::{
    ImageReply, ImageUpload, InboundMessage, InboundPayload, OutboundReply, ReplySource,
    TextReply,
};
