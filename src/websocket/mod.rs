pub mod handler;
pub mod msg_chat_handler;
pub mod msg_ping_handler;
pub mod msg_presence_handler;
pub mod msg_update_handler;
