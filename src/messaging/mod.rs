pub mod cm_messages;
pub mod codes;
pub mod mad;
pub mod transport;
