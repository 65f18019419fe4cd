pub mod member_addr;
pub mod message;
