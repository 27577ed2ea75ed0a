pub mod manager;
pub mod token;

pub use manager::{Room, RoomClass, RoomManager, RoomManagerConfig};
pub use token::{RoomToken, TokenClaims};
