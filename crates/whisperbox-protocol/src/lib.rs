pub mod constants;
pub mod encoding;
pub mod envelope;
pub mod error;
pub mod form;
pub mod hash;
pub mod message;
pub mod payload;
pub mod sealing;
pub mod signature;

pub use constants::*;
pub use envelope::Envelope;
pub use error::ProtocolError;
pub use message::MessageKind;
