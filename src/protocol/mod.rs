//! Cloud message model and topic grammar
//!
//! Everything here is pure data: the payload model, outbound and inbound message
//! envelopes and the topic router.

pub mod message;
pub mod payload;
pub mod topics;

pub use message::*;
pub use payload::*;
pub use topics::*;
