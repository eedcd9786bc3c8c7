pub mod decode;
pub mod record;

pub use self::decode::{decode_lines, DecodeError, Decoded, DecodedLine, StreamDecoder};
pub use self::record::{ChangeDetail, ChangeType, EventKey, EventRecord, EventType, Resource};
