//! XBDM wire protocol: framing, status lines, parameters and the memory
//! transfer codecs. Nothing in here touches a socket.

pub mod codec;
pub mod framing;
pub mod params;
pub mod response;

pub use codec::{ChunkAssembler, ChunkHeader, ChunkNeed};
pub use framing::LineBuffer;
pub use params::ParamList;
pub use response::{Response, ResponseType, WireDialect, XbdmDialect};
