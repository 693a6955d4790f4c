pub mod call;
pub mod filter;
pub mod media;
pub mod message;
pub mod parse;
pub mod registry;
pub mod trace;
pub mod types;
pub mod validate;

pub use call::{Attr, Call, CallState, Verdict};
pub use filter::{FilterField, FilterSpec, InvalidPattern};
pub use media::RtpStream;
pub use message::Message;
pub use registry::{CaptureOpts, MatchOpts, MsgRef, Registry, SortSpec, Stats};
pub use trace::{TraceError, TraceReader};
pub use types::*;
pub use validate::PayloadKind;
