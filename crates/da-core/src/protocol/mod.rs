//! Wire-level protocol pieces shared by both engines: framing, constants,
//! status decoding and XML messages.

pub mod constants;
pub mod packet;
pub mod status;
pub mod xml;

pub use constants::{Cmd, CtrlFamily, DevCtrl};
pub use packet::{Channel, DataType, Packet};
pub use status::{decode_text, Domain, ErrorDetail, Severity, StatusWord};
pub use xml::XmlMessage;
