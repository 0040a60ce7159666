// ftp module: control/data connection plumbing, reply parsing, login scripts
// and the listing-parser seam. Servers are treated as opaque 3-digit codes
// plus free text; no protocol syntax beyond that is interpreted here.
pub mod control;
pub mod data;
pub mod listing;
pub mod reply;
pub mod script;

pub use control::{ControlConnection, TransferType};
pub use data::{parse_pasv_reply, DataConnState};
pub use listing::{ListingEntry, ListingEntryKind, ParseListing, PathStyle, SizeInfo};
pub use reply::{Reply, ReplyClass};
