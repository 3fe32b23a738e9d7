pub mod attributes;
pub mod messages;

pub use attributes::{parse_attributes, parse_nlri_list};
pub use messages::{
    encode_bgp_message, parse_bgp_message, parse_bgp_message_header, BGP_MARKER,
};
