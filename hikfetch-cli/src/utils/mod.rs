mod params;

pub use params::{parse_channel_list, parse_datetime};
